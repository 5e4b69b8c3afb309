//! Customization pipeline (component L): the three driver modes share one
//! validate-then-run core over the ten ordered stages of §4.L.

pub mod packages;
pub mod partition;
pub mod selinux;
pub mod systemd;
pub mod users;

use std::{
	fs,
	path::{Path, PathBuf},
};

use color_eyre::{eyre::eyre, Result};
use tracing::{info, warn};

use crate::{
	bootloader::{BootloaderWriter, GrubDefaultsVars},
	config::{partition::PartitionLayout, Mode, OutputImageFormat, ResolvedConfig},
	connection::{ImageConnection, PartitionMount},
	exec::Executor,
	fileutil,
};

/// Default targeted-policy file-contexts path passed to `setfiles` during
/// the stage-9 relabel.
const SELINUX_CONTEXT_FILE: &str = "/etc/selinux/targeted/contexts/files/file_contexts";

/// Drives one `create`/`customize`/`inject-files` run end to end. Holds no
/// state across runs; every field is scoped to a single `run()` call.
pub struct Pipeline {
	pub config: ResolvedConfig,
	pub tools_tarball: Option<PathBuf>,
	pub arch: String,
}

/// A minimal root-partition description for `customize`/`inject-files`,
/// whose incoming image's partition table is not reshaped and whose exact
/// filesystem is not otherwise known ahead of a `blkid` probe; `ext4` covers
/// the common case produced by `create`.
fn root_partition_stub() -> crate::config::partition::Partition {
	crate::config::partition::Partition {
		label: None,
		partition_type: crate::config::partition::PartitionType::Root,
		flags: None,
		size: None,
		filesystem: "ext4".to_string(),
		mountpoint: "/".to_string(),
		subvolumes: Vec::new(),
		luks_mapper_name: None,
		verity: false,
	}
}

impl Pipeline {
	pub fn new(config: ResolvedConfig, tools_tarball: Option<PathBuf>, arch: String) -> Self {
		Self { config, tools_tarball, arch }
	}

	/// Stages 2-10. Stage 1 (resolve) has already happened by the time a
	/// `ResolvedConfig` exists; see `config::ResolvedConfig::resolve`.
	pub fn run(&self) -> Result<()> {
		info!(mode = ?self.config.mode, "starting pipeline");
		self.config.validate(self.tools_tarball.as_deref())?;

		fs::create_dir_all(&self.config.build_dir_abs)?;
		self.acquire_image()?;

		let mut conn = ImageConnection::new();
		let result = self.connect_and_customize(&mut conn);

		let close_result = conn.close();
		if let Err(e) = &close_result {
			warn!(error = %e, "image connection teardown reported an error");
		}

		let result = result.and(close_result.map_err(|e| eyre!("{e}")));
		result?;

		self.finalize()?;
		info!("pipeline finished");
		Ok(())
	}

	/// Stage 3: start from a base image or create+partition a fresh raw file.
	fn acquire_image(&self) -> Result<()> {
		match self.config.mode {
			Mode::Create => {
				let disk = self.config.raw.storage.disks.first().ok_or_else(|| eyre!("create mode requires at least one disk"))?;
				let size = disk.size.map(|s| s.as_u64()).ok_or_else(|| eyre!("disk has no size set"))?;
				info!(size, path = ?self.config.raw_image_file, "creating fresh raw image");
				fileutil::create_sparse(&self.config.raw_image_file, size)?;
				self.partition_fresh_image(&disk.layout)?;
			},
			Mode::Customize | Mode::InjectFiles => {
				let source = self.config.raw.input.image_file.as_ref().ok_or_else(|| eyre!("no input image file configured"))?;
				info!(from = ?source, to = ?self.config.raw_image_file, "copying base image into build dir");
				fs::copy(source, &self.config.raw_image_file)?;
			},
		}
		Ok(())
	}

	fn partition_fresh_image(&self, layout: &PartitionLayout) -> Result<()> {
		let image = self.config.raw_image_file.to_string_lossy().to_string();
		Executor::new("parted").arg("--script").arg(&image).arg("mklabel").arg("gpt").run()?;

		for (index, part) in &layout.partitions {
			let guid = part.partition_type.uuid(&self.arch);
			let start = format!("{}%", (index.saturating_sub(1)) * 100 / layout.partitions.len().max(1));
			let end = format!("{}%", index * 100 / layout.partitions.len().max(1));
			Executor::new("parted")
				.arg("--script")
				.arg(&image)
				.arg("mkpart")
				.arg(part.label.clone().unwrap_or_else(|| "primary".into()))
				.arg(&start)
				.arg(&end)
				.run()?;
			Executor::new("sgdisk").arg("--typecode").arg(format!("{index}:{guid}")).arg(&image).run()?;
		}
		Ok(())
	}

	/// Stages 4-9: attach the image, mount the chroot, run every
	/// customization stage, and run the bootloader/SELinux steps. The chroot
	/// and loopback are closed by the caller regardless of this function's
	/// result.
	fn connect_and_customize(&self, conn: &mut ImageConnection) -> Result<()> {
		conn.connect_loopback(&self.config.raw_image_file)?;

		// `customize`/`inject-files` never reshape storage (validated at
		// stage 2), so the incoming image's partition table is taken as
		// given: mount partition 1 at "/" and leave any further partitions
		// for the base image's own fstab to have already accounted for.
		let partitions = match self.config.mode {
			Mode::Create => self.config.raw.storage.disks.first().map(|d| d.layout.sort_by_mountpoint()).unwrap_or_default(),
			Mode::Customize | Mode::InjectFiles => vec![(1, root_partition_stub())],
		};
		let mounts: Vec<PartitionMount> = partitions
			.iter()
			.map(|(index, part)| PartitionMount {
				partition_index: *index,
				mountpoint: PathBuf::from(&part.mountpoint),
				fstype: if part.filesystem == "efi" { "vfat".to_string() } else { part.filesystem.clone() },
			})
			.collect();

		let root_dir = self.config.build_dir_abs.join("root");
		conn.connect_chroot(&root_dir, false, &[], &mounts, true)?;
		let chroot = conn.chroot().ok_or_else(|| eyre!("chroot failed to initialize"))?;

		if matches!(self.config.mode, Mode::Create) {
			self.format_and_fstab(conn, &partitions)?;
		}

		if !matches!(self.config.mode, Mode::InjectFiles) {
			self.install_packages(&root_dir)?;
		}

		self.apply_mutations(chroot, &root_dir)?;
		self.systemd_cleanup(&root_dir)?;

		if matches!(self.config.mode, Mode::Create) {
			self.write_bootloader(conn, chroot, &root_dir, &partitions)?;
		}

		self.selinux_relabel(chroot, &partitions)?;

		Ok(())
	}

	fn format_and_fstab(&self, conn: &ImageConnection, partitions: &[(usize, crate::config::partition::Partition)]) -> Result<()> {
		let loopback = conn.loopback().ok_or_else(|| eyre!("loopback not attached"))?;

		for (index, part) in partitions {
			let device = loopback.partition_path(*index);
			partition::format_partition(&device, &part.filesystem, part.label.as_deref())?;
		}

		let lines = partition::build_fstab_lines(partitions, partition::MountIdentifier::Uuid, |index, _| {
			partition::query_identity(&loopback.partition_path(index))
		})?;
		let root_dir = self.config.build_dir_abs.join("root");
		fileutil::just_write(root_dir.join("etc/fstab"), partition::render_fstab(&lines))?;
		Ok(())
	}

	/// Stage 5.
	fn install_packages(&self, root_dir: &Path) -> Result<()> {
		let os = &self.config.raw.os;
		if os.packages.is_empty() {
			return Ok(());
		}
		let exec = match self.config.raw.distro.as_deref() {
			Some("azurelinux") => "tdnf",
			_ => "dnf",
		};
		let install = packages::PackageInstall {
			exec,
			packages: &os.packages,
			exclude: &[],
			releasever: self.config.raw.distro_version.as_deref().unwrap_or("latest"),
			arch: Some(&self.arch),
			repodir: os.rpm_sources.first().map(PathBuf::as_path),
			package_snapshot_time: os.package_snapshot_time.as_deref(),
		};
		install.run(root_dir)
	}

	/// Stage 6: pre-scripts, files/dirs/users/services/modules/hostname,
	/// post-scripts.
	fn apply_mutations(&self, chroot: &crate::chroot::SafeChroot, root_dir: &Path) -> Result<()> {
		let os = &self.config.raw.os;

		self.run_scripts(&self.config.raw.scripts.pre, chroot)?;

		let files: Vec<(PathBuf, PathBuf)> = os.additional_files.iter().map(|f| (f.source.clone(), f.destination.clone())).collect();
		chroot.add_files(&files)?;
		chroot.add_dirs(&os.additional_dirs)?;

		for user in &os.users {
			users::create_and_configure(user, chroot)?;
		}

		for service in &os.services_enable {
			systemd::enable_service(root_dir, service)?;
		}
		for service in &os.services_disable {
			systemd::disable_service(root_dir, service)?;
		}

		if !os.modules_load.is_empty() {
			fileutil::just_write(root_dir.join("etc/modules-load.d/okonomi.conf"), os.modules_load.join("\n") + "\n")?;
		}
		if !os.modules_blacklist.is_empty() {
			let lines: Vec<String> = os.modules_blacklist.iter().map(|m| format!("blacklist {m}")).collect();
			fileutil::just_write(root_dir.join("etc/modprobe.d/okonomi-blacklist.conf"), lines.join("\n") + "\n")?;
		}

		if let Some(hostname) = &os.hostname {
			systemd::write_hostname(root_dir, hostname)?;
		}

		self.run_scripts(&self.config.raw.scripts.post, chroot)?;

		Ok(())
	}

	fn run_scripts(&self, scripts: &[crate::config::Script], chroot: &crate::chroot::SafeChroot) -> Result<()> {
		for script in crate::config::script::order_scripts(scripts)? {
			script.execute(chroot)?;
		}
		Ok(())
	}

	/// Stage 7.
	fn systemd_cleanup(&self, root_dir: &Path) -> Result<()> {
		systemd::reset_machine_id(root_dir, false)?;
		systemd::remove_boot_state_files(root_dir)
	}

	/// Stage 8.
	fn write_bootloader(
		&self, conn: &ImageConnection, chroot: &crate::chroot::SafeChroot, root_dir: &Path,
		partitions: &[(usize, crate::config::partition::Partition)],
	) -> Result<()> {
		let os = &self.config.raw.os;
		let kernel_version = crate::bootloader::installed_kernel_version(root_dir).ok();
		let _ = kernel_version;
		let loopback = conn.loopback().ok_or_else(|| eyre!("loopback not attached"))?;

		let root_part = partitions
			.iter()
			.find(|(_, part)| part.mountpoint == "/")
			.ok_or_else(|| eyre!("no root partition found to derive bootloader variables from"))?;
		let boot_part = partitions.iter().find(|(_, part)| part.mountpoint == "/boot").unwrap_or(root_part);

		let boot_identity = partition::query_identity(&loopback.partition_path(boot_part.0))?;
		let boot_uuid: uuid::Uuid = boot_identity
			.uuid
			.as_ref()
			.and_then(|u| u.parse().ok())
			.ok_or_else(|| eyre!("failed to query a UUID for the boot partition"))?;

		let root_partition = if let Some(mapper) = &root_part.1.luks_mapper_name {
			format!("/dev/mapper/{mapper}")
		} else {
			let root_identity = partition::query_identity(&loopback.partition_path(root_part.0))?;
			partition::format_mount_identifier(partition::MountIdentifier::Uuid, &root_identity)?
		};

		let boot_prefix = if boot_part.0 == root_part.0 { String::new() } else { "/boot".to_string() };

		let selinux = match os.selinux {
			Some(crate::config::SelinuxMode::Enforcing) => crate::bootloader::SelinuxCmdline::Enforcing,
			Some(crate::config::SelinuxMode::Permissive) => crate::bootloader::SelinuxCmdline::Permissive,
			Some(crate::config::SelinuxMode::Disabled) | None => crate::bootloader::SelinuxCmdline::Off,
		};

		let vars = GrubDefaultsVars {
			boot_uuid,
			boot_prefix,
			root_partition,
			luks_uuid: None,
			lvm_root_vol: None,
			ima_policy: os.ima_policy.clone(),
			selinux,
			fips: os.fips,
			cgroup_unified: os.cgroup_v1.map(|v1| !v1),
			extra_command_line: os.kernel_command_line.join(" "),
			distributor: self.config.raw.distro.clone().unwrap_or_else(|| "okonomi".to_string()),
		};

		let writer = BootloaderWriter { install_root: root_dir, target_disk: &self.config.raw_image_file, vars };
		writer.install_legacy(chroot)?;
		writer.install_efi(chroot)?;
		writer.regenerate_grub_cfg(chroot)
	}

	/// Stage 9: SELinux config-file update plus a full relabel of every
	/// ext/xfs/btrfs mount, skipped when no SELinux mode is configured
	/// (directly or via a kernel command-line token).
	fn selinux_relabel(&self, chroot: &crate::chroot::SafeChroot, partitions: &[(usize, crate::config::partition::Partition)]) -> Result<()> {
		let Some(mode) = self.resolve_selinux_mode() else { return Ok(()) };
		selinux::update_selinux_config(mode.clone(), &chroot.root_dir)?;
		if mode == crate::config::SelinuxMode::Disabled {
			return Ok(());
		}

		let mounts: Vec<&str> = partitions
			.iter()
			.filter(|(_, part)| matches!(part.filesystem.as_str(), "ext2" | "ext3" | "ext4" | "xfs" | "btrfs"))
			.map(|(_, part)| part.mountpoint.as_str())
			.collect();

		selinux::relabel(chroot, &mounts, SELINUX_CONTEXT_FILE)
	}

	/// Resolves the effective SELinux mode: an explicit `os.selinux` wins;
	/// otherwise the first recognized token in `os.kernel_command_line` is
	/// used, falling back to "not configured" (relabel skipped entirely).
	fn resolve_selinux_mode(&self) -> Option<crate::config::SelinuxMode> {
		let os = &self.config.raw.os;
		if let Some(mode) = &os.selinux {
			return Some(mode.clone());
		}
		os.kernel_command_line.iter().find_map(|token| selinux::mode_from_kernel_cmdline_token(token).ok())
	}

	/// Stage 10: convert the raw build-dir image into the requested output
	/// format.
	fn finalize(&self) -> Result<()> {
		fs::create_dir_all(&self.config.output_image_dir)?;
		match self.config.raw.output.format {
			OutputImageFormat::Raw => {
				fs::copy(&self.config.raw_image_file, &self.config.output_image_file)?;
			},
			OutputImageFormat::Vhd | OutputImageFormat::VhdFixed | OutputImageFormat::Vhdx | OutputImageFormat::Qcow2 => {
				self.convert_with_qemu_img()?;
			},
			OutputImageFormat::Iso => {
				self.build_iso()?;
			},
			OutputImageFormat::PxeDir | OutputImageFormat::PxeTar => {
				self.build_pxe()?;
			},
			OutputImageFormat::Cosi => {
				self.build_cosi()?;
			},
			OutputImageFormat::BaremetalImage => {
				fs::copy(&self.config.raw_image_file, &self.config.output_image_file)?;
			},
		}
		Ok(())
	}

	fn convert_with_qemu_img(&self) -> Result<()> {
		let (format_arg, subformat) = match self.config.raw.output.format {
			OutputImageFormat::Vhd => ("vpc", None),
			OutputImageFormat::VhdFixed => ("vpc", Some("subformat=fixed")),
			OutputImageFormat::Vhdx => ("vhdx", None),
			OutputImageFormat::Qcow2 => ("qcow2", None),
			_ => unreachable!("convert_with_qemu_img only called for qemu-img-backed formats"),
		};

		let mut executor = Executor::new("qemu-img")
			.arg("convert")
			.arg("-O")
			.arg(format_arg)
			.arg("-f")
			.arg("raw");
		if let Some(opts) = subformat {
			executor = executor.arg("-o").arg(opts);
		}
		executor
			.arg(self.config.raw_image_file.to_string_lossy().to_string())
			.arg(self.config.output_image_file.to_string_lossy().to_string())
			.run()
	}

	fn build_iso(&self) -> Result<()> {
		let staging_dir = self.config.build_dir_abs.join("iso-staging");
		let root_dir = self.config.build_dir_abs.join("root");
		let kver = crate::bootloader::installed_kernel_version(&root_dir)?;
		let initrd_path = root_dir.join("boot").join(format!("initramfs-{}.{}.{}.img", kver.major, kver.minor, kver.patch));

		let iso_cfg = self.config.raw.iso.as_ref();
		let gen = crate::isostage::IsoGenConfig {
			build_dir: self.config.build_dir_abs.clone(),
			staging_dir,
			initrd_path,
			enable_bios_boot: iso_cfg.map(|c| c.enable_bios_boot).unwrap_or(false),
			iso_os_files_dir: iso_cfg.and_then(|c| c.os_files_dir.clone()),
			output_file: self.config.output_image_file.clone(),
		};
		gen.build(&self.arch)
	}

	fn build_pxe(&self) -> Result<()> {
		let root_dir = self.config.build_dir_abs.join("root");
		match self.config.raw.output.format {
			OutputImageFormat::PxeDir => {
				fileutil::copy_tree(&root_dir, &self.config.output_image_file)
			},
			OutputImageFormat::PxeTar => {
				crate::tarcodec::create_tar_gz(&root_dir, &self.config.output_image_file)
			},
			_ => unreachable!(),
		}
	}

	/// Composite object image: a zstd-compressed tarball of the partition
	/// images at `output.compression_level` (default 9).
	fn build_cosi(&self) -> Result<()> {
		let level = self.config.raw.output.compression_level.unwrap_or(9);
		let root_dir = self.config.build_dir_abs.join("root");

		let out_file = fs::File::create(&self.config.output_image_file)
			.map_err(|e| crate::error::OkonomiError::io(&self.config.output_image_file, e))?;
		let encoder = zstd::stream::write::Encoder::new(out_file, level)
			.map_err(|e| eyre!("failed to start zstd encoder: {e}"))?;
		let mut builder = tar::Builder::new(encoder);
		builder.append_dir_all(".", &root_dir)?;
		let encoder = builder.into_inner()?;
		encoder.finish().map_err(|e| eyre!("failed to finish zstd stream: {e}"))?;

		info!(level, output = ?self.config.output_image_file, "COSI image written");
		Ok(())
	}
}
