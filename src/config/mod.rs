//! Unified configuration data model (§3): `Configuration` (as parsed from
//! YAML) and its validated, defaulted, absolute-path form `ResolvedConfig`.

pub mod auth;
pub mod partition;
pub mod script;

use std::{
	collections::BTreeMap,
	path::{Path, PathBuf},
};

use color_eyre::Result;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::OkonomiError;

pub use auth::User;
pub use partition::{Disk, Partition, PartitionLayout};
pub use script::{Script, ScriptsManifest};

#[derive(Deserialize, Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SelinuxMode {
	Enforcing,
	Permissive,
	Disabled,
}

impl SelinuxMode {
	pub fn config_value(&self) -> &'static str {
		match self {
			Self::Enforcing => "enforcing",
			Self::Permissive => "permissive",
			Self::Disabled => "disabled",
		}
	}
}

#[derive(Deserialize, Debug, Clone, Serialize, Default)]
pub struct Input {
	/// Path to an existing base image file (raw/VHD/VHDX/QCOW2), mutually
	/// exclusive with an OCI source.
	#[serde(default)]
	pub image_file: Option<PathBuf>,
	#[serde(default)]
	pub oci_uri: Option<String>,
}

#[derive(Deserialize, Debug, Clone, Serialize, Default)]
pub struct Storage {
	#[serde(default)]
	pub disks: Vec<Disk>,
	#[serde(default)]
	pub verity: Option<VerityConfig>,
}

#[derive(Deserialize, Debug, Clone, Serialize)]
pub struct VerityConfig {
	pub data_partition: String,
	pub hash_partition: String,
}

#[derive(Deserialize, Debug, Clone, Serialize, Default)]
pub struct CopyFile {
	pub source: PathBuf,
	pub destination: PathBuf,
}

#[derive(Deserialize, Debug, Clone, Serialize, Default)]
pub struct Os {
	#[serde(default)]
	pub packages: Vec<String>,
	#[serde(default)]
	pub rpm_sources: Vec<PathBuf>,
	#[serde(default)]
	pub users: Vec<User>,
	#[serde(default)]
	pub services_enable: Vec<String>,
	#[serde(default)]
	pub services_disable: Vec<String>,
	#[serde(default)]
	pub modules_load: Vec<String>,
	#[serde(default)]
	pub modules_blacklist: Vec<String>,
	#[serde(default)]
	pub additional_files: Vec<CopyFile>,
	#[serde(default)]
	pub additional_dirs: Vec<PathBuf>,
	#[serde(default)]
	pub kernel_command_line: Vec<String>,
	#[serde(default)]
	pub selinux: Option<SelinuxMode>,
	#[serde(default)]
	pub hostname: Option<String>,
	#[serde(default)]
	pub fips: bool,
	#[serde(default)]
	pub ima_policy: Vec<String>,
	#[serde(default)]
	pub cgroup_v1: Option<bool>,
	#[serde(default)]
	pub package_snapshot_time: Option<String>,
}

#[derive(Deserialize, Debug, Clone, Serialize, Default)]
pub struct IsoConfig {
	#[serde(default)]
	pub enable_bios_boot: bool,
	#[serde(default)]
	pub os_files_dir: Option<PathBuf>,
	#[serde(default)]
	pub extra_files: Vec<CopyFile>,
}

#[derive(Deserialize, Debug, Clone, Serialize, Default)]
pub struct PxeConfig {
	#[serde(default)]
	pub extra_files: Vec<CopyFile>,
}

#[derive(Deserialize, Debug, Clone, Copy, Serialize, PartialEq, Eq, Default, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
#[value(rename_all = "kebab-case")]
pub enum OutputImageFormat {
	#[default]
	Raw,
	Vhd,
	VhdFixed,
	Vhdx,
	Qcow2,
	Iso,
	PxeDir,
	PxeTar,
	Cosi,
	BaremetalImage,
}

#[derive(Deserialize, Debug, Clone, Serialize, Default)]
pub struct Output {
	pub path: PathBuf,
	#[serde(default)]
	pub format: OutputImageFormat,
	#[serde(default)]
	pub compression_level: Option<i32>,
}

/// The root of a YAML configuration file, as authored by a user.
#[derive(Deserialize, Debug, Clone, Serialize, Default)]
pub struct Configuration {
	#[serde(default)]
	pub input: Input,
	#[serde(default)]
	pub storage: Storage,
	#[serde(default)]
	pub os: Os,
	#[serde(default)]
	pub iso: Option<IsoConfig>,
	#[serde(default)]
	pub pxe: Option<PxeConfig>,
	pub output: Output,
	#[serde(default)]
	pub scripts: ScriptsManifest,
	#[serde(default)]
	pub distro: Option<String>,
	#[serde(default)]
	pub distro_version: Option<String>,
}

impl Configuration {
	/// Loads and deserializes a YAML configuration file. Relative paths
	/// inside it are left as-authored here; `ResolvedConfig::resolve`
	/// performs the path-resolution pass against the file's parent
	/// directory.
	pub fn load(path: &Path) -> Result<Self> {
		let text = std::fs::read_to_string(path).map_err(|e| OkonomiError::io(path, e))?;
		let cfg: Self = serde_yaml::from_str(&text)
			.map_err(|e| OkonomiError::config("<root>", format!("failed to parse YAML: {e}")))?;
		Ok(cfg)
	}
}

/// Which driver mode the pipeline is running under; determines which
/// fields of `Configuration` are mandatory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
	Create,
	Customize,
	InjectFiles,
}

/// The validated, absolute-path, defaulted form of `Configuration`, plus
/// derived build-time locations.
pub struct ResolvedConfig {
	pub raw: Configuration,
	pub mode: Mode,
	pub build_dir_abs: PathBuf,
	pub raw_image_file: PathBuf,
	pub output_image_file: PathBuf,
	pub output_image_dir: PathBuf,
	pub output_image_base: String,
	pub image_uuid: Uuid,
}

impl ResolvedConfig {
	/// Expands relative paths against `config_dir`, applies CLI overrides
	/// (which win only when actually supplied), generates a fresh image
	/// UUID, and derives build-time locations under `build_dir`.
	pub fn resolve(
		mut raw: Configuration, mode: Mode, config_dir: &Path, build_dir: &Path,
		output_file_override: Option<PathBuf>, output_format_override: Option<OutputImageFormat>,
	) -> Result<Self> {
		for rpm_source in &mut raw.os.rpm_sources {
			*rpm_source = resolve_relative(config_dir, rpm_source);
		}
		for file in &mut raw.os.additional_files {
			file.source = resolve_relative(config_dir, &file.source);
		}
		for script in raw.scripts.pre.iter_mut().chain(raw.scripts.post.iter_mut()) {
			if let Some(f) = &script.file {
				script.file = Some(resolve_relative(config_dir, f));
			}
		}

		if let Some(path) = output_file_override {
			raw.output.path = path;
		}
		if let Some(format) = output_format_override {
			raw.output.format = format;
		}

		let build_dir_abs = build_dir.canonicalize().unwrap_or_else(|_| build_dir.to_path_buf());
		let raw_image_file = build_dir_abs.join("raw.tmp");
		let output_image_file = raw.output.path.clone();
		let output_image_dir = output_image_file
			.parent()
			.map(Path::to_path_buf)
			.unwrap_or_else(|| PathBuf::from("."));
		let output_image_base = output_image_file
			.file_stem()
			.map(|s| s.to_string_lossy().to_string())
			.unwrap_or_else(|| "image".to_string());

		Ok(Self {
			raw,
			mode,
			build_dir_abs,
			raw_image_file,
			output_image_file,
			output_image_dir,
			output_image_base,
			image_uuid: Uuid::new_v4(),
		})
	}

	/// Rejects unsupported field combinations for the selected mode and
	/// verifies mandatory fields. No side effects.
	pub fn validate(&self, tools_tarball: Option<&Path>) -> Result<()> {
		match self.mode {
			Mode::Create => {
				if self.raw.storage.disks.is_empty() {
					return Err(OkonomiError::config("storage.disks", "create mode requires at least one disk").into());
				}
				if self.raw.os.rpm_sources.is_empty() {
					return Err(OkonomiError::config("os.rpm_sources", "create mode requires at least one RPM source").into());
				}
				let Some(tools) = tools_tarball else {
					return Err(OkonomiError::config("tools_file", "create mode requires a tools tarball").into());
				};
				crate::tarcodec::validate_tar_gz_header(tools)?;
			},
			Mode::Customize => {
				if self.raw.input.image_file.is_none() && self.raw.input.oci_uri.is_none() {
					return Err(OkonomiError::config("input", "customize mode requires an image file or OCI URI").into());
				}
			},
			Mode::InjectFiles => {
				if self.raw.input.image_file.is_none() {
					return Err(OkonomiError::config("input.image_file", "inject-files mode requires an image file").into());
				}
				if !self.raw.storage.disks.is_empty() {
					return Err(OkonomiError::config("storage.disks", "inject-files mode does not support reshaping storage").into());
				}
			},
		}
		Ok(())
	}
}

fn resolve_relative(base: &Path, path: &Path) -> PathBuf {
	if path.is_absolute() {
		path.to_path_buf()
	} else {
		base.join(path)
	}
}

/// Partition-index to mountpoint map, used by the resolve/validate stages
/// to decide mount ordering for `connection::ImageConnection`.
pub type PartitionMountMap = BTreeMap<usize, PathBuf>;

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn resolve_relative_paths_join_config_dir() {
		let base = Path::new("/etc/okonomi");
		assert_eq!(resolve_relative(base, Path::new("scripts/a.sh")), PathBuf::from("/etc/okonomi/scripts/a.sh"));
		assert_eq!(resolve_relative(base, Path::new("/abs/a.sh")), PathBuf::from("/abs/a.sh"));
	}
}
