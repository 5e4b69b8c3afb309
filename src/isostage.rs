//! ISO/initrd staging (component K): El Torito ISO build with a UEFI boot
//! image, shim/grub extraction from the initrd, and the "Rufus
//! workaround", using `xorriso`/`squashfs`/`dracut`.

use std::{
	fs,
	path::{Path, PathBuf},
};

use color_eyre::{eyre::eyre, Result};
use tracing::info;

use crate::{bootloader::efi_boot_filenames, cpio, exec::Executor};

pub struct IsoGenConfig {
	pub build_dir: PathBuf,
	pub staging_dir: PathBuf,
	pub initrd_path: PathBuf,
	pub enable_bios_boot: bool,
	pub iso_os_files_dir: Option<PathBuf>,
	pub output_file: PathBuf,
}

const EFI_BOOT_IMAGE_SIZE: u64 = 3 * 1024 * 1024;

impl IsoGenConfig {
	/// Extracts shim+grub from the initrd's canonical path, builds the 3
	/// MiB FAT EFI boot image, stages the Rufus-workaround duplicates, and
	/// runs `xorriso -as mkisofs`.
	pub fn build(&self, arch: &str) -> Result<()> {
		fs::create_dir_all(&self.staging_dir)?;

		if let Some(os_files) = &self.iso_os_files_dir {
			crate::fileutil::copy_tree(os_files, &self.staging_dir)?;
		}

		let efiboot_img = self.staging_dir.join("boot/grub2/efiboot.img");
		self.build_efi_boot_image(arch, &efiboot_img)?;
		self.stage_rufus_workaround(arch)?;

		let out_display = self.output_file.to_string_lossy().to_string();
		let staging_display = self.staging_dir.to_string_lossy().to_string();

		let mut executor = Executor::new("xorriso")
			.arg("-as")
			.arg("mkisofs")
			.arg("-R")
			.arg("-l")
			.arg("-D")
			.arg("-iso-level")
			.arg("3")
			.arg("-J")
			.arg("-joliet-long")
			.arg("-o")
			.arg(&out_display)
			.arg("-V")
			.arg("CDROM")
			.arg("-eltorito-alt-boot")
			.arg("-e")
			.arg("boot/grub2/efiboot.img")
			.arg("-no-emul-boot");

		if self.enable_bios_boot {
			executor = executor
				.arg("-b")
				.arg("isolinux.bin")
				.arg("-c")
				.arg("boot.cat")
				.arg("-no-emul-boot")
				.arg("-boot-load-size")
				.arg("4")
				.arg("-boot-info-table");
		}

		executor.arg(&staging_display).run()?;
		info!(output = %out_display, "ISO image built");
		Ok(())
	}

	fn build_efi_boot_image(&self, arch: &str, out_path: &Path) -> Result<()> {
		let (shim_name, grub_name) = efi_boot_filenames(arch)?;

		let initrd_bytes = fs::read(&self.initrd_path).map_err(|e| crate::error::OkonomiError::io(&self.initrd_path, e))?;
		let entries = cpio::decode_gz(&initrd_bytes)?;

		let find = |suffix: &str| -> Result<&cpio::CpioEntry> {
			entries
				.iter()
				.find(|e| e.name.ends_with(suffix))
				.ok_or_else(|| eyre!("initrd does not contain {suffix} at the canonical EFI boot path"))
		};

		let shim_entry = find(&format!("boot/efi/EFI/BOOT/{shim_name}"))?;
		let grub_entry = find(&format!("boot/efi/EFI/BOOT/{grub_name}"))?;

		if let Some(parent) = out_path.parent() {
			fs::create_dir_all(parent)?;
		}
		let f = fs::File::create(out_path).map_err(|e| crate::error::OkonomiError::io(out_path, e))?;
		f.set_len(EFI_BOOT_IMAGE_SIZE).map_err(|e| crate::error::OkonomiError::io(out_path, e))?;
		drop(f);

		Executor::new("mkdosfs").arg(out_path.to_string_lossy().to_string()).run()?;

		let stage = tempfile::tempdir()?;
		let boot_dir = stage.path().join("EFI/BOOT");
		fs::create_dir_all(&boot_dir)?;
		fs::write(boot_dir.join(shim_name), &shim_entry.payload)?;
		fs::write(boot_dir.join(grub_name), &grub_entry.payload)?;

		for name in [shim_name, grub_name] {
			Executor::new("mcopy")
				.arg("-i")
				.arg(out_path.to_string_lossy().to_string())
				.arg(boot_dir.join(name).to_string_lossy().to_string())
				.arg(format!("::EFI/BOOT/{name}"))
				.run()?;
		}

		Ok(())
	}

	/// Also copies shim and grub to `<staging>/efi/boot/` so Rufus sees an
	/// EFI directory and skips EFI-image extraction.
	fn stage_rufus_workaround(&self, arch: &str) -> Result<()> {
		let (shim_name, grub_name) = efi_boot_filenames(arch)?;
		let initrd_bytes = fs::read(&self.initrd_path).map_err(|e| crate::error::OkonomiError::io(&self.initrd_path, e))?;
		let entries = cpio::decode_gz(&initrd_bytes)?;

		let rufus_dir = self.staging_dir.join("efi/boot");
		fs::create_dir_all(&rufus_dir)?;
		for name in [shim_name, grub_name] {
			let entry = entries
				.iter()
				.find(|e| e.name.ends_with(&format!("boot/efi/EFI/BOOT/{name}")))
				.ok_or_else(|| eyre!("initrd missing {name} for Rufus workaround staging"))?;
			fs::write(rufus_dir.join(name), &entry.payload)?;
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn rejects_unknown_arch() {
		assert!(efi_boot_filenames("riscv64").is_err());
	}
}
