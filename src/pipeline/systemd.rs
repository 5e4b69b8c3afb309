//! Systemd state cleanup (§4.L stage 7): machine-id, random-seed and
//! credential-secret handling ahead of first boot.

use std::path::Path;

use color_eyre::Result;

use crate::fileutil;

/// Ensures `/etc/machine-id` exists and is either empty (disabled
/// firstboot) or contains `"uninitialized\n"`.
pub fn reset_machine_id(install_root: &Path, disable_firstboot: bool) -> Result<()> {
	let path = install_root.join("etc/machine-id");
	let contents = if disable_firstboot { "" } else { "uninitialized\n" };
	fileutil::just_write(&path, contents)?;
	Ok(())
}

/// Deletes `/var/lib/systemd/random-seed`, `/boot/efi/loader/random-seed`,
/// and `/var/lib/systemd/credential.secret` if present.
pub fn remove_boot_state_files(install_root: &Path) -> Result<()> {
	for rel in [
		"var/lib/systemd/random-seed",
		"boot/efi/loader/random-seed",
		"var/lib/systemd/credential.secret",
	] {
		let path = install_root.join(rel);
		if path.exists() {
			std::fs::remove_file(&path)?;
		}
	}
	Ok(())
}

pub fn write_hostname(install_root: &Path, hostname: &str) -> Result<()> {
	fileutil::just_write(install_root.join("etc/hostname"), format!("{hostname}\n"))
}

pub fn enable_service(install_root: &Path, service: &str) -> Result<()> {
	toggle_service(install_root, service, true)
}

pub fn disable_service(install_root: &Path, service: &str) -> Result<()> {
	toggle_service(install_root, service, false)
}

fn toggle_service(install_root: &Path, service: &str, enable: bool) -> Result<()> {
	use crate::exec::Executor;
	let action = if enable { "enable" } else { "disable" };
	Executor::new("systemctl").arg(action).arg("--root").arg(install_root.to_string_lossy().to_string()).arg(service).run()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn machine_id_contains_uninitialized_marker_by_default() {
		let dir = tempfile::tempdir().unwrap();
		reset_machine_id(dir.path(), false).unwrap();
		assert_eq!(std::fs::read_to_string(dir.path().join("etc/machine-id")).unwrap(), "uninitialized\n");
	}

	#[test]
	fn machine_id_is_empty_when_firstboot_disabled() {
		let dir = tempfile::tempdir().unwrap();
		reset_machine_id(dir.path(), true).unwrap();
		assert_eq!(std::fs::read_to_string(dir.path().join("etc/machine-id")).unwrap(), "");
	}
}
