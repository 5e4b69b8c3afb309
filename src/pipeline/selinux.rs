//! SELinux config-file editing and relabel (§4.L stage 9).

use std::path::Path;

use color_eyre::{eyre::eyre, Result};
use tracing::info;

use crate::{chroot::SafeChroot, config::SelinuxMode, exec::Executor};

/// Rewrites `/etc/selinux/config` so it contains exactly one line matching
/// `^SELINUX=(enforcing|permissive|disabled)$` (testable property 8).
pub fn update_selinux_config(mode: SelinuxMode, install_root: &Path) -> Result<()> {
	let path = install_root.join("etc/selinux/config");
	let existing = std::fs::read_to_string(&path).unwrap_or_default();
	let value = mode.config_value();

	let mut replaced = false;
	let mut lines: Vec<String> = existing
		.lines()
		.map(|line| {
			if line.trim_start().starts_with("SELINUX=") {
				replaced = true;
				format!("SELINUX={value}")
			} else {
				line.to_string()
			}
		})
		.collect();

	if !replaced {
		lines.push(format!("SELINUX={value}"));
	}

	crate::fileutil::just_write(&path, lines.join("\n") + "\n")?;
	Ok(())
}

/// Bind-mounts every ext/xfs/btrfs mount one at a time onto
/// `/mnt/_bindmountroot/<orig>` inside the chroot (bypassing submounts),
/// runs `setfiles -m -v -r /mnt/_bindmountroot <contexts> <bound path>` for
/// each, then cleans the temporary directory between iterations.
pub fn relabel(chroot: &SafeChroot, ext_xfs_btrfs_mounts: &[&str], context_file: &str) -> Result<()> {
	if ext_xfs_btrfs_mounts.is_empty() {
		return Ok(());
	}
	for mountpoint in ext_xfs_btrfs_mounts {
		let bind_root = "/mnt/_bindmountroot";
		let bound = format!("{bind_root}{mountpoint}");
		let mountpoint = (*mountpoint).to_string();
		let bound_clone = bound.clone();
		let context_file = context_file.to_string();

		chroot.run(move || {
			Executor::new("mkdir").arg("-p").arg(&bound_clone).run()?;
			Executor::new("mount").arg("--bind").arg(&mountpoint).arg(&bound_clone).run()?;
			let result = Executor::new("setfiles")
				.arg("-m")
				.arg("-v")
				.arg("-r")
				.arg(bind_root)
				.arg(&context_file)
				.arg(&bound_clone)
				.run();
			let _ = Executor::new("umount").arg(&bound_clone).run();
			result
		})?;

		chroot.run(|| Executor::new("rm").arg("-rf").arg(bind_root).run())?;
	}
	info!(count = ext_xfs_btrfs_mounts.len(), "SELinux relabel complete");
	Ok(())
}

/// Resolves an explicit kernel command-line SELinux token to the mode it
/// requests, used when `os.selinux` is left unset but `os.kernel_command_line`
/// already carries one of these fragments.
pub fn mode_from_kernel_cmdline_token(token: &str) -> Result<SelinuxMode> {
	match token {
		"selinux=0" => Ok(SelinuxMode::Disabled),
		"security=selinux selinux=1" => Ok(SelinuxMode::Permissive),
		"security=selinux selinux=1 enforcing=1" => Ok(SelinuxMode::Enforcing),
		other => Err(eyre!("unrecognized SELinux kernel cmdline token: {other:?}")),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn writes_exactly_one_selinux_line() {
		let dir = tempfile::tempdir().unwrap();
		let root = dir.path();
		std::fs::create_dir_all(root.join("etc/selinux")).unwrap();
		std::fs::write(root.join("etc/selinux/config"), "# comment\nSELINUX=disabled\nSELINUXTYPE=targeted\n").unwrap();

		update_selinux_config(SelinuxMode::Enforcing, root).unwrap();

		let contents = std::fs::read_to_string(root.join("etc/selinux/config")).unwrap();
		let matches: Vec<_> = contents.lines().filter(|l| l.starts_with("SELINUX=")).collect();
		assert_eq!(matches, vec!["SELINUX=enforcing"]);
	}

	#[test]
	fn appends_when_missing() {
		let dir = tempfile::tempdir().unwrap();
		let root = dir.path();
		std::fs::create_dir_all(root.join("etc/selinux")).unwrap();
		std::fs::write(root.join("etc/selinux/config"), "SELINUXTYPE=targeted\n").unwrap();

		update_selinux_config(SelinuxMode::Disabled, root).unwrap();

		let contents = std::fs::read_to_string(root.join("etc/selinux/config")).unwrap();
		assert!(contents.lines().any(|l| l == "SELINUX=disabled"));
	}

	#[test]
	fn recognizes_kernel_cmdline_tokens() {
		assert_eq!(mode_from_kernel_cmdline_token("selinux=0").unwrap(), SelinuxMode::Disabled);
		assert_eq!(mode_from_kernel_cmdline_token("security=selinux selinux=1").unwrap(), SelinuxMode::Permissive);
		assert_eq!(mode_from_kernel_cmdline_token("security=selinux selinux=1 enforcing=1").unwrap(), SelinuxMode::Enforcing);
		assert!(mode_from_kernel_cmdline_token("quiet").is_err());
	}
}
