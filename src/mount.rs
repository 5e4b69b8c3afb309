//! Mount manager (component F): single mount action with guaranteed
//! unmount on drop, lazy-unmount fallback. Uses `nix::mount` directly
//! rather than a higher-level mount crate, since neither expresses the
//! lazy-unmount/backoff contract this component needs.

use std::{
	fs,
	path::{Path, PathBuf},
	thread,
	time::Duration,
};

use color_eyre::{eyre::eyre, Result};
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use tracing::{debug, trace, warn};

const UNMOUNT_RETRIES: u32 = 3;
const UNMOUNT_BASE_DELAY: Duration = Duration::from_secs(1);

/// A single mount action, unmounted on `clean_close` or, best-effort, on
/// drop. At most one of those two paths ever performs the actual syscall;
/// subsequent calls are no-ops.
pub struct Mount {
	target: PathBuf,
	made_dir: bool,
	mounted: bool,
}

impl Mount {
	/// Performs the mount syscall and records it. If `make_and_delete_dir`
	/// is set and `target` does not exist, it is created, and removed again
	/// on a successful `clean_close`.
	pub fn new(
		source: &Path, target: &Path, fstype: &str, flags: MsFlags, data: Option<&str>,
		make_and_delete_dir: bool,
	) -> Result<Self> {
		let made_dir = make_and_delete_dir && !target.exists();
		if made_dir {
			fs::create_dir_all(target)?;
		}

		trace!(?source, ?target, fstype, "mounting");
		mount(Some(source), target, Some(fstype), flags, data)
			.map_err(|e| eyre!("mount {source:?} -> {target:?} ({fstype}) failed: {e}"))?;

		Ok(Self { target: target.to_path_buf(), made_dir, mounted: true })
	}

	/// Unmounts, retrying with exponential backoff on `EBUSY`, then falling
	/// back to a lazy (`MNT_DETACH`) unmount. Idempotent: a second call is
	/// a no-op.
	pub fn clean_close(&mut self) -> Result<()> {
		if !self.mounted {
			return Ok(());
		}
		if !is_mountpoint(&self.target) {
			debug!(target = ?self.target, "target is no longer a mountpoint, skipping unmount");
			self.mounted = false;
			return self.maybe_remove_dir();
		}

		let mut last_err = None;
		for attempt in 0..UNMOUNT_RETRIES {
			match umount2(&self.target, MntFlags::empty()) {
				Ok(()) => {
					last_err = None;
					break;
				},
				Err(nix::errno::Errno::EBUSY) => {
					let delay = UNMOUNT_BASE_DELAY * 2u32.pow(attempt);
					warn!(target = ?self.target, attempt, ?delay, "unmount busy, retrying");
					thread::sleep(delay);
					last_err = Some(nix::errno::Errno::EBUSY);
				},
				Err(e) => {
					last_err = Some(e);
					break;
				},
			}
		}

		if let Some(_err) = last_err {
			warn!(target = ?self.target, "falling back to lazy unmount");
			umount2(&self.target, MntFlags::MNT_DETACH)
				.map_err(|e| eyre!("lazy unmount of {:?} failed: {e}", self.target))?;
		}

		self.mounted = false;
		self.maybe_remove_dir()
	}

	fn maybe_remove_dir(&mut self) -> Result<()> {
		if self.made_dir {
			let _ = fs::remove_dir(&self.target);
			self.made_dir = false;
		}
		Ok(())
	}

	pub fn target(&self) -> &Path {
		&self.target
	}
}

impl Drop for Mount {
	fn drop(&mut self) {
		if self.mounted {
			if let Err(e) = self.clean_close() {
				warn!(error = %e, target = ?self.target, "best-effort unmount on drop failed");
			}
		}
	}
}

/// Checks whether `path` is currently a mountpoint by comparing its
/// device id against its parent's (the same technique `findmnt`/`mountpoint(1)`
/// use under the hood).
pub fn is_mountpoint(path: &Path) -> bool {
	use std::os::unix::fs::MetadataExt;
	let Ok(meta) = fs::symlink_metadata(path) else { return false };
	let Some(parent) = path.parent() else { return false };
	let Ok(parent_meta) = fs::symlink_metadata(parent) else { return false };
	meta.dev() != parent_meta.dev()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn is_mountpoint_false_for_plain_dir() {
		let dir = tempfile::tempdir().unwrap();
		let sub = dir.path().join("child");
		fs::create_dir(&sub).unwrap();
		assert!(!is_mountpoint(&sub));
	}
}
