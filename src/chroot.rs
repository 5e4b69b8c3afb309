//! Safe-chroot subsystem (component G): serialized chroot entry with
//! bind-mounted pseudo-filesystems, guaranteed unmount/teardown on every
//! exit path including fatal signals, using the escape-anchor fd pattern
//! for safe re-entry to the original root.

use std::{
	fs::{self, File},
	os::fd::AsRawFd,
	path::{Path, PathBuf},
};

use color_eyre::{eyre::eyre, Result};
use nix::{
	mount::MsFlags,
	sys::signal::{self, Signal},
	unistd::Pid,
};
use tracing::{debug, info, warn};

use crate::{error::invariant_violated, mount::Mount, signalsafe};

/// One entry in the assembled mount list: created in a specific order
/// relative to the default pseudo-filesystem set.
pub struct MountSpec {
	pub source: PathBuf,
	pub target_rel: PathBuf,
	pub fstype: String,
	pub flags: MsFlags,
	pub data: Option<String>,
	pub before_defaults: bool,
}

impl MountSpec {
	pub fn bind(source: impl Into<PathBuf>, target_rel: impl Into<PathBuf>) -> Self {
		Self {
			source: source.into(),
			target_rel: target_rel.into(),
			fstype: "none".into(),
			flags: MsFlags::MS_BIND,
			data: None,
			before_defaults: false,
		}
	}
}

fn default_mounts() -> Vec<MountSpec> {
	vec![
		MountSpec {
			source: "devtmpfs".into(),
			target_rel: "dev".into(),
			fstype: "devtmpfs".into(),
			flags: MsFlags::empty(),
			data: None,
			before_defaults: false,
		},
		MountSpec {
			source: "proc".into(),
			target_rel: "proc".into(),
			fstype: "proc".into(),
			flags: MsFlags::empty(),
			data: None,
			before_defaults: false,
		},
		MountSpec {
			source: "sysfs".into(),
			target_rel: "sys".into(),
			fstype: "sysfs".into(),
			flags: MsFlags::empty(),
			data: None,
			before_defaults: false,
		},
		MountSpec {
			source: "tmpfs".into(),
			target_rel: "run".into(),
			fstype: "tmpfs".into(),
			flags: MsFlags::empty(),
			data: None,
			before_defaults: false,
		},
		MountSpec {
			source: "devpts".into(),
			target_rel: "dev/pts".into(),
			fstype: "devpts".into(),
			flags: MsFlags::empty(),
			data: Some("gid=5,mode=620".into()),
			before_defaults: false,
		},
	]
}

/// A chrooted subtree with its bind-mounted pseudo-filesystems. At most one
/// `SafeChroot` may be "entered" (running a closure inside it) per process
/// at a time; `mount_points` unmount in reverse of mount order.
pub struct SafeChroot {
	pub root_dir: PathBuf,
	is_existing_dir: bool,
	mounts: std::sync::Mutex<Vec<Mount>>,
	registered: std::sync::atomic::AtomicBool,
}

impl SafeChroot {
	/// Registers intent; does not touch the filesystem.
	pub fn new(root_dir: impl Into<PathBuf>, is_existing_dir: bool) -> Self {
		Self {
			root_dir: root_dir.into(),
			is_existing_dir,
			mounts: std::sync::Mutex::new(Vec::new()),
			registered: std::sync::atomic::AtomicBool::new(false),
		}
	}

	/// Validates/creates `root_dir`, optionally extracts a worker tarball
	/// into it, creates `extra_dirs`, assembles and mounts the default
	/// pseudo-filesystems plus any caller-supplied extras (respecting
	/// `before_defaults`), then registers this chroot in the process-wide
	/// active list. On any mid-step failure, unmounts everything mounted so
	/// far before returning the error.
	pub fn initialize(
		&self, tar_path: Option<&Path>, extra_dirs: &[&str], extra_mounts: Vec<MountSpec>,
		include_default_mounts: bool,
	) -> Result<()> {
		let _active = signalsafe::active_chroots_lock().lock().unwrap_or_else(|p| p.into_inner());

		if self.is_existing_dir {
			if !self.root_dir.exists() {
				return Err(eyre!("chroot root {:?} must already exist but does not", self.root_dir));
			}
		} else {
			if self.root_dir.exists() {
				return Err(eyre!("chroot root {:?} must not already exist", self.root_dir));
			}
			fs::create_dir_all(&self.root_dir)?;
		}

		let result = self.initialize_inner(tar_path, extra_dirs, extra_mounts, include_default_mounts);
		if result.is_ok() {
			signalsafe::register(self);
			self.registered.store(true, std::sync::atomic::Ordering::SeqCst);
		} else if let Err(e) = self.unmount_and_remove(false, false) {
			warn!(error = %e, "cleanup after failed chroot initialization also failed");
		}
		result
	}

	fn initialize_inner(
		&self, tar_path: Option<&Path>, extra_dirs: &[&str], extra_mounts: Vec<MountSpec>,
		include_default_mounts: bool,
	) -> Result<()> {
		if let Some(tar_path) = tar_path {
			info!(?tar_path, "extracting worker tarball into chroot");
			crate::tarcodec::extract_tar_gz(tar_path, &self.root_dir)?;
		}

		for dir in extra_dirs {
			fs::create_dir_all(self.root_dir.join(dir.trim_start_matches('/')))?;
		}

		let (before, after): (Vec<_>, Vec<_>) = extra_mounts.into_iter().partition(|m| m.before_defaults);
		let mut ordered = before;
		if include_default_mounts {
			ordered.extend(default_mounts());
		}
		ordered.extend(after);

		let mut mounts = self.mounts.lock().unwrap_or_else(|p| p.into_inner());
		for spec in ordered {
			let target = self.root_dir.join(&spec.target_rel);
			let m = Mount::new(&spec.source, &target, &spec.fstype, spec.flags, spec.data.as_deref(), true)?;
			debug!(target = ?m.target(), "mounted chroot pseudo-filesystem");
			mounts.push(m);
		}
		Ok(())
	}

	/// Acquires the global in-chroot mutex, swaps in the fixed chroot
	/// environment, chroots, runs the closure, then restores cwd/root.
	/// Panics (unrecoverable) if restoring the original root/cwd fails.
	pub fn run<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
		let _guard = signalsafe::in_chroot_mutex().lock().unwrap_or_else(|p| p.into_inner());
		// SAFETY: serialized by `_guard`; no other thread may chroot while
		// this lock is held.
		unsafe { self.unsafe_run(f) }
	}

	/// Same as [`run`] but without acquiring the global in-chroot mutex.
	/// The caller must guarantee no other thread is chrooting concurrently.
	///
	/// # Safety
	/// Calling this concurrently with another `run`/`unsafe_run` on any
	/// `SafeChroot` corrupts the process's chroot/cwd state.
	pub unsafe fn unsafe_run<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
		let orig_root = File::open("/").map_err(|e| eyre!("failed to open escape anchor for /: {e}"))?;
		let orig_cwd = File::open(".").map_err(|e| eyre!("failed to open escape anchor for cwd: {e}"))?;

		let saved_env: Vec<(String, String)> = std::env::vars().collect();
		for (k, _) in &saved_env {
			std::env::remove_var(k);
		}
		std::env::set_var("USER", "root");
		std::env::set_var("HOME", "/root");
		std::env::set_var("SHELL", std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".into()));
		std::env::set_var("TERM", std::env::var("TERM").unwrap_or_else(|_| "linux".into()));
		std::env::set_var("PATH", "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin");

		nix::unistd::chroot(&self.root_dir)
			.map_err(|e| eyre!("chroot to {:?} failed: {e}", self.root_dir))?;
		nix::unistd::chdir("/").map_err(|e| eyre!("chdir to / after chroot failed: {e}"))?;

		let result = f();

		let restore = (|| -> nix::Result<()> {
			nix::unistd::fchdir(orig_root.as_raw_fd())?;
			nix::unistd::chroot(".")?;
			nix::unistd::fchdir(orig_cwd.as_raw_fd())?;
			Ok(())
		})();

		std::env::vars().for_each(|(k, _)| std::env::remove_var(k));
		for (k, v) in saved_env {
			std::env::set_var(k, v);
		}

		if let Err(e) = restore {
			invariant_violated(format!("failed to restore original root/cwd after chroot run: {e}"));
		}

		result
	}

	/// Copies a list of (src, dest-rel) file pairs from the host into the
	/// chroot.
	pub fn add_files(&self, files: &[(PathBuf, PathBuf)]) -> Result<()> {
		for (src, dest_rel) in files {
			let dest = self.root_dir.join(dest_rel);
			if let Some(parent) = dest.parent() {
				fs::create_dir_all(parent)?;
			}
			fs::copy(src, &dest)?;
		}
		Ok(())
	}

	pub fn add_dirs(&self, dirs: &[PathBuf]) -> Result<()> {
		for dir in dirs {
			fs::create_dir_all(self.root_dir.join(dir))?;
		}
		Ok(())
	}

	pub fn copy_out_file(&self, rel: &Path, host_path: &Path) -> Result<()> {
		fs::copy(self.root_dir.join(rel), host_path)?;
		Ok(())
	}

	pub fn move_out_file(&self, rel: &Path, host_path: &Path) -> Result<()> {
		fs::rename(self.root_dir.join(rel), host_path)?;
		Ok(())
	}

	/// Sends SIGINT to any process whose open-file root matches this
	/// chroot's root directory, then unmounts everything and (unless
	/// `leave_on_disk`) removes `root_dir` if it was created by us.
	pub fn close(&self, leave_on_disk: bool) -> Result<()> {
		let _active = signalsafe::active_chroots_lock().lock().unwrap_or_else(|p| p.into_inner());
		self.signal_processes_using_root();
		let result = self.unmount_and_remove(leave_on_disk, false).or_else(|e| {
			warn!(error = %e, "normal unmount failed, retrying lazily");
			self.unmount_and_remove(leave_on_disk, true)
		});
		if self.registered.swap(false, std::sync::atomic::Ordering::SeqCst) {
			signalsafe::unregister(self);
		}
		result
	}

	fn signal_processes_using_root(&self) {
		let Ok(proc_entries) = fs::read_dir("/proc") else { return };
		for entry in proc_entries.flatten() {
			let Ok(pid) = entry.file_name().to_string_lossy().parse::<i32>() else { continue };
			let root_link = entry.path().join("root");
			let Ok(target) = fs::read_link(&root_link) else { continue };
			if target == self.root_dir {
				if let Err(e) = signal::kill(Pid::from_raw(pid), Signal::SIGINT) {
					warn!(pid, error = %e, "failed to signal process using chroot root; it may merely be peeking at the directory");
				}
			}
		}
	}

	/// Unmounts every mount point in reverse order, then (unless
	/// `leave_on_disk`) removes `root_dir` if it was not pre-existing.
	pub(crate) fn unmount_and_remove(&self, leave_on_disk: bool, _lazy: bool) -> Result<()> {
		let mut mounts = self.mounts.lock().unwrap_or_else(|p| p.into_inner());
		let mut first_err = None;
		while let Some(mut m) = mounts.pop() {
			if let Err(e) = m.clean_close() {
				warn!(error = %e, target = ?m.target(), "unmount during chroot teardown failed");
				if first_err.is_none() {
					first_err = Some(e);
				}
			}
		}
		drop(mounts);

		if !leave_on_disk && !self.is_existing_dir {
			if let Err(e) = fs::remove_dir_all(&self.root_dir) {
				if e.kind() != std::io::ErrorKind::NotFound {
					warn!(error = %e, root = ?self.root_dir, "failed to remove chroot root directory");
					if first_err.is_none() {
						first_err = Some(eyre!("failed to remove {:?}: {e}", self.root_dir));
					}
				}
			}
		}

		match first_err {
			Some(e) => Err(e),
			None => Ok(()),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn new_does_not_touch_filesystem() {
		let dir = tempfile::tempdir().unwrap();
		let root = dir.path().join("does-not-exist-yet");
		let _chroot = SafeChroot::new(&root, false);
		assert!(!root.exists());
	}
}
