//! Image connection (component H): loopback attach + partition enumeration
//! + compose multiple mounts into a chroot.

use std::path::{Path, PathBuf};

use color_eyre::Result;
use nix::mount::MsFlags;
use tracing::{info, warn};

use crate::{
	chroot::{MountSpec, SafeChroot},
	loopback::Loopback,
};

/// One partition-to-mountpoint binding, ordered least-nested to
/// most-nested by the caller (see `config::partition::sort_by_mountpoint`).
pub struct PartitionMount {
	pub partition_index: usize,
	pub mountpoint: PathBuf,
	pub fstype: String,
}

pub struct ImageConnection {
	loopback: Option<Loopback>,
	chroot: Option<SafeChroot>,
}

impl ImageConnection {
	pub fn new() -> Self {
		Self { loopback: None, chroot: None }
	}

	pub fn connect_loopback(&mut self, file: &Path) -> Result<()> {
		info!(?file, "attaching image file to loopback device");
		self.loopback = Some(Loopback::new(file)?);
		Ok(())
	}

	/// Rewrites each partition mount to reference the loopback's
	/// `<parent>p<N>` device path, then delegates to the safe-chroot
	/// subsystem.
	pub fn connect_chroot(
		&mut self, root_dir: &Path, is_existing: bool, extra_dirs: &[&str],
		partition_mounts: &[PartitionMount], include_default_mounts: bool,
	) -> Result<()> {
		let loopback = self.loopback.as_ref().ok_or_else(|| {
			color_eyre::eyre::eyre!("connect_chroot called before connect_loopback")
		})?;

		let mut extra_mounts = Vec::new();
		for pm in partition_mounts {
			let device = loopback.partition_path(pm.partition_index);
			let rel = pm.mountpoint.strip_prefix("/").unwrap_or(&pm.mountpoint);
			extra_mounts.push(MountSpec {
				source: device,
				target_rel: rel.to_path_buf(),
				fstype: pm.fstype.clone(),
				flags: MsFlags::empty(),
				data: None,
				before_defaults: true,
			});
		}

		let chroot = SafeChroot::new(root_dir, is_existing);
		chroot.initialize(None, extra_dirs, extra_mounts, include_default_mounts)?;
		self.chroot = Some(chroot);
		Ok(())
	}

	pub fn chroot(&self) -> Option<&SafeChroot> {
		self.chroot.as_ref()
	}

	pub fn loopback(&self) -> Option<&Loopback> {
		self.loopback.as_ref()
	}

	/// Closes the chroot then detaches the loopback device; each step is
	/// best-effort and logged, both always attempted.
	pub fn close(&mut self) -> Result<()> {
		let mut first_err = None;

		if let Some(chroot) = self.chroot.take() {
			if let Err(e) = chroot.close(false) {
				warn!(error = %e, "closing chroot during image connection teardown failed");
				first_err = Some(e);
			}
		}

		if let Some(mut loopback) = self.loopback.take() {
			if let Err(e) = loopback.clean_close() {
				warn!(error = %e, "detaching loopback during image connection teardown failed");
				if first_err.is_none() {
					first_err = Some(e);
				}
			}
		}

		match first_err {
			Some(e) => Err(e),
			None => Ok(()),
		}
	}
}

impl Default for ImageConnection {
	fn default() -> Self {
		Self::new()
	}
}
