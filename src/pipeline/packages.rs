//! Package installation stage (§4.L stage 5): the single package-installer
//! implementation used across all driver modes.

use std::path::Path;

use color_eyre::{eyre::eyre, Result};
use tracing::{info, warn};

use crate::exec::Executor;

const TRANS_COMMENT: &str = "Initial transaction from building with okonomi";

pub struct PackageInstall<'a> {
	pub exec: &'a str,
	pub packages: &'a [String],
	pub exclude: &'a [String],
	pub releasever: &'a str,
	pub arch: Option<&'a str>,
	pub repodir: Option<&'a Path>,
	pub package_snapshot_time: Option<&'a str>,
}

impl<'a> PackageInstall<'a> {
	/// Installs `self.packages` into `install_root` via dnf/tdnf, honoring
	/// `--forcearch`, a custom `reposdir`, and (for `tdnf`) the snapshot
	/// time feature via `--snapshottime`.
	pub fn run(&self, install_root: &Path) -> Result<()> {
		let mut options: Vec<String> = Vec::new();
		if let Some(arch) = self.arch {
			options.push(format!("--forcearch={arch}"));
		}
		if let Some(reposdir) = self.repodir {
			let reposdir = reposdir.canonicalize().unwrap_or_else(|_| reposdir.to_path_buf());
			options.push(format!("--setopt=reposdir={}", reposdir.display()));
		}
		options.extend(self.exclude.iter().map(|p| format!("--exclude={p}")));

		if let Some(snapshot) = self.package_snapshot_time {
			if self.exec == "tdnf" {
				options.push(format!("--snapshottime={snapshot}"));
			} else {
				warn!(exec = self.exec, "package-snapshot-time is only honored by tdnf; ignoring for this package manager");
			}
		}

		let installroot = format!("--installroot={}", install_root.display());

		info!(exec = self.exec, count = self.packages.len(), "installing packages");
		let mut executor = Executor::new(self.exec)
			.arg("install")
			.arg("-y")
			.arg("--setopt=tsflags=")
			.arg(format!("--comment={TRANS_COMMENT}"))
			.arg(format!("--releasever={}", self.releasever))
			.arg(&installroot)
			.args(self.packages.iter().cloned())
			.args(options);

		executor = executor.stderr_cap(40);
		executor.run().map_err(|e| eyre!("package installation failed: {e}"))?;

		let clean = Executor::new(self.exec).arg("clean").arg("all").arg(&installroot).execute_lenient()?;
		if !clean.success {
			warn!(exec = self.exec, "package manager clean step failed; continuing");
		}

		Ok(())
	}
}
