//! Pre/post customization script model. Runs each script through
//! `exec::Executor` inside a `chroot::SafeChroot`.

use std::{
	hash::{Hash, Hasher},
	io::Write,
	path::Path,
};

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};

use crate::{chroot::SafeChroot, exec::Executor};

#[derive(Deserialize, Debug, Clone, Serialize, Default)]
pub struct ScriptsManifest {
	#[serde(default)]
	pub pre: Vec<Script>,
	#[serde(default)]
	pub post: Vec<Script>,
}

const fn default_priority() -> i32 {
	50
}

fn default_chroot() -> bool {
	true
}

#[derive(Deserialize, Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Script {
	pub id: Option<String>,
	pub name: Option<String>,
	pub file: Option<std::path::PathBuf>,
	pub inline: Option<String>,
	#[serde(default = "default_chroot")]
	pub chroot: bool,
	#[serde(default)]
	pub needs: Vec<String>,
	/// Default 50; the higher, the later the script executes relative to
	/// its siblings once dependency order is satisfied.
	#[serde(default = "default_priority")]
	pub priority: i32,
}

impl Script {
	pub fn id(&self) -> String {
		self.id.clone().unwrap_or_else(|| {
			let mut hasher = std::hash::DefaultHasher::new();
			self.file.hash(&mut hasher);
			self.inline.hash(&mut hasher);
			hasher.finish().to_string()
		})
	}

	fn load(&self) -> Option<String> {
		if let Some(inline) = &self.inline {
			Some(inline.clone())
		} else {
			self.file.as_ref().and_then(|f| std::fs::read_to_string(f).ok())
		}
	}

	fn shebang_if_needed(&self) -> Option<String> {
		self.load().map(|s| if s.starts_with("#!") { s } else { format!("#!/bin/sh\n{s}") })
	}

	/// Writes the script to a tempfile and executes it, either inside
	/// `chroot` (when `self.chroot` is set) or on the host with `CHROOT`
	/// set in its environment.
	pub fn execute(&self, chroot: &SafeChroot) -> Result<()> {
		let Some(script) = self.shebang_if_needed() else {
			return Err(eyre!("script {:?} has neither `file` nor `inline` content", self.id()));
		};

		if self.chroot {
			chroot.run(|| Self::write_and_execute(&script, None))
		} else {
			Self::write_and_execute(&script, Some(&chroot.root_dir))
		}
	}

	fn write_and_execute(script: &str, chroot_env: Option<&Path>) -> Result<()> {
		let mut tmpfile = tempfile::Builder::new().prefix("okonomi-script").tempfile()?;
		tmpfile.as_file_mut().write_all(script.as_bytes())?;
		let path = tmpfile.path().to_path_buf();
		use std::os::unix::fs::PermissionsExt;
		std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;

		let mut executor = Executor::new(path.to_string_lossy().to_string());
		if let Some(chroot) = chroot_env {
			executor = executor.env("CHROOT", chroot.to_string_lossy().to_string());
		}
		executor.run()
	}
}

/// Orders `scripts` respecting `needs` (a simple Kahn's-algorithm-style
/// topological sort keyed by `Script::id`), breaking ties by `priority`
/// then declared order.
pub fn order_scripts(scripts: &[Script]) -> Result<Vec<Script>> {
	use indexmap::IndexMap;

	let by_id: IndexMap<String, Script> = scripts.iter().map(|s| (s.id(), s.clone())).collect();
	let mut remaining: Vec<&Script> = scripts.iter().collect();
	let mut done: Vec<String> = Vec::new();
	let mut ordered = Vec::new();

	while !remaining.is_empty() {
		let mut progressed = false;
		remaining.sort_by_key(|s| (s.priority, s.id()));
		let mut next_remaining = Vec::new();

		for script in remaining {
			if script.needs.iter().all(|need| done.contains(need) || !by_id.contains_key(need)) {
				ordered.push(script.clone());
				done.push(script.id());
				progressed = true;
			} else {
				next_remaining.push(script);
			}
		}

		if !progressed {
			return Err(eyre!("script dependency cycle detected among: {:?}", next_remaining.iter().map(|s| s.id()).collect::<Vec<_>>()));
		}
		remaining = next_remaining;
	}

	Ok(ordered)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn script(id: &str, needs: &[&str]) -> Script {
		Script {
			id: Some(id.into()),
			name: None,
			file: None,
			inline: Some("true".into()),
			chroot: false,
			needs: needs.iter().map(|s| s.to_string()).collect(),
			priority: 50,
		}
	}

	#[test]
	fn orders_by_dependency_then_priority() {
		let scripts = vec![script("b", &["a"]), script("a", &[])];
		let ordered = order_scripts(&scripts).unwrap();
		assert_eq!(ordered.iter().map(Script::id).collect::<Vec<_>>(), vec!["a", "b"]);
	}

	#[test]
	fn detects_cycles() {
		let scripts = vec![script("a", &["b"]), script("b", &["a"])];
		assert!(order_scripts(&scripts).is_err());
	}
}
