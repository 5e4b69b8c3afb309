//! Error kinds distinguished across the pipeline, per the error handling
//! design: configuration, external tool, filesystem, resource-leak and
//! invariant-violation failures.

use std::path::PathBuf;

use thiserror::Error;

/// Maximum number of trailing stderr lines retained on a tool failure
/// unless a call site overrides it.
pub const DEFAULT_STDERR_CAP: usize = 20;

#[derive(Debug, Error)]
pub enum OkonomiError {
	#[error("invalid configuration: {field}: {message}")]
	ConfigInvalid { field: String, message: String },

	#[error("`{tool}` exited with a non-zero status\n{}", stderr_tail.join("\n"))]
	ExternalToolFailed { tool: String, stderr_tail: Vec<String> },

	#[error("I/O error at {path}")]
	Io {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},

	#[error("resource cleanup step failed: {detail}")]
	ResourceLeak { detail: String },
}

impl OkonomiError {
	pub fn config(field: impl Into<String>, message: impl Into<String>) -> Self {
		Self::ConfigInvalid { field: field.into(), message: message.into() }
	}

	pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
		Self::Io { path: path.into(), source }
	}

	/// Caps `stderr` to the last `cap` non-empty lines.
	pub fn tool_failed(tool: impl Into<String>, stderr: &str, cap: usize) -> Self {
		let stderr_tail = stderr
			.lines()
			.filter(|l| !l.trim().is_empty())
			.rev()
			.take(cap)
			.collect::<Vec<_>>()
			.into_iter()
			.rev()
			.map(str::to_owned)
			.collect();
		Self::ExternalToolFailed { tool: tool.into(), stderr_tail }
	}
}

/// Marks an unrecoverable invariant violation: the caller should panic with
/// this message rather than propagate a `Result`. Restoring the original
/// root/cwd after a chroot run is the one place this is used; per design,
/// there is no recovery path once that fails.
pub fn invariant_violated(detail: impl std::fmt::Display) -> ! {
	panic!("invariant violated: {detail}");
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn tool_failed_caps_and_preserves_order() {
		let stderr = (1..=30).map(|n| format!("line {n}")).collect::<Vec<_>>().join("\n");
		let err = OkonomiError::tool_failed("mkfs.ext4", &stderr, 5);
		let OkonomiError::ExternalToolFailed { stderr_tail, .. } = err else { panic!("wrong variant") };
		assert_eq!(stderr_tail, vec!["line 26", "line 27", "line 28", "line 29", "line 30"]);
	}
}
