//! Shell executor (component A): launches child processes with captured
//! stdout/stderr, and a process-wide registry of their PIDs so teardown can
//! deliver a signal to every tracked descendant before exit.

use std::{
	process::{Command, Stdio},
	sync::{Mutex, OnceLock},
};

use nix::{
	sys::signal::{self, Signal},
	unistd::Pid,
};
use tracing::{debug, trace, warn};

use crate::error::{OkonomiError, DEFAULT_STDERR_CAP};

static CHILD_REGISTRY: OnceLock<ChildRegistry> = OnceLock::new();

pub fn global_registry() -> &'static ChildRegistry {
	CHILD_REGISTRY.get_or_init(ChildRegistry::default)
}

#[derive(Default)]
pub struct ChildRegistry {
	pids: Mutex<Vec<i32>>,
	stopped: Mutex<bool>,
}

impl ChildRegistry {
	fn track(&self, pid: i32) {
		self.pids.lock().unwrap_or_else(|p| p.into_inner()).push(pid);
	}

	fn untrack(&self, pid: i32) {
		let mut pids = self.pids.lock().unwrap_or_else(|p| p.into_inner());
		if let Some(pos) = pids.iter().position(|p| *p == pid) {
			pids.remove(pos);
		}
	}

	/// One-shot and irreversible: delivers SIGKILL to every tracked child
	/// and marks the registry stopped so no further tracking is meaningful.
	pub fn kill_all(&self) {
		let mut stopped = self.stopped.lock().unwrap_or_else(|p| p.into_inner());
		if *stopped {
			return;
		}
		*stopped = true;
		let pids = self.pids.lock().unwrap_or_else(|p| p.into_inner());
		for pid in pids.iter() {
			if let Err(e) = signal::kill(Pid::from_raw(*pid), Signal::SIGKILL) {
				warn!(pid, error = %e, "failed to deliver SIGKILL to tracked child");
			}
		}
	}
}

/// Result of a captured run: raw stdout/stderr bytes plus the exit status.
pub struct Captured {
	pub stdout: Vec<u8>,
	pub stderr: Vec<u8>,
	pub success: bool,
}

/// Builder for a single shell invocation, mirroring the
/// capture-and-wrap-in-color_eyre behavior but reusable and configurable.
pub struct Executor {
	program: String,
	args: Vec<String>,
	stderr_cap: usize,
	envs: Vec<(String, String)>,
	cwd: Option<std::path::PathBuf>,
}

impl Executor {
	pub fn new(program: impl Into<String>) -> Self {
		Self { program: program.into(), args: Vec::new(), stderr_cap: DEFAULT_STDERR_CAP, envs: Vec::new(), cwd: None }
	}

	pub fn arg(mut self, arg: impl Into<String>) -> Self {
		self.args.push(arg.into());
		self
	}

	pub fn args<I, S>(mut self, args: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		self.args.extend(args.into_iter().map(Into::into));
		self
	}

	pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
		self.envs.push((key.into(), value.into()));
		self
	}

	pub fn current_dir(mut self, dir: impl Into<std::path::PathBuf>) -> Self {
		self.cwd = Some(dir.into());
		self
	}

	pub fn stderr_cap(mut self, cap: usize) -> Self {
		self.stderr_cap = cap;
		self
	}

	/// Runs the command to completion, capturing stdout/stderr. Returns
	/// `Ok(stdout)` on success; on nonzero exit returns
	/// `OkonomiError::ExternalToolFailed` wrapped in a `color_eyre::Report`.
	pub fn execute(self) -> color_eyre::Result<Vec<u8>> {
		trace!(program = %self.program, args = ?self.args, "executing");
		let mut cmd = Command::new(&self.program);
		cmd.args(&self.args).stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());
		for (k, v) in &self.envs {
			cmd.env(k, v);
		}
		if let Some(cwd) = &self.cwd {
			cmd.current_dir(cwd);
		}

		let mut child = cmd.spawn().map_err(|e| OkonomiError::io(&self.program, e))?;
		let pid = child.id() as i32;
		global_registry().track(pid);

		let out = child.wait_with_output().map_err(|e| OkonomiError::io(&self.program, e));
		global_registry().untrack(pid);
		let out = out?;

		debug!(program = %self.program, success = out.status.success(), "command finished");

		if !out.status.success() {
			let stderr = String::from_utf8_lossy(&out.stderr);
			return Err(OkonomiError::tool_failed(&self.program, &stderr, self.stderr_cap).into());
		}

		Ok(out.stdout)
	}

	/// Like [`execute`] but returns captured stdout/stderr regardless of
	/// exit status, for callers that want to inspect a non-zero exit
	/// themselves (e.g. `grub2-mkconfig`, which is known to return nonzero
	/// while still succeeding).
	pub fn execute_lenient(self) -> color_eyre::Result<Captured> {
		let mut cmd = Command::new(&self.program);
		cmd.args(&self.args).stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());
		for (k, v) in &self.envs {
			cmd.env(k, v);
		}
		if let Some(cwd) = &self.cwd {
			cmd.current_dir(cwd);
		}
		let mut child = cmd.spawn().map_err(|e| OkonomiError::io(&self.program, e))?;
		let pid = child.id() as i32;
		global_registry().track(pid);
		let out = child.wait_with_output().map_err(|e| OkonomiError::io(&self.program, e));
		global_registry().untrack(pid);
		let out = out?;
		Ok(Captured { success: out.status.success(), stdout: out.stdout, stderr: out.stderr })
	}

	/// Convenience for the common "run and discard stdout" case.
	pub fn run(self) -> color_eyre::Result<()> {
		self.execute().map(|_| ())
	}

	/// Like [`execute`] but decodes stdout as UTF-8, trimmed.
	pub fn run_stdout(self) -> color_eyre::Result<String> {
		let out = self.execute()?;
		Ok(String::from_utf8_lossy(&out).trim().to_string())
	}
}

/// Irreversibly kills every tracked child of the global registry. Used by
/// the signal handler and by a fatal pipeline abort.
pub fn permanently_stop_all_children() {
	global_registry().kill_all();
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn execute_captures_stdout() {
		let out = Executor::new("echo").arg("hello").run_stdout().expect("echo should succeed");
		assert_eq!(out, "hello");
	}

	#[test]
	fn execute_reports_failure_with_capped_stderr() {
		let res = Executor::new("false").execute();
		assert!(res.is_err());
	}
}
