//! Process-wide active-chroot registry and signal-driven teardown.
//!
//! Two locks guard chroot state, per the design: a coarse `ACTIVE_CHROOTS`
//! lock guarding stack membership (held during init/close of any chroot,
//! and held permanently by the signal handler), and an exclusive
//! `IN_CHROOT` mutex guarding the actual `chroot(2)` state (acquired only
//! by `SafeChroot::run`). Nested chroots are permitted; teardown is LIFO.

use std::sync::{Mutex, OnceLock};

use nix::sys::signal::{self, SigHandler, Signal};
use tracing::warn;

use crate::chroot::SafeChroot;

static ACTIVE_CHROOTS: OnceLock<Mutex<Vec<*const SafeChroot>>> = OnceLock::new();
static IN_CHROOT: OnceLock<Mutex<()>> = OnceLock::new();
static HANDLER_INSTALLED: OnceLock<()> = OnceLock::new();

/// Raw pointers are used instead of `Arc<SafeChroot>` so the registry does
/// not extend a chroot's lifetime: a chroot removes itself from the stack
/// in its own `close`, and the signal handler only ever reads through the
/// pointer while the owning thread is blocked on `ACTIVE_CHROOTS` — the
/// handler never outlives the process, since it calls `exit` at the end.
unsafe impl Send for Registered {}
struct Registered(*const SafeChroot);

pub(crate) fn active_chroots_lock() -> &'static Mutex<Vec<*const SafeChroot>> {
	ACTIVE_CHROOTS.get_or_init(|| Mutex::new(Vec::new()))
}

pub(crate) fn in_chroot_mutex() -> &'static Mutex<()> {
	IN_CHROOT.get_or_init(|| Mutex::new(()))
}

/// Installs the SIGINT/SIGTERM handler exactly once per process.
pub fn install_signal_handlers() {
	HANDLER_INSTALLED.get_or_init(|| {
		unsafe {
			let handler = SigHandler::Handler(handle_teardown_signal);
			let _ = signal::signal(Signal::SIGINT, handler);
			let _ = signal::signal(Signal::SIGTERM, handler);
		}
	});
}

/// Registers a chroot in the active stack. Caller must remove it via
/// [`unregister`] before the `SafeChroot` is dropped.
pub(crate) fn register(chroot: &SafeChroot) {
	let mut stack = active_chroots_lock().lock().unwrap_or_else(|p| p.into_inner());
	stack.push(std::ptr::from_ref(chroot));
}

pub(crate) fn unregister(chroot: &SafeChroot) {
	let mut stack = active_chroots_lock().lock().unwrap_or_else(|p| p.into_inner());
	if let Some(pos) = stack.iter().rposition(|p| std::ptr::eq(*p, chroot)) {
		stack.remove(pos);
	}
}

/// Entered only from the signal handler's dedicated control flow: acquires
/// both locks and never releases them, then tears every active chroot down
/// LIFO before the process exits. All subsequent chroot operations in any
/// other thread block forever on these locks — that is intentional.
extern "C" fn handle_teardown_signal(_sig: libc_signal_compat::c_int) {
	// Acquiring `active_chroots_lock` blocks any new init/close from
	// starting; we never unlock it again.
	let stack = active_chroots_lock().lock().unwrap_or_else(|p| p.into_inner());

	crate::exec::global_registry().kill_all();

	// Acquiring `in_chroot_mutex` blocks any new `run` from starting.
	let _in_chroot = in_chroot_mutex().lock().unwrap_or_else(|p| p.into_inner());

	for ptr in stack.iter().rev() {
		// SAFETY: every pointer in the stack was registered by a live
		// `SafeChroot` that has not yet called `unregister`; since we hold
		// `active_chroots_lock` for the remainder of process life, no
		// concurrent `unregister`/drop can invalidate it while we use it.
		let chroot = unsafe { &**ptr };
		if let Err(e) = chroot.unmount_and_remove(false, true) {
			warn!(error = %e, "teardown of active chroot failed during signal handling");
		}
	}

	std::process::exit(1);
}

/// Small shim so the handler's signature does not need to pull in `libc`
/// directly; `nix::sys::signal::SigHandler::Handler` expects `extern "C"
/// fn(c_int)`, and `c_int` is just `i32` on every platform this crate
/// targets.
mod libc_signal_compat {
	pub type c_int = i32;
}
