//! Execution-mode transitions: the defined points where a thread's
//! [`ExecutionMode`] changes, paired with the safepoint transition each
//! boundary requires.
//!
//! Mode flips between runtime and generated code touch nothing but the
//! mode field. The native and blocked boundaries are the interesting
//! ones: both must park the thread at a safepoint for the duration, and
//! the native boundary additionally participates in mutator stealing and
//! the sticky-unwind check on return.

use tracing::trace;

use crate::state::ExecutionMode;
use crate::thread::RuntimeThread;

/// What the caller must do after returning across the native boundary.
///
/// [`Unwind`](ResumeDisposition::Unwind) is not an error value: the
/// transition itself always succeeds mechanically. It reports that a
/// sticky unwind was raised while the thread was away and the logical
/// task must be terminated instead of resumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "a pending unwind must terminate the task, not resume it"]
pub enum ResumeDisposition {
    /// Resume normal execution.
    Resume,
    /// Force termination of the logical task.
    Unwind,
}

/// Mode-only flip for entering runtime code from generated code; no
/// safepoint interaction.
#[derive(Debug)]
pub struct TransitionGeneratedToRuntime<'t> {
    thread: &'t RuntimeThread,
}

impl<'t> TransitionGeneratedToRuntime<'t> {
    pub fn new(thread: &'t RuntimeThread) -> TransitionGeneratedToRuntime<'t> {
        debug_assert_eq!(thread.execution_mode(), ExecutionMode::InGenerated);
        thread.set_execution_mode(ExecutionMode::InRuntime);
        TransitionGeneratedToRuntime { thread }
    }
}

impl Drop for TransitionGeneratedToRuntime<'_> {
    fn drop(&mut self) {
        self.thread.set_execution_mode(ExecutionMode::InGenerated);
    }
}

/// Run a foreign-function call on this thread.
///
/// Crossing out: records `InNative` and enters a safepoint at every level
/// with the active-mutator role stealable. Crossing back: exits the
/// safepoint (rendezvousing with a stealer if the role was taken),
/// restores the previous mode, and reports whether a sticky unwind forces
/// termination.
pub fn call_native<R>(
    thread: &RuntimeThread,
    foreign: impl FnOnce() -> R,
) -> (R, ResumeDisposition) {
    let prior_mode = thread.execution_mode();
    thread.set_execution_mode(ExecutionMode::InNative);
    thread.enter_safepoint_to_native();

    let result = foreign();

    thread.exit_safepoint_from_native();
    thread.set_execution_mode(prior_mode);

    let disposition = if thread.unwind_in_progress() {
        trace!(thread = thread.id(), "unwind pending on native return");
        ResumeDisposition::Unwind
    } else {
        ResumeDisposition::Resume
    };
    (result, disposition)
}

/// Run a blocking operation the runtime knows about (lock waits, I/O on
/// runtime-owned descriptors). The thread parks at an ordinary safepoint
/// for the duration so operations need not wait for it.
pub fn call_blocked<R>(thread: &RuntimeThread, blocking: impl FnOnce() -> R) -> R {
    let prior_mode = thread.execution_mode();
    thread.set_execution_mode(ExecutionMode::Blocked);
    thread.enter_safepoint();

    let result = blocking();

    thread.exit_safepoint();
    thread.set_execution_mode(prior_mode);
    result
}
