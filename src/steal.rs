//! Mutator stealing: taking over the obligations of a thread parked in
//! foreign code.
//!
//! A mutator that crosses into foreign code may stay there for an
//! unbounded time, and group-wide operations that need an active mutator
//! to act on its behalf cannot wait for it. The owner advertises the role
//! with `MUTATOR_STEALABLE` when it parks; a helper claims it with a
//! single CAS that flips the stealable/stolen pair and receives a
//! [`StolenMutator`] token. Stealing never touches the `AT_*` bits: the
//! parked thread already satisfies every level; only the logical
//! obligation moves.
//!
//! The hand-back is a rendezvous through the owner's monitor keyed on a
//! generation pair, so it is correct regardless of whether the owner
//! returns from foreign code before or after the stealer finishes.
//!
//! # Examples
//!
//! ```no_run
//! use quiesce::registry::ThreadRegistry;
//! use quiesce::state::TaskKind;
//! use quiesce::steal::try_steal_active_mutator;
//!
//! let registry = ThreadRegistry::new();
//! let parked = registry.attach(1, TaskKind::Mutator).unwrap();
//! // ... thread 1 enters a blocking foreign call elsewhere ...
//!
//! if let Some(stolen) = try_steal_active_mutator(&parked) {
//!     // Perform mutator-obligated work on thread 1's behalf.
//!     drop(stolen); // hand the role back
//! }
//! ```

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::debug;

use crate::events::CoordinationEvent;
use crate::state::SafepointState;
use crate::stats;
use crate::thread::RuntimeThread;

/// One-shot ownership-transfer token for a stolen active-mutator role.
///
/// While the token is live its holder owns the parked thread's
/// active-mutator obligations. Dropping the token (or calling
/// [`hand_back`](StolenMutator::hand_back)) returns the role and releases
/// the owner if it is already waiting in its foreign-call return path.
#[derive(Debug)]
pub struct StolenMutator {
    thread: Arc<RuntimeThread>,
}

impl StolenMutator {
    /// The thread whose role this token carries.
    pub fn thread(&self) -> &Arc<RuntimeThread> {
        &self.thread
    }

    /// Explicit hand-back; equivalent to dropping the token.
    pub fn hand_back(self) {}
}

impl Drop for StolenMutator {
    fn drop(&mut self) {
        let mut guard = self.thread.monitor.lock.lock();
        guard.handback_epoch += 1;
        debug_assert!(
            guard.handback_epoch <= guard.steal_epoch,
            "active-mutator role handed back more often than stolen"
        );
        self.thread.monitor.cv.notify_all();
        drop(guard);

        stats::record_handback();
        debug!(thread = self.thread.id(), "active mutator handed back");
        let _ = self.thread.events.try_send(CoordinationEvent::MutatorHandedBack {
            thread: self.thread.id(),
        });
    }
}

/// Attempt to assume the active-mutator role of a thread parked in
/// foreign code.
///
/// Single CAS attempt: returns `None` if the role is not currently
/// offered (the thread is running, already stolen, or parked under a
/// no-reload scope). On success the caller may perform mutator-obligated
/// work on the parked thread's behalf until it drops the returned token.
pub fn try_steal_active_mutator(thread: &Arc<RuntimeThread>) -> Option<StolenMutator> {
    // The monitor is held across the CAS so the steal generation and the
    // stolen bit move together relative to the owner's slow paths.
    let mut guard = thread.monitor.lock.lock();

    let old = thread.state_word();
    if old & SafepointState::MUTATOR_STEALABLE.bits() == 0 {
        return None;
    }
    assert!(
        old & SafepointState::MUTATOR_STOLEN.bits() == 0,
        "stealable thread already carries a stolen role"
    );
    let new = (old & !SafepointState::MUTATOR_STEALABLE.bits())
        | SafepointState::MUTATOR_STOLEN.bits();
    if thread
        .raw_state()
        .compare_exchange(old, new, Ordering::Relaxed, Ordering::Relaxed)
        .is_err()
    {
        // Lost the race against the owner's fast-path return.
        return None;
    }

    guard.steal_epoch += 1;
    drop(guard);

    stats::record_steal();
    debug!(thread = thread.id(), "active mutator stolen");
    let _ = thread
        .events
        .try_send(CoordinationEvent::MutatorStolen { thread: thread.id() });
    Some(StolenMutator {
        thread: Arc::clone(thread),
    })
}
