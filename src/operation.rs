//! Requester-side rendezvous: bringing a whole thread group to a
//! safepoint and releasing it.
//!
//! The scope is a convenience over the per-thread primitives this crate
//! exports (`set_safepoint_requested`, `wait_until_at_safepoint`, bypass
//! enumeration); external operation drivers are free to call those
//! directly instead. Initiators are expected to run on bypass-marked
//! helper threads so an operation never waits on its own thread.
//!
//! # Examples
//!
//! ```
//! use quiesce::operation::SafepointOperationScope;
//! use quiesce::registry::ThreadRegistry;
//! use quiesce::state::{SafepointLevel, TaskKind};
//!
//! let registry = ThreadRegistry::new();
//! let mutator = registry.attach(1, TaskKind::Mutator).unwrap();
//! mutator.enter_safepoint(); // parked in runtime code elsewhere
//!
//! let scope = SafepointOperationScope::rendezvous(&registry, SafepointLevel::Gc);
//! assert!(scope.all_quiescent());
//! // ... inspect or mutate shared structures ...
//! drop(scope);
//!
//! mutator.exit_safepoint();
//! ```

use std::sync::Arc;

use crossbeam_utils::Backoff;
use tracing::debug;

use crate::events::CoordinationEvent;
use crate::registry::ThreadRegistry;
use crate::state::{SafepointLevel, SafepointState};
use crate::thread::RuntimeThread;

/// Holds every non-bypass thread of a registry at a safepoint of the
/// given level for the scope's lifetime.
///
/// Construction performs the full rendezvous: install the request on
/// each target, then wait for each target's At bits. Dropping the scope
/// withdraws every request and wakes the parked threads. Requests are
/// never cancelled mid-rendezvous; once asked, every target parks until
/// the drop.
///
/// The target set is snapshotted at construction: threads attached after
/// the rendezvous begins are not part of the operation. Drivers that need
/// attachment quiescence too must gate attachment externally.
#[derive(Debug)]
pub struct SafepointOperationScope {
    level: SafepointLevel,
    targets: Vec<Arc<RuntimeThread>>,
    events: flume::Sender<CoordinationEvent>,
}

impl SafepointOperationScope {
    /// Bring every non-bypass thread in `registry` to a safepoint of
    /// strength `level`, blocking until all have arrived.
    pub fn rendezvous(registry: &ThreadRegistry, level: SafepointLevel) -> SafepointOperationScope {
        let targets = registry.safepoint_targets();
        debug!(?level, threads = targets.len(), "safepoint operation requested");

        for thread in &targets {
            thread.set_safepoint_requested(level, true);
        }

        for thread in &targets {
            // Short optimistic spin before committing to the monitor wait:
            // threads already parked or at a checkpoint arrive quickly.
            let backoff = Backoff::new();
            while !thread.is_at_safepoint(level) {
                if backoff.is_completed() {
                    thread.wait_until_at_safepoint(level);
                    break;
                }
                backoff.snooze();
            }
        }

        let events = registry.events_sender();
        let _ = events.try_send(CoordinationEvent::OperationBegan { level });
        debug!(?level, "safepoint operation reached rendezvous");
        SafepointOperationScope {
            level,
            targets,
            events,
        }
    }

    pub fn level(&self) -> SafepointLevel {
        self.level
    }

    /// The threads held by this operation.
    pub fn targets(&self) -> &[Arc<RuntimeThread>] {
        &self.targets
    }

    /// Whether every held thread is still at the operation's level.
    /// Holds for the entire scope lifetime; exposed for assertions.
    pub fn all_quiescent(&self) -> bool {
        self.targets.iter().all(|thread| {
            SafepointState::is_at_safepoint(self.level, thread.state_word())
        })
    }
}

impl Drop for SafepointOperationScope {
    fn drop(&mut self) {
        for thread in &self.targets {
            thread.set_safepoint_requested(self.level, false);
        }
        let _ = self
            .events
            .try_send(CoordinationEvent::OperationReleased { level: self.level });
        debug!(level = ?self.level, "safepoint operation released");
    }
}
