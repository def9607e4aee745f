//! Thread registry: the single place cross-thread handles come from.
//!
//! Safepoint operations enumerate their targets here rather than holding
//! ad-hoc pointers to peer threads, and every handle is an
//! `Arc<RuntimeThread>` so a thread's coordination state cannot disappear
//! under a requester mid-operation.
//!
//! # Examples
//!
//! ```
//! use quiesce::registry::ThreadRegistry;
//! use quiesce::state::TaskKind;
//!
//! let registry = ThreadRegistry::new();
//! let worker = registry.attach(1, TaskKind::Mutator).unwrap();
//! let helper = registry.attach(2, TaskKind::GcWorker).unwrap();
//!
//! // Operations only wait on threads that can actually reach safepoints.
//! let targets = registry.safepoint_targets();
//! assert_eq!(targets.len(), 1);
//! assert_eq!(targets[0].id(), worker.id());
//!
//! registry.detach(2).unwrap();
//! assert!(registry.get(2).is_none());
//! # drop(helper);
//! ```

use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use tracing::trace;

use crate::error::{CoordinationError, CoordinationResult};
use crate::events::CoordinationEvent;
use crate::state::{SafepointLevel, TaskKind};
use crate::thread::RuntimeThread;

/// Capacity of the coordination event bus; publication is best-effort and
/// drops events once no subscriber drains them.
const EVENT_BUS_CAPACITY: usize = 1024;

/// Registry of all attached runtime threads, id to handle.
#[derive(Debug)]
pub struct ThreadRegistry {
    threads: DashMap<u64, Arc<RuntimeThread>>,
    events_tx: flume::Sender<CoordinationEvent>,
    events_rx: flume::Receiver<CoordinationEvent>,
}

impl Default for ThreadRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadRegistry {
    pub fn new() -> ThreadRegistry {
        let (events_tx, events_rx) = flume::bounded(EVENT_BUS_CAPACITY);
        ThreadRegistry {
            threads: DashMap::new(),
            events_tx,
            events_rx,
        }
    }

    /// Process-wide registry used by embedders that do not thread their
    /// own instance through.
    pub fn global() -> &'static ThreadRegistry {
        static GLOBAL: OnceLock<ThreadRegistry> = OnceLock::new();
        GLOBAL.get_or_init(ThreadRegistry::new)
    }

    /// Attach a thread with the default bypass policy for its kind.
    pub fn attach(&self, id: u64, kind: TaskKind) -> CoordinationResult<Arc<RuntimeThread>> {
        self.attach_with_bypass(id, kind, kind.bypasses_safepoints())
    }

    /// Attach a thread, overriding whether it is excluded from safepoint
    /// waits. A freshly attached thread is running with all bits clear.
    pub fn attach_with_bypass(
        &self,
        id: u64,
        kind: TaskKind,
        bypass_safepoints: bool,
    ) -> CoordinationResult<Arc<RuntimeThread>> {
        let thread = Arc::new(RuntimeThread::new(
            id,
            kind,
            bypass_safepoints,
            self.events_tx.clone(),
        ));
        match self.threads.entry(id) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(CoordinationError::AlreadyAttached(id))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&thread));
                trace!(thread = id, ?kind, bypass_safepoints, "thread attached");
                let _ = self.events_tx.try_send(CoordinationEvent::ThreadAttached(id));
                Ok(thread)
            }
        }
    }

    /// Detach a thread. Refused while the thread is parked at a safepoint:
    /// an operation may still be counting on it.
    pub fn detach(&self, id: u64) -> CoordinationResult<()> {
        let thread = self
            .threads
            .get(&id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(CoordinationError::UnknownThread(id))?;
        if thread.is_blocked_for_safepoint() || thread.is_at_safepoint(SafepointLevel::Gc) {
            return Err(CoordinationError::DetachWhileParked(id));
        }
        self.threads.remove(&id);
        trace!(thread = id, "thread detached");
        let _ = self.events_tx.try_send(CoordinationEvent::ThreadDetached(id));
        Ok(())
    }

    pub fn get(&self, id: u64) -> Option<Arc<RuntimeThread>> {
        self.threads.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    /// Snapshot of every attached thread.
    pub fn threads(&self) -> Vec<Arc<RuntimeThread>> {
        self.threads
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Snapshot of the threads a safepoint operation must request and
    /// wait for: every attached thread that does not bypass safepoints.
    pub fn safepoint_targets(&self) -> Vec<Arc<RuntimeThread>> {
        self.threads
            .iter()
            .filter(|entry| !entry.value().bypass_safepoints())
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    /// Subscribe to coordination events. The bus is multi-consumer; each
    /// event is delivered to one receiver, so tests typically hold a
    /// single subscription.
    pub fn events(&self) -> flume::Receiver<CoordinationEvent> {
        self.events_rx.clone()
    }

    pub(crate) fn events_sender(&self) -> flume::Sender<CoordinationEvent> {
        self.events_tx.clone()
    }
}
