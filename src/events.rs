//! Event bus payloads for safepoint coordination.

use crate::state::SafepointLevel;

/// Unified event type for the registry's flume event bus.
///
/// Events are published best-effort from the coordination slow paths; the
/// protocol never depends on them. Consumers (tests, monitoring) subscribe
/// through [`crate::registry::ThreadRegistry::events`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinationEvent {
    /// A thread joined the registry.
    ThreadAttached(u64),
    /// A thread left the registry.
    ThreadDetached(u64),
    /// A thread parked in `block_for_safepoint` at the given level.
    ThreadParked { thread: u64, level: SafepointLevel },
    /// A parked thread resumed after its request was cleared.
    ThreadResumed { thread: u64 },
    /// The active-mutator role was stolen from a thread parked in
    /// foreign code.
    MutatorStolen { thread: u64 },
    /// A stolen active-mutator role was handed back.
    MutatorHandedBack { thread: u64 },
    /// A safepoint operation finished its rendezvous at the given level.
    OperationBegan { level: SafepointLevel },
    /// A safepoint operation released its request.
    OperationReleased { level: SafepointLevel },
}
