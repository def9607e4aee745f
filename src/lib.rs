//! Cooperative safepoint coordination for managed-runtime threads.
//!
//! Background services (a collector, a deoptimizer, a hot-reload engine)
//! need every application thread quiescent before they may inspect or
//! mutate shared structures. This crate implements the coordination core
//! those services build on: the per-thread safepoint state machine over a
//! single atomic word, a three-level safepoint hierarchy, lock-free fast
//! paths with monitor-protected slow paths, the blocking protocol for
//! mutators asked to pause, and mutator stealing for threads parked in
//! foreign code.
//!
//! The crate is purely reactive: it never invokes collection, deopt, or
//! reload logic itself. Operation drivers consume the requester primitives
//! ([`thread::RuntimeThread::set_safepoint_requested`],
//! [`thread::RuntimeThread::wait_until_at_safepoint`], bypass-aware
//! enumeration on [`registry::ThreadRegistry`]) or the packaged
//! [`operation::SafepointOperationScope`].

pub mod checkpoint_macros;
pub mod error;
pub mod events;
pub mod operation;
pub mod registry;
pub mod scopes;
pub mod state;
pub mod stats;
pub mod steal;
pub mod thread;
pub mod transitions;

pub use error::{CoordinationError, CoordinationResult};
pub use events::CoordinationEvent;
pub use operation::SafepointOperationScope;
pub use registry::ThreadRegistry;
pub use state::{
    ExecutionMode, RuntimeCallDeoptAbility, SafepointLevel, SafepointState, TaskKind,
    NUM_SAFEPOINT_LEVELS,
};
pub use steal::{try_steal_active_mutator, StolenMutator};
pub use thread::RuntimeThread;
pub use transitions::{call_blocked, call_native, ResumeDisposition};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attach_park_resume_smoke() {
        let registry = ThreadRegistry::new();
        let thread = registry.attach(1, TaskKind::Mutator).unwrap();

        thread.enter_safepoint();
        assert!(thread.is_at_safepoint(SafepointLevel::Gc));
        thread.exit_safepoint();
        assert_eq!(thread.state_word(), 0);
    }
}
