//! Nesting-counter scope guards feeding the level computation.
//!
//! All of these are owner-thread constructs: they mutate plain nesting
//! counters on the current thread and need no cross-thread visibility,
//! with one exception: the no-reload depth is mirrored into the state
//! word so requesters can observe it without taking the monitor.

use crate::state::RuntimeCallDeoptAbility;
use crate::thread::RuntimeThread;

/// While alive, this thread refuses to participate in reload safepoints:
/// its level is capped at GC+deopt and crossing into foreign code will not
/// offer the active-mutator role for stealing.
///
/// # Examples
///
/// ```
/// use quiesce::registry::ThreadRegistry;
/// use quiesce::scopes::NoReloadScope;
/// use quiesce::state::{SafepointLevel, TaskKind};
///
/// let registry = ThreadRegistry::new();
/// let thread = registry.attach(1, TaskKind::Mutator).unwrap();
/// {
///     let _scope = NoReloadScope::new(&thread);
///     assert_eq!(thread.current_safepoint_level(), SafepointLevel::GcAndDeopt);
/// }
/// ```
#[derive(Debug)]
pub struct NoReloadScope<'t> {
    thread: &'t RuntimeThread,
}

impl<'t> NoReloadScope<'t> {
    pub fn new(thread: &'t RuntimeThread) -> NoReloadScope<'t> {
        thread.begin_no_reload_scope();
        NoReloadScope { thread }
    }
}

impl Drop for NoReloadScope<'_> {
    fn drop(&mut self) {
        self.thread.end_no_reload_scope();
    }
}

/// Opts this thread into reload safepoints while alive. Reload
/// participation is opt-in: without an active participation scope (and
/// outside foreign code) a thread's level is capped at GC+deopt.
#[derive(Debug)]
pub struct ReloadParticipationScope<'t> {
    thread: &'t RuntimeThread,
}

impl<'t> ReloadParticipationScope<'t> {
    pub fn new(thread: &'t RuntimeThread) -> ReloadParticipationScope<'t> {
        thread.begin_reload_participation();
        ReloadParticipationScope { thread }
    }
}

impl Drop for ReloadParticipationScope<'_> {
    fn drop(&mut self) {
        self.thread.end_reload_participation();
    }
}

/// Debug-only guard asserting that no safepoint transition happens while
/// it is alive. Reaching a checkpoint or entering a safepoint inside one
/// is a fatal misuse: the scope exists precisely because the code inside
/// holds raw pointers an operation could invalidate.
///
/// Compiles to nothing in release builds.
#[derive(Debug)]
pub struct NoSafepointScope<'t> {
    #[cfg(debug_assertions)]
    thread: &'t RuntimeThread,
    #[cfg(not(debug_assertions))]
    _marker: std::marker::PhantomData<&'t RuntimeThread>,
}

impl<'t> NoSafepointScope<'t> {
    #[allow(unused_variables)]
    pub fn new(thread: &'t RuntimeThread) -> NoSafepointScope<'t> {
        #[cfg(debug_assertions)]
        {
            thread.begin_no_safepoint_scope();
            NoSafepointScope { thread }
        }
        #[cfg(not(debug_assertions))]
        {
            NoSafepointScope {
                _marker: std::marker::PhantomData,
            }
        }
    }
}

impl Drop for NoSafepointScope<'_> {
    fn drop(&mut self) {
        #[cfg(debug_assertions)]
        self.thread.end_no_safepoint_scope();
    }
}

/// Marks the duration of a leaf runtime call that must not be unwound or
/// lazily deoptimized; caps the thread's level at GC for the duration.
#[derive(Debug)]
pub struct RuntimeCallDeoptScope<'t> {
    thread: &'t RuntimeThread,
}

impl<'t> RuntimeCallDeoptScope<'t> {
    pub fn new(
        thread: &'t RuntimeThread,
        ability: RuntimeCallDeoptAbility,
    ) -> RuntimeCallDeoptScope<'t> {
        assert_eq!(
            thread.runtime_call_deopt_ability(),
            RuntimeCallDeoptAbility::CanLazyDeopt,
            "nested runtime-call deopt scopes"
        );
        thread.set_runtime_call_deopt_ability(ability);
        RuntimeCallDeoptScope { thread }
    }
}

impl Drop for RuntimeCallDeoptScope<'_> {
    fn drop(&mut self) {
        self.thread
            .set_runtime_call_deopt_ability(RuntimeCallDeoptAbility::CanLazyDeopt);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ThreadRegistry;
    use crate::state::{SafepointLevel, SafepointState, TaskKind};

    #[test]
    fn no_reload_scope_nests_and_mirrors_into_the_word() {
        let registry = ThreadRegistry::new();
        let thread = registry.attach(1, TaskKind::Mutator).unwrap();

        let outer = NoReloadScope::new(&thread);
        assert!(thread.state_word() & SafepointState::NO_RELOAD_SCOPE.bits() != 0);
        {
            let _inner = NoReloadScope::new(&thread);
            assert!(thread.state_word() & SafepointState::NO_RELOAD_SCOPE.bits() != 0);
        }
        // Still active: only the outermost drop clears the mirror bit.
        assert!(thread.state_word() & SafepointState::NO_RELOAD_SCOPE.bits() != 0);
        drop(outer);
        assert_eq!(thread.state_word(), 0);
    }

    #[cfg(feature = "reload")]
    #[test]
    fn participation_scope_raises_the_level() {
        let registry = ThreadRegistry::new();
        let thread = registry.attach(1, TaskKind::Mutator).unwrap();

        assert_eq!(thread.current_safepoint_level(), SafepointLevel::GcAndDeopt);
        {
            let _scope = ReloadParticipationScope::new(&thread);
            assert_eq!(
                thread.current_safepoint_level(),
                SafepointLevel::GcAndDeoptAndReload
            );
            // An enclosing no-reload scope wins over participation.
            let _cap = NoReloadScope::new(&thread);
            assert_eq!(thread.current_safepoint_level(), SafepointLevel::GcAndDeopt);
        }
        assert_eq!(thread.current_safepoint_level(), SafepointLevel::GcAndDeopt);
    }

    #[test]
    fn deopt_scope_caps_at_gc_and_restores() {
        let registry = ThreadRegistry::new();
        let thread = registry.attach(1, TaskKind::Mutator).unwrap();

        {
            let _scope =
                RuntimeCallDeoptScope::new(&thread, RuntimeCallDeoptAbility::CannotLazyDeopt);
            assert_eq!(thread.current_safepoint_level(), SafepointLevel::Gc);
        }
        assert_eq!(
            thread.runtime_call_deopt_ability(),
            RuntimeCallDeoptAbility::CanLazyDeopt
        );
    }
}
