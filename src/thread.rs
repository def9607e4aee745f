//! Per-thread safepoint state machine and the transition protocol.
//!
//! Each attached OS thread owns a [`RuntimeThread`]: one atomic state word
//! plus a monitor (mutex + condvar). In the steady state every transition
//! is a single CAS against a canonical "clean" pattern; any contention
//! (a request bit installed by an operation, an active scope, a steal in
//! flight) makes the CAS fail and routes the transition through the
//! monitor, which fully serializes slow-path and requester access to the
//! word.
//!
//! Cross-thread writers touch the word in exactly two ways: requesters
//! `fetch_or`/`fetch_and` the `*_REQUESTED` bits (monitor held), and the
//! stealing CAS in [`crate::steal`] flips the stealable/stolen pair. All
//! other bits are owner-written.
//!
//! # Examples
//!
//! ```
//! use quiesce::registry::ThreadRegistry;
//! use quiesce::state::TaskKind;
//!
//! let registry = ThreadRegistry::new();
//! let thread = registry.attach(1, TaskKind::Mutator).unwrap();
//!
//! // Interrupt checkpoint in application code: no-op without a request.
//! thread.check_for_safepoint();
//!
//! // Cooperative park/resume around runtime work.
//! thread.enter_safepoint();
//! thread.exit_safepoint();
//! ```

use std::sync::atomic::{AtomicI64, AtomicU64, AtomicU8, Ordering};

use parking_lot::{Condvar, Mutex};
use tracing::trace;

use crate::events::CoordinationEvent;
use crate::state::{
    ExecutionMode, RuntimeCallDeoptAbility, SafepointLevel, SafepointState, TaskKind,
};
use crate::stats;

/// Rendezvous bookkeeping guarded by the thread's monitor.
///
/// The steal/hand-back pair is a generation counter, not a flag: the owner
/// returning from foreign code waits for `handback_epoch` to catch up with
/// `steal_epoch`, so the predicate reads the same whether the hand-back
/// happened before, during, or after the owner's return.
#[derive(Debug, Default)]
pub(crate) struct Rendezvous {
    pub(crate) steal_epoch: u64,
    pub(crate) handback_epoch: u64,
}

/// The per-thread monitor: serializes slow-path transitions and
/// request/release signalling for one thread.
#[derive(Debug)]
pub(crate) struct Monitor {
    pub(crate) lock: Mutex<Rendezvous>,
    pub(crate) cv: Condvar,
}

/// Coordination state for one attached OS thread.
///
/// Constructed only through [`crate::registry::ThreadRegistry::attach`];
/// cross-thread access always goes through registry handles.
#[derive(Debug)]
pub struct RuntimeThread {
    id: u64,
    task_kind: TaskKind,
    safepoint_state: AtomicU64,
    pub(crate) monitor: Monitor,
    // The fields below are written only by the owning thread; they are
    // atomics solely so handles can be shared, and all accesses are
    // relaxed.
    execution_mode: AtomicU8,
    no_reload_depth: AtomicI64,
    allow_reload_depth: AtomicI64,
    runtime_call_deopt_ability: AtomicU8,
    #[cfg(debug_assertions)]
    no_safepoint_depth: AtomicI64,
    pub(crate) events: flume::Sender<CoordinationEvent>,
}

impl PartialEq for RuntimeThread {
    fn eq(&self, other: &RuntimeThread) -> bool {
        self.id == other.id
    }
}

impl Eq for RuntimeThread {}

impl RuntimeThread {
    pub(crate) fn new(
        id: u64,
        task_kind: TaskKind,
        bypass_safepoints: bool,
        events: flume::Sender<CoordinationEvent>,
    ) -> RuntimeThread {
        let initial = if bypass_safepoints {
            SafepointState::BYPASS_SAFEPOINTS.bits()
        } else {
            0
        };
        RuntimeThread {
            id,
            task_kind,
            safepoint_state: AtomicU64::new(initial),
            monitor: Monitor {
                lock: Mutex::new(Rendezvous::default()),
                cv: Condvar::new(),
            },
            execution_mode: AtomicU8::new(ExecutionMode::InRuntime as u8),
            no_reload_depth: AtomicI64::new(0),
            allow_reload_depth: AtomicI64::new(0),
            runtime_call_deopt_ability: AtomicU8::new(RuntimeCallDeoptAbility::CanLazyDeopt as u8),
            #[cfg(debug_assertions)]
            no_safepoint_depth: AtomicI64::new(0),
            events,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn task_kind(&self) -> TaskKind {
        self.task_kind
    }

    /// Raw snapshot of the state word.
    pub fn state_word(&self) -> u64 {
        self.safepoint_state.load(Ordering::Acquire)
    }

    pub(crate) fn raw_state(&self) -> &AtomicU64 {
        &self.safepoint_state
    }

    pub fn bypass_safepoints(&self) -> bool {
        self.state_word() & SafepointState::BYPASS_SAFEPOINTS.bits() != 0
    }

    /// Whether this thread currently owns a safepoint of strength `level`.
    pub fn is_at_safepoint(&self, level: SafepointLevel) -> bool {
        SafepointState::is_at_safepoint(level, self.state_word())
    }

    /// Whether any safepoint at this thread's current level is requested.
    pub fn is_safepoint_requested(&self) -> bool {
        SafepointState::is_requested(self.current_safepoint_level(), self.state_word())
    }

    /// Cross-thread view of the parked flag, for tests and monitoring.
    pub fn is_blocked_for_safepoint(&self) -> bool {
        self.state_word() & SafepointState::BLOCKED_FOR_SAFEPOINT.bits() != 0
    }

    pub fn execution_mode(&self) -> ExecutionMode {
        ExecutionMode::from_u8(self.execution_mode.load(Ordering::Relaxed))
    }

    /// Owner-only: record where this thread is executing. Callers go
    /// through the defined transitions in [`crate::transitions`].
    pub fn set_execution_mode(&self, mode: ExecutionMode) {
        self.execution_mode.store(mode as u8, Ordering::Relaxed);
    }

    pub fn runtime_call_deopt_ability(&self) -> RuntimeCallDeoptAbility {
        match self.runtime_call_deopt_ability.load(Ordering::Relaxed) {
            0 => RuntimeCallDeoptAbility::CanLazyDeopt,
            _ => RuntimeCallDeoptAbility::CannotLazyDeopt,
        }
    }

    pub(crate) fn set_runtime_call_deopt_ability(&self, ability: RuntimeCallDeoptAbility) {
        self.runtime_call_deopt_ability
            .store(ability as u8, Ordering::Relaxed);
    }

    /// Sticky: once set, every future foreign-call return must force
    /// termination of the logical task instead of resuming it.
    pub fn set_unwind_in_progress(&self) {
        self.safepoint_state
            .fetch_or(SafepointState::UNWIND_IN_PROGRESS.bits(), Ordering::SeqCst);
    }

    pub fn unwind_in_progress(&self) -> bool {
        self.state_word() & SafepointState::UNWIND_IN_PROGRESS.bits() != 0
    }

    // ------------------------------------------------------------------
    // Level computation
    // ------------------------------------------------------------------

    /// The strongest safepoint level this thread can currently promise.
    ///
    /// Evaluated fresh on every call; all inputs are owner-written, so the
    /// result is stable for the owner between its own mutations. The rule
    /// order is a contract: reordering changes which operations are safe
    /// under nested scope combinations.
    pub fn current_safepoint_level(&self) -> SafepointLevel {
        if self.runtime_call_deopt_ability() == RuntimeCallDeoptAbility::CannotLazyDeopt {
            return SafepointLevel::Gc;
        }
        if !cfg!(feature = "reload") {
            return SafepointLevel::GcAndDeopt;
        }
        if self.no_reload_depth.load(Ordering::Relaxed) > 0 {
            return SafepointLevel::GcAndDeopt;
        }
        if self.execution_mode() == ExecutionMode::InNative {
            return SafepointLevel::GcAndDeoptAndReload;
        }
        if self.allow_reload_depth.load(Ordering::Relaxed) <= 0 {
            return SafepointLevel::GcAndDeopt;
        }
        SafepointLevel::GcAndDeoptAndReload
    }

    // ------------------------------------------------------------------
    // Enter / exit
    // ------------------------------------------------------------------

    #[inline]
    fn try_enter_safepoint(&self) -> bool {
        let new = SafepointState::at_bits(self.current_safepoint_level()).bits();
        self.safepoint_state
            .compare_exchange(0, new, Ordering::Release, Ordering::Relaxed)
            .is_ok()
    }

    /// Mark this thread as being at a safepoint of its current level.
    ///
    /// Fast path is a single CAS from the clean pattern; contention (an
    /// installed request, an active scope bit) routes through the monitor.
    #[inline]
    pub fn enter_safepoint(&self) {
        self.assert_no_safepoint_scope();
        debug_assert!(
            !self.is_at_safepoint(SafepointLevel::Gc),
            "safepoint re-entered while already owned"
        );
        if !self.try_enter_safepoint() {
            self.enter_safepoint_using_lock();
        }
    }

    /// Slow-path enter: OR the At bits in under the monitor and wake any
    /// operation waiting for this thread. Never condition-waits, so the
    /// fast and slow paths cannot deadlock against a requester.
    #[cold]
    pub(crate) fn enter_safepoint_using_lock(&self) {
        let _guard = self.monitor.lock.lock();
        let bits = SafepointState::at_bits(self.current_safepoint_level());
        self.safepoint_state.fetch_or(bits.bits(), Ordering::SeqCst);
        self.monitor.cv.notify_all();
    }

    #[inline]
    fn try_exit_safepoint(&self) -> bool {
        let old = SafepointState::at_bits(self.current_safepoint_level()).bits();
        self.safepoint_state
            .compare_exchange(old, 0, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Leave the safepoint entered by [`enter_safepoint`](Self::enter_safepoint).
    ///
    /// Acquire ordering on the fast path: the resuming thread observes
    /// every heap and metadata write made while it was parked.
    #[inline]
    pub fn exit_safepoint(&self) {
        let word = self.state_word();
        debug_assert!(
            word & SafepointState::MUTATOR_STEALABLE.bits() == 0
                && word & SafepointState::MUTATOR_STOLEN.bits() == 0,
            "ordinary safepoint exit with a stealing handshake in flight"
        );
        if !self.try_exit_safepoint() {
            self.exit_safepoint_using_lock();
        }
    }

    /// Slow-path exit: the thread may not resume while an operation at its
    /// level is still in progress, so wait for the request to clear before
    /// dropping the At bits.
    #[cold]
    pub(crate) fn exit_safepoint_using_lock(&self) {
        let mut guard = self.monitor.lock.lock();
        let level = self.current_safepoint_level();
        assert!(
            SafepointState::is_at_safepoint(level, self.state_word()),
            "exited a safepoint that was never entered"
        );
        while SafepointState::is_requested(level, self.state_word()) {
            self.monitor.cv.wait(&mut guard);
        }
        self.safepoint_state
            .fetch_and(!SafepointState::at_bits(level).bits(), Ordering::SeqCst);
    }

    // ------------------------------------------------------------------
    // Checkpoint / blocking protocol
    // ------------------------------------------------------------------

    /// Interrupt-checkpoint entry point: park if any operation at this
    /// thread's current level has been requested, otherwise return
    /// immediately.
    #[inline(always)]
    pub fn check_for_safepoint(&self) {
        self.assert_no_safepoint_scope();
        stats::record_poll();
        let word = self.state_word();
        if SafepointState::is_requested(self.current_safepoint_level(), word) {
            debug_assert!(
                word & SafepointState::MUTATOR_STOLEN.bits() == 0,
                "checkpoint reached while the active-mutator role is stolen"
            );
            self.block_for_safepoint();
        }
    }

    /// Park until every request at this thread's current level is cleared.
    ///
    /// Publishes the At bits and the parked flag in a single store so no
    /// cross-thread sample can observe one without the other, wakes any
    /// waiting operation, then waits on the condvar for the release
    /// signal.
    #[cold]
    pub fn block_for_safepoint(&self) {
        let mut guard = self.monitor.lock.lock();
        let level = self.current_safepoint_level();
        if !SafepointState::is_requested(level, self.state_word()) {
            // The request was already released between the checkpoint and
            // taking the monitor.
            return;
        }

        trace!(thread = self.id, ?level, "parking for safepoint");
        let bits = SafepointState::at_bits(level) | SafepointState::BLOCKED_FOR_SAFEPOINT;
        self.safepoint_state.fetch_or(bits.bits(), Ordering::SeqCst);
        self.monitor.cv.notify_all();
        stats::record_park();
        let _ = self.events.try_send(CoordinationEvent::ThreadParked {
            thread: self.id,
            level,
        });

        while SafepointState::is_requested(level, self.state_word()) {
            self.monitor.cv.wait(&mut guard);
        }

        self.safepoint_state
            .fetch_and(!bits.bits(), Ordering::SeqCst);
        trace!(thread = self.id, "resumed from safepoint");
        let _ = self
            .events
            .try_send(CoordinationEvent::ThreadResumed { thread: self.id });
    }

    // ------------------------------------------------------------------
    // Requester-side primitives
    // ------------------------------------------------------------------

    /// Install or withdraw a safepoint request at `level`, returning the
    /// prior state word.
    ///
    /// The target's monitor is held for the duration, which serializes the
    /// request against the target's slow-path transitions; the bit itself
    /// is flipped lock-free so the target's fast paths observe it without
    /// the monitor. Set pulls with acquire from the release in the
    /// target's enter CAS; clear pushes with release to the acquire in the
    /// target's exit CAS, and wakes the target.
    pub fn set_safepoint_requested(&self, level: SafepointLevel, value: bool) -> u64 {
        let _guard = self.monitor.lock.lock();
        let mask = SafepointState::requested_bit(level).bits();
        if value {
            self.safepoint_state.fetch_or(mask, Ordering::Acquire)
        } else {
            let prior = self.safepoint_state.fetch_and(!mask, Ordering::Release);
            self.monitor.cv.notify_all();
            prior
        }
    }

    /// Block the calling (requester) thread until this thread owns a
    /// safepoint of strength `level`.
    pub fn wait_until_at_safepoint(&self, level: SafepointLevel) {
        let mut guard = self.monitor.lock.lock();
        while !SafepointState::is_at_safepoint(level, self.state_word()) {
            self.monitor.cv.wait(&mut guard);
        }
    }

    // ------------------------------------------------------------------
    // Scope-depth plumbing (owner-only, used by crate::scopes)
    // ------------------------------------------------------------------

    pub(crate) fn begin_no_reload_scope(&self) {
        let prior = self.no_reload_depth.fetch_add(1, Ordering::Relaxed);
        debug_assert!(prior >= 0, "no-reload scope depth underflow");
        if prior == 0 {
            self.safepoint_state
                .fetch_or(SafepointState::NO_RELOAD_SCOPE.bits(), Ordering::SeqCst);
        }
    }

    pub(crate) fn end_no_reload_scope(&self) {
        let prior = self.no_reload_depth.fetch_sub(1, Ordering::Relaxed);
        assert!(prior > 0, "no-reload scope exited more often than entered");
        if prior == 1 {
            self.safepoint_state
                .fetch_and(!SafepointState::NO_RELOAD_SCOPE.bits(), Ordering::SeqCst);
        }
    }

    pub(crate) fn begin_reload_participation(&self) {
        self.allow_reload_depth.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn end_reload_participation(&self) {
        let prior = self.allow_reload_depth.fetch_sub(1, Ordering::Relaxed);
        assert!(
            prior > 0,
            "reload-participation scope exited more often than entered"
        );
    }

    #[cfg(debug_assertions)]
    pub(crate) fn begin_no_safepoint_scope(&self) {
        self.no_safepoint_depth.fetch_add(1, Ordering::Relaxed);
    }

    #[cfg(debug_assertions)]
    pub(crate) fn end_no_safepoint_scope(&self) {
        let prior = self.no_safepoint_depth.fetch_sub(1, Ordering::Relaxed);
        assert!(prior > 0, "no-safepoint scope exited more often than entered");
    }

    #[inline]
    fn assert_no_safepoint_scope(&self) {
        #[cfg(debug_assertions)]
        debug_assert!(
            self.no_safepoint_depth.load(Ordering::Relaxed) == 0,
            "safepoint transition inside a no-safepoint scope"
        );
    }

    // ------------------------------------------------------------------
    // Foreign-call boundary
    // ------------------------------------------------------------------

    #[inline]
    fn try_enter_safepoint_to_native(&self) -> bool {
        let old = SafepointState::native_unacquired().bits();
        let new = SafepointState::native_acquired().bits();
        self.safepoint_state
            .compare_exchange(old, new, Ordering::Release, Ordering::Relaxed)
            .is_ok()
    }

    /// Enter a safepoint on the way into foreign code.
    ///
    /// A thread with no return address inside managed or runtime code
    /// holds no invariants at any level, and foreign code may block
    /// indefinitely where cooperative polling is impossible, so crossing
    /// the boundary satisfies all levels at once and offers the
    /// active-mutator role for stealing.
    pub fn enter_safepoint_to_native(&self) {
        self.assert_no_safepoint_scope();
        debug_assert!(
            !self.is_at_safepoint(SafepointLevel::Gc),
            "safepoint re-entered while already owned"
        );
        if !self.try_enter_safepoint_to_native() {
            // An active no-reload scope must suppress the stealable
            // promise, and a pending request forces the monitor anyway.
            self.enter_safepoint_using_lock();
            if self.state_word() & SafepointState::NO_RELOAD_SCOPE.bits() == 0 {
                self.safepoint_state
                    .fetch_or(SafepointState::MUTATOR_STEALABLE.bits(), Ordering::SeqCst);
            }
        }
    }

    #[inline]
    fn try_exit_safepoint_from_native(&self) -> bool {
        let old = SafepointState::native_acquired().bits();
        let new = SafepointState::native_unacquired().bits();
        self.safepoint_state
            .compare_exchange(old, new, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Leave the safepoint on return from foreign code.
    ///
    /// If the active-mutator role was stolen while this thread was away,
    /// the slow path clears the handshake bits and rendezvouses with the
    /// stealer before resuming.
    pub fn exit_safepoint_from_native(&self) {
        if !self.try_exit_safepoint_from_native() {
            let prior = self.exit_safepoint_from_native_using_lock();
            if prior & SafepointState::MUTATOR_STOLEN.bits() != 0 {
                self.set_execution_mode(ExecutionMode::InRuntime);
                self.begin_reload_participation();
                self.handle_stolen();
                self.end_reload_participation();
            }
        }

        let word = self.state_word();
        debug_assert!(
            word & SafepointState::MUTATOR_STEALABLE.bits() == 0
                && word & SafepointState::MUTATOR_STOLEN.bits() == 0,
            "stealing handshake survived the foreign-call return"
        );
    }

    /// Slow-path return from foreign code: wait out any operation at this
    /// thread's level, then drop the At bits and both stealing bits in a
    /// single store; no sampled word may ever show a stolen role without
    /// the reload-level At bit. Returns the prior word.
    #[cold]
    fn exit_safepoint_from_native_using_lock(&self) -> u64 {
        let mut guard = self.monitor.lock.lock();
        let level = self.current_safepoint_level();
        assert!(
            SafepointState::is_at_safepoint(level, self.state_word()),
            "exited a safepoint that was never entered"
        );
        while SafepointState::is_requested(level, self.state_word()) {
            self.monitor.cv.wait(&mut guard);
        }
        let mask = SafepointState::at_bits(level)
            | SafepointState::MUTATOR_STEALABLE
            | SafepointState::MUTATOR_STOLEN;
        self.safepoint_state
            .fetch_and(!mask.bits(), Ordering::SeqCst)
    }

    /// Rendezvous with the thread that stole this thread's active-mutator
    /// role: wait until every steal has been handed back.
    fn handle_stolen(&self) {
        trace!(thread = self.id, "returned from foreign code while stolen");
        let mut guard = self.monitor.lock.lock();
        while guard.handback_epoch < guard.steal_epoch {
            self.monitor.cv.wait(&mut guard);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ThreadRegistry;

    fn mutator(registry: &ThreadRegistry, id: u64) -> std::sync::Arc<RuntimeThread> {
        registry.attach(id, TaskKind::Mutator).unwrap()
    }

    #[test]
    fn fast_path_enter_exit_roundtrip() {
        let registry = ThreadRegistry::new();
        let thread = mutator(&registry, 1);

        assert_eq!(thread.state_word(), 0);
        thread.enter_safepoint();
        assert!(thread.is_at_safepoint(SafepointLevel::Gc));
        assert!(thread.is_at_safepoint(SafepointLevel::GcAndDeopt));
        thread.exit_safepoint();
        assert_eq!(thread.state_word(), 0);
    }

    #[test]
    fn enter_routes_through_lock_under_request() {
        let registry = ThreadRegistry::new();
        let thread = mutator(&registry, 1);

        thread.set_safepoint_requested(SafepointLevel::Gc, true);
        thread.enter_safepoint();
        assert!(thread.is_at_safepoint(SafepointLevel::Gc));
        assert!(SafepointState::is_legal_encoding(thread.state_word()));
        thread.set_safepoint_requested(SafepointLevel::Gc, false);
        thread.exit_safepoint();
        assert_eq!(thread.state_word(), 0);
    }

    #[test]
    fn checkpoint_is_noop_without_request() {
        let registry = ThreadRegistry::new();
        let thread = mutator(&registry, 1);
        thread.check_for_safepoint();
        assert_eq!(thread.state_word(), 0);
    }

    #[test]
    fn level_defaults_to_deopt_without_reload_participation() {
        let registry = ThreadRegistry::new();
        let thread = mutator(&registry, 1);
        // In-runtime, no scopes: reload participation is opt-in.
        assert_eq!(thread.current_safepoint_level(), SafepointLevel::GcAndDeopt);
    }

    #[cfg(feature = "reload")]
    #[test]
    fn level_precedence_contract() {
        let registry = ThreadRegistry::new();
        let thread = mutator(&registry, 1);

        // Rule 5/6: participation controls the reload level.
        thread.begin_reload_participation();
        assert_eq!(
            thread.current_safepoint_level(),
            SafepointLevel::GcAndDeoptAndReload
        );

        // Rule 4: foreign code always reaches the reload level.
        thread.end_reload_participation();
        thread.set_execution_mode(ExecutionMode::InNative);
        assert_eq!(
            thread.current_safepoint_level(),
            SafepointLevel::GcAndDeoptAndReload
        );

        // Rule 3 beats rule 4.
        thread.begin_no_reload_scope();
        assert_eq!(thread.current_safepoint_level(), SafepointLevel::GcAndDeopt);

        // Rule 1 beats everything.
        thread.set_runtime_call_deopt_ability(RuntimeCallDeoptAbility::CannotLazyDeopt);
        assert_eq!(thread.current_safepoint_level(), SafepointLevel::Gc);

        thread.set_runtime_call_deopt_ability(RuntimeCallDeoptAbility::CanLazyDeopt);
        thread.end_no_reload_scope();
        thread.set_execution_mode(ExecutionMode::InRuntime);
    }

    #[test]
    fn requester_sees_prior_word() {
        let registry = ThreadRegistry::new();
        let thread = mutator(&registry, 1);

        let prior = thread.set_safepoint_requested(SafepointLevel::Gc, true);
        assert_eq!(prior, 0);
        let prior = thread.set_safepoint_requested(SafepointLevel::GcAndDeopt, true);
        assert_eq!(prior, SafepointState::GC_REQUESTED.bits());
        thread.set_safepoint_requested(SafepointLevel::Gc, false);
        thread.set_safepoint_requested(SafepointLevel::GcAndDeopt, false);
        assert_eq!(thread.state_word(), 0);
    }

    #[test]
    fn unwind_flag_is_sticky() {
        let registry = ThreadRegistry::new();
        let thread = mutator(&registry, 1);
        thread.set_unwind_in_progress();
        thread.enter_safepoint();
        thread.exit_safepoint();
        assert!(thread.unwind_in_progress());
    }
}
