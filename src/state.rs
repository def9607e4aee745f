//! Safepoint state word and the safepoint level hierarchy.
//!
//! Every runtime thread owns one atomic word that encodes its complete
//! safepoint-visible state: which levels it is currently at, which levels
//! other threads have requested, and the handful of flags driving the
//! foreign-call and stealing protocols. This module is the pure data layer;
//! it never blocks, allocates, or touches the word itself. The transition
//! protocol in [`crate::thread`] is the only place the word is mutated.

use bitflags::bitflags;

/// Number of levels in the safepoint hierarchy.
pub const NUM_SAFEPOINT_LEVELS: usize = 3;

/// The safepoint level a thread is at, or an operation is requested for.
///
/// The higher the level the stronger the guarantee:
/// * the time-to-safepoint latency increases with level
/// * the frequency of reachable safe points decreases with level
///
/// A thread at a stronger level is always also at every weaker level; the
/// encoding in [`SafepointState::at_bits`] makes that true by construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum SafepointLevel {
    /// Safe for the collector to inspect and move heap objects.
    Gc = 0,
    /// Safe to GC as well as deoptimize frames.
    GcAndDeopt = 1,
    /// Safe to GC, deoptimize, and reload program structure.
    GcAndDeoptAndReload = 2,
}

impl SafepointLevel {
    /// All levels, weakest first.
    pub const ALL: [SafepointLevel; NUM_SAFEPOINT_LEVELS] = [
        SafepointLevel::Gc,
        SafepointLevel::GcAndDeopt,
        SafepointLevel::GcAndDeoptAndReload,
    ];

    /// The strongest level this build supports.
    pub const fn strongest() -> SafepointLevel {
        if cfg!(feature = "reload") {
            SafepointLevel::GcAndDeoptAndReload
        } else {
            SafepointLevel::GcAndDeopt
        }
    }

    #[inline]
    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

/// Kind of work an attached thread performs.
///
/// Kinds that never execute managed or foreign code are excluded from every
/// safepoint wait: requests are not installed on them and operations do not
/// wait for them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    /// Executes application code that allocates and mutates the heap.
    Mutator,
    /// Background compilation on behalf of a mutator.
    Compiler,
    /// Collector helper (marking, scavenging).
    GcWorker,
    /// Sweeper helper.
    Sweeper,
    /// Service/introspection helper.
    ServiceWorker,
}

impl TaskKind {
    /// Whether threads of this kind are ignored for safepointing purposes.
    pub fn bypasses_safepoints(self) -> bool {
        matches!(self, TaskKind::GcWorker | TaskKind::Sweeper)
    }
}

/// Where a thread is currently executing.
///
/// Read-only input to the level computation; written only by the owning
/// thread at the defined transition points in [`crate::transitions`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ExecutionMode {
    /// Inside runtime (VM) code.
    InRuntime = 0,
    /// Inside compiled application code.
    InGenerated = 1,
    /// Inside a foreign-function call of unbounded duration.
    InNative = 2,
    /// Parked in a blocking operation the runtime knows about.
    Blocked = 3,
}

impl ExecutionMode {
    pub(crate) fn from_u8(raw: u8) -> ExecutionMode {
        match raw {
            0 => ExecutionMode::InRuntime,
            1 => ExecutionMode::InGenerated,
            2 => ExecutionMode::InNative,
            _ => ExecutionMode::Blocked,
        }
    }
}

/// Whether the current leaf runtime call tolerates lazy deoptimization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum RuntimeCallDeoptAbility {
    /// No leaf call, or a leaf call that may deoptimize after returning.
    #[default]
    CanLazyDeopt = 0,
    /// A leaf call the runtime must not unwind or deoptimize.
    CannotLazyDeopt = 1,
}

bitflags! {
    /// Bit layout of the per-thread safepoint state word.
    ///
    /// The word is consistent only while the owning thread's monitor is
    /// held, or immediately after a successful lock-free CAS. The
    /// `AT_*`/stealing bits are written cross-thread solely via the
    /// lock-protected slow paths; the `*_REQUESTED` bits are the only bits
    /// a requester mutates lock-free.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SafepointState: u64 {
        /// At a GC safepoint (owning thread sets this).
        const AT_GC = 1 << 0;
        /// A GC safepoint is requested (other threads set this).
        const GC_REQUESTED = 1 << 1;
        /// At a deopt safepoint.
        const AT_DEOPT = 1 << 2;
        /// A deopt safepoint is requested.
        const DEOPT_REQUESTED = 1 << 3;
        /// At a reload safepoint.
        const AT_RELOAD = 1 << 4;
        /// A reload safepoint is requested.
        const RELOAD_REQUESTED = 1 << 5;
        /// Parked in foreign code with the active-mutator role up for grabs.
        const MUTATOR_STEALABLE = 1 << 6;
        /// Another thread currently holds the stolen active-mutator role.
        const MUTATOR_STOLEN = 1 << 7;
        /// Parked inside `block_for_safepoint`, must be resumed on release.
        const BLOCKED_FOR_SAFEPOINT = 1 << 8;
        /// Never waited upon by any safepoint operation.
        const BYPASS_SAFEPOINTS = 1 << 9;
        /// Sticky: forces termination on every future foreign-call return.
        const UNWIND_IN_PROGRESS = 1 << 10;
        /// Mirror of `no_reload_depth > 0`, readable without the monitor.
        const NO_RELOAD_SCOPE = 1 << 11;
    }
}

impl SafepointState {
    const AT_BY_LEVEL: [SafepointState; NUM_SAFEPOINT_LEVELS] = [
        SafepointState::AT_GC,
        SafepointState::AT_DEOPT,
        SafepointState::AT_RELOAD,
    ];
    const REQUESTED_BY_LEVEL: [SafepointState; NUM_SAFEPOINT_LEVELS] = [
        SafepointState::GC_REQUESTED,
        SafepointState::DEOPT_REQUESTED,
        SafepointState::RELOAD_REQUESTED,
    ];

    /// All `AT_*` bits for `level` and every weaker level.
    ///
    /// Owning a stronger level implies owning the weaker ones, so the bits
    /// are always set and cleared as a unit.
    pub fn at_bits(level: SafepointLevel) -> SafepointState {
        let mut bits = SafepointState::empty();
        for l in &Self::AT_BY_LEVEL[..=level.index()] {
            bits |= *l;
        }
        bits
    }

    /// The single request bit for `level`.
    pub fn requested_bit(level: SafepointLevel) -> SafepointState {
        Self::REQUESTED_BY_LEVEL[level.index()]
    }

    /// Whether `word` is at a safepoint of strength `level`.
    pub fn is_at_safepoint(level: SafepointLevel, word: u64) -> bool {
        let mask = Self::at_bits(level);
        word & mask.bits() == mask.bits()
    }

    /// Whether any safepoint at `level` or weaker is requested in `word`.
    pub fn is_requested(level: SafepointLevel, word: u64) -> bool {
        for l in &Self::REQUESTED_BY_LEVEL[..=level.index()] {
            if word & l.bits() != 0 {
                return true;
            }
        }
        false
    }

    /// Whether exactly `level` is requested in `word`.
    pub fn is_level_requested(level: SafepointLevel, word: u64) -> bool {
        word & Self::requested_bit(level).bits() != 0
    }

    /// Canonical pattern for a thread about to cross into foreign code.
    pub fn native_unacquired() -> SafepointState {
        SafepointState::empty()
    }

    /// Canonical pattern for a thread parked in foreign code: at every
    /// level this build supports, with the active-mutator role stealable.
    pub fn native_acquired() -> SafepointState {
        Self::at_bits(SafepointLevel::strongest()) | SafepointState::MUTATOR_STEALABLE
    }

    /// Validates that `word` is one of the finitely many legal encodings.
    ///
    /// Used by stress tests sampling the word cross-thread at arbitrary
    /// times: no interleaving of the fast paths, the slow paths, and
    /// requester `fetch_or`/`fetch_and` may ever produce a word this
    /// rejects.
    pub fn is_legal_encoding(word: u64) -> bool {
        let state = SafepointState::from_bits_retain(word);
        // Stronger levels imply weaker ones.
        if state.contains(SafepointState::AT_RELOAD) && !state.contains(SafepointState::AT_DEOPT) {
            return false;
        }
        if state.contains(SafepointState::AT_DEOPT) && !state.contains(SafepointState::AT_GC) {
            return false;
        }
        // The stealing handshake is a one-shot transfer.
        if state.contains(SafepointState::MUTATOR_STEALABLE)
            && state.contains(SafepointState::MUTATOR_STOLEN)
        {
            return false;
        }
        // Stolen implies the owner is parked at the reload level.
        if cfg!(feature = "reload")
            && state.contains(SafepointState::MUTATOR_STOLEN)
            && !state.contains(SafepointState::AT_RELOAD)
        {
            return false;
        }
        // A blocked thread always published its At bits in the same store.
        if state.contains(SafepointState::BLOCKED_FOR_SAFEPOINT)
            && !state.contains(SafepointState::AT_GC)
        {
            return false;
        }
        true
    }
}
