//! The mutator-stealing handshake across a blocking foreign call.

#![cfg(feature = "reload")]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use crossbeam_utils::Backoff;
use quiesce::registry::ThreadRegistry;
use quiesce::scopes::NoReloadScope;
use quiesce::state::{ExecutionMode, SafepointLevel, SafepointState, TaskKind};
use quiesce::steal::try_steal_active_mutator;
use quiesce::transitions::{call_native, ResumeDisposition};

fn spin_until(mut condition: impl FnMut() -> bool) {
    let backoff = Backoff::new();
    while !condition() {
        backoff.snooze();
    }
}

#[test]
fn steal_work_handback_while_owner_blocks_in_foreign_code() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let registry = ThreadRegistry::new();
    let owner = registry.attach(1, TaskKind::Mutator).unwrap();

    let (release_tx, release_rx) = mpsc::channel::<()>();
    let returned = Arc::new(AtomicBool::new(false));

    let handle = {
        let owner = Arc::clone(&owner);
        let returned = Arc::clone(&returned);
        thread::spawn(move || {
            let (_, disposition) = call_native(&owner, move || {
                // Unbounded foreign call: blocks until the test releases it.
                release_rx.recv().unwrap();
            });
            returned.store(true, Ordering::Release);
            disposition
        })
    };

    // The owner advertises the role once it is parked in foreign code.
    spin_until(|| owner.state_word() & SafepointState::MUTATOR_STEALABLE.bits() != 0);
    assert!(owner.is_at_safepoint(SafepointLevel::GcAndDeoptAndReload));

    let stolen = try_steal_active_mutator(&owner).expect("role was advertised");
    let word = owner.state_word();
    assert!(word & SafepointState::MUTATOR_STOLEN.bits() != 0);
    assert!(word & SafepointState::MUTATOR_STEALABLE.bits() == 0);
    // Stolen only ever holds while the owner is at the reload level.
    assert!(owner.is_at_safepoint(SafepointLevel::GcAndDeoptAndReload));

    // A second steal cannot succeed while the token is out.
    assert!(try_steal_active_mutator(&owner).is_none());

    // Let the foreign call return; the owner must rendezvous with the
    // stealer instead of resuming.
    release_tx.send(()).unwrap();
    thread::sleep(Duration::from_millis(100));
    assert!(!returned.load(Ordering::Acquire));

    stolen.hand_back();
    let disposition = handle.join().unwrap();

    assert!(returned.load(Ordering::Acquire));
    assert_eq!(disposition, ResumeDisposition::Resume);
    assert_eq!(owner.state_word(), 0);
    assert_eq!(owner.execution_mode(), ExecutionMode::InRuntime);
}

#[test]
fn handback_before_owner_returns_is_not_lost() {
    let registry = ThreadRegistry::new();
    let owner = registry.attach(1, TaskKind::Mutator).unwrap();

    let (release_tx, release_rx) = mpsc::channel::<()>();
    let handle = {
        let owner = Arc::clone(&owner);
        thread::spawn(move || {
            let (_, disposition) = call_native(&owner, move || {
                release_rx.recv().unwrap();
            });
            disposition
        })
    };

    spin_until(|| owner.state_word() & SafepointState::MUTATOR_STEALABLE.bits() != 0);
    let stolen = try_steal_active_mutator(&owner).expect("role was advertised");

    // Hand back while the owner is still away; the rendezvous must
    // already be satisfied when it returns.
    stolen.hand_back();
    release_tx.send(()).unwrap();

    assert_eq!(handle.join().unwrap(), ResumeDisposition::Resume);
    assert_eq!(owner.state_word(), 0);
}

#[test]
fn running_thread_is_not_stealable() {
    let registry = ThreadRegistry::new();
    let thread = registry.attach(1, TaskKind::Mutator).unwrap();
    assert!(try_steal_active_mutator(&thread).is_none());
}

#[test]
fn ordinary_safepoint_is_not_stealable() {
    let registry = ThreadRegistry::new();
    let thread = registry.attach(1, TaskKind::Mutator).unwrap();
    thread.enter_safepoint();
    assert!(try_steal_active_mutator(&thread).is_none());
    thread.exit_safepoint();
}

#[test]
fn no_reload_scope_suppresses_the_stealable_promise() {
    let registry = ThreadRegistry::new();
    let owner = registry.attach(1, TaskKind::Mutator).unwrap();

    let (entered_tx, entered_rx) = mpsc::channel::<()>();
    let (release_tx, release_rx) = mpsc::channel::<()>();

    let handle = {
        let owner = Arc::clone(&owner);
        thread::spawn(move || {
            let _guard = NoReloadScope::new(&owner);
            let (_, _) = call_native(&owner, move || {
                entered_tx.send(()).unwrap();
                release_rx.recv().unwrap();
            });
        })
    };

    entered_rx.recv().unwrap();
    // The thread parks at GC+deopt only and keeps the role to itself.
    spin_until(|| owner.is_at_safepoint(SafepointLevel::GcAndDeopt));
    assert!(owner.state_word() & SafepointState::MUTATOR_STEALABLE.bits() == 0);
    assert!(!owner.is_at_safepoint(SafepointLevel::GcAndDeoptAndReload));
    assert!(try_steal_active_mutator(&owner).is_none());

    release_tx.send(()).unwrap();
    handle.join().unwrap();
    assert_eq!(owner.state_word(), 0);
}
