//! Bypass-marked threads are invisible to safepoint operations: a
//! rendezvous over a group containing one completes without that thread
//! ever transitioning.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use quiesce::operation::SafepointOperationScope;
use quiesce::registry::ThreadRegistry;
use quiesce::state::{SafepointLevel, SafepointState, TaskKind};

#[test]
fn rendezvous_completes_without_the_bypass_thread() {
    let registry = Arc::new(ThreadRegistry::new());
    let stop = Arc::new(AtomicBool::new(false));

    let mut handles = Vec::new();
    for id in 1..=2u64 {
        let thread = registry.attach(id, TaskKind::Mutator).unwrap();
        let stop = Arc::clone(&stop);
        handles.push(thread::spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                thread.check_for_safepoint();
                std::hint::spin_loop();
            }
        }));
    }

    // The helper never polls, never parks, never transitions: if the
    // operation waited on it, the rendezvous below would hang forever.
    let helper = registry.attach(3, TaskKind::GcWorker).unwrap();
    {
        let helper = Arc::clone(&helper);
        let stop = Arc::clone(&stop);
        handles.push(thread::spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                std::hint::spin_loop();
            }
            drop(helper);
        }));
    }

    {
        let scope = SafepointOperationScope::rendezvous(&registry, SafepointLevel::Gc);
        assert_eq!(scope.targets().len(), 2);
        assert!(scope.all_quiescent());

        // The helper carries only its bypass marker the whole time.
        assert_eq!(
            helper.state_word(),
            SafepointState::BYPASS_SAFEPOINTS.bits()
        );
        assert!(!helper.is_at_safepoint(SafepointLevel::Gc));
    }

    stop.store(true, Ordering::Relaxed);
    for handle in handles {
        handle.join().unwrap();
    }
}

#[test]
fn bypass_override_excludes_a_mutator_kind() {
    let registry = ThreadRegistry::new();
    registry
        .attach_with_bypass(1, TaskKind::Mutator, true)
        .unwrap();
    assert!(registry.safepoint_targets().is_empty());
}
