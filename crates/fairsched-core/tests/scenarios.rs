//! Cross-module scenario tests (§8) driven entirely through the public API,
//! the way an external consumer of the crate would assemble a qdisc tree.

use std::sync::Arc;
use std::time::Duration;

use fairsched_core::qdisc::gfq::Gfq;
use fairsched_core::qdisc::{Classful, Queue, Weight};
use fairsched_core::queue::Fifo;
use fairsched_core::timing::VirtualTimeTable;
use fairsched_core::workload::{Workload, WorkloadHandle};
use fairsched_core::SchedulerConfig;

fn root() -> Gfq {
    Gfq::new(1, SchedulerConfig::default(), Arc::new(VirtualTimeTable::new()))
}

fn unit_workload() -> WorkloadHandle {
    Workload::new(Box::new(|flag| {
        flag.throw_if_cancellation_requested()?;
        Ok(())
    }), false)
}

#[test]
fn s5_canceling_before_dispatch_means_it_never_runs() {
    let w: Arc<Workload<()>> = Workload::new(Box::new(|_flag| Ok(())), false);
    w.request_cancellation();
    // A qdisc never gets the chance to mark this scheduled; enqueueing it
    // anyway (as a caller racing with the cancellation might) must not
    // make it runnable again.
    assert!(!w.mark_scheduled());
    assert!(!w.run());
}

#[test]
fn s6_remove_child_rejects_while_non_empty_then_drains_and_succeeds() {
    let q = root();
    let leaf: Arc<dyn Queue> = Arc::new(Fifo::new(42));
    assert!(q.add_child(leaf, Weight::uniform(1.0)));

    q.try_enqueue_by_handle(42, unit_workload()).unwrap();
    q.try_enqueue_by_handle(42, unit_workload()).unwrap();

    assert!(!q.try_remove_child(42), "must refuse removal while the child still has work");

    assert!(q.try_dequeue(0, false).is_some());
    assert!(!q.try_remove_child(42), "one item still remains");

    assert!(q.try_dequeue(0, false).is_some());
    assert!(q.try_remove_child(42), "now fully drained, removal must succeed");

    // The handle no longer routes anywhere.
    assert!(q.try_enqueue_by_handle(42, unit_workload()).is_err());
}

#[test]
fn s6_blocking_remove_waits_for_a_concurrent_drain() {
    let q = Arc::new(root());
    let leaf: Arc<dyn Queue> = Arc::new(Fifo::new(7));
    assert!(q.add_child(leaf, Weight::uniform(1.0)));
    q.try_enqueue_by_handle(7, unit_workload()).unwrap();

    let q2 = Arc::clone(&q);
    let drainer = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(15));
        q2.try_dequeue(0, false).is_some()
    });

    assert!(q.remove_child(7, Duration::from_secs(5)));
    assert!(drainer.join().unwrap());
}

#[test]
fn gfq_under_nested_qdiscs_routes_to_the_right_grandchild() {
    let root = root();
    let inner = Arc::new(Gfq::new(2, SchedulerConfig::default(), Arc::new(VirtualTimeTable::new())));
    let leaf: Arc<dyn Queue> = Arc::new(Fifo::new(99));
    assert!(inner.add_child(leaf, Weight::uniform(1.0)));
    assert!(root.add_child(inner, Weight::uniform(1.0)));

    assert!(root.try_enqueue_by_handle(99, unit_workload()).is_ok());
    assert!(root.try_dequeue(0, false).is_some());
}
