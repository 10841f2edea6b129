//! `Fifo`: a minimal `VecDeque`-backed classless leaf (C6), used as
//! test/benchmark scaffolding for the GFQ classful qdisc.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::ScheduleError;
use crate::qdisc::{ClassifyState, Classful, Queue, RoutingPathEntry};
use crate::workload::WorkloadHandle;

pub struct Fifo {
    handle: u64,
    items: Mutex<VecDeque<WorkloadHandle>>,
    completed: AtomicBool,
    predicate: Option<Arc<dyn Fn(&ClassifyState<'_>) -> bool + Send + Sync>>,
}

impl Fifo {
    pub fn new(handle: u64) -> Self {
        Self {
            handle,
            items: Mutex::new(VecDeque::new()),
            completed: AtomicBool::new(false),
            predicate: None,
        }
    }

    pub fn with_predicate(
        handle: u64,
        predicate: Arc<dyn Fn(&ClassifyState<'_>) -> bool + Send + Sync>,
    ) -> Self {
        Self {
            handle,
            items: Mutex::new(VecDeque::new()),
            completed: AtomicBool::new(false),
            predicate: Some(predicate),
        }
    }
}

impl Queue for Fifo {
    fn handle(&self) -> u64 {
        self.handle
    }

    fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    fn best_effort_count(&self) -> usize {
        self.items.lock().len()
    }

    /// Unconditional push: the low-level primitive used internally (e.g. by
    /// `remove_child`'s drain path) even after `complete()`. Rejection of
    /// new work happens at the `try_enqueue*` validating paths, not here.
    fn enqueue(&self, workload: WorkloadHandle) {
        workload.mark_scheduled();
        self.items.lock().push_back(workload);
    }

    fn try_dequeue(&self, _worker_id: u64, _back_track: bool) -> Option<WorkloadHandle> {
        self.items.lock().pop_front()
    }

    fn try_peek(&self, _worker_id: u64) -> Option<WorkloadHandle> {
        self.items.lock().front().cloned()
    }

    fn can_classify(&self, state: &ClassifyState<'_>) -> bool {
        if self.completed.load(Ordering::Acquire) {
            return false;
        }
        self.predicate.as_ref().is_some_and(|p| p(state))
    }

    fn try_enqueue(&self, state: &ClassifyState<'_>, workload: WorkloadHandle) -> bool {
        if !self.can_classify(state) {
            return false;
        }
        self.enqueue(workload);
        true
    }

    fn try_enqueue_direct(&self, _state: &ClassifyState<'_>, workload: WorkloadHandle) -> bool {
        if self.completed.load(Ordering::Acquire) {
            return false;
        }
        self.enqueue(workload);
        true
    }

    fn try_find_route(&self, handle: u64, _path: &mut crate::qdisc::RoutingPath) -> bool {
        handle == self.handle
    }

    fn will_enqueue_from_routing_path(&self, _entry: &RoutingPathEntry, _workload: &WorkloadHandle) {}

    fn try_enqueue_by_handle(&self, handle: u64, workload: WorkloadHandle) -> Result<(), ScheduleError> {
        if handle != self.handle {
            return Err(ScheduleError::NoRoute(handle));
        }
        if self.completed.load(Ordering::Acquire) {
            return Err(ScheduleError::Disposed);
        }
        self.enqueue(workload);
        Ok(())
    }

    fn complete(&self) {
        self.completed.store(true, Ordering::Release);
    }

    fn dispose(&self) {
        self.completed.store(true, Ordering::Release);
    }

    fn on_worker_terminated(&self, _worker_id: u64) {}

    fn as_classful(&self) -> Option<&dyn Classful> {
        None
    }
}
