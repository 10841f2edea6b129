//! Generalized fair queueing classful qdisc (C7): a dynamic set of weighted
//! children, selected for dequeue by minimum virtual finish time (§4.5).
//!
//! Each child gets a single-slot candidate buffer guarded by its own mutex
//! so the selection scan never blocks on a child actually being drained —
//! a concurrent scanner that can't acquire a child's slot just skips it for
//! this round rather than waiting (§4.5 step 3, "try-lock repopulation").

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};

use crate::bitmap::ConcurrentBitmap;
use crate::config::{FairnessMode, SchedulerConfig};
use crate::error::{ScheduleError, SchedulerInconsistency};
use crate::queue::Fifo;
use crate::sync::AlphaBetaLock;
use crate::timing::VirtualTimeTable;
use crate::workload::{SchedulerAnnotation, WorkloadHandle};

use super::{
    classful_enqueue_by_handle, classful_find_route, ClassifyState, Classful, Queue, RoutingPath,
    RoutingPathEntry, Weight,
};

/// Index of the qdisc's own classifying child, always present (§4.2
/// "every classful qdisc carries a root child for unmatched classless
/// enqueues").
const LOCAL_CHILD_INDEX: usize = 0;

thread_local! {
    /// Last child index a thread enqueued into, per qdisc handle — used to
    /// set that child's emptiness bit after the enqueue actually lands
    /// (§4.5 "enqueue emptiness propagation"), without threading the index
    /// back out through `Queue::enqueue`'s return type.
    static LAST_ENQUEUED: RefCell<Vec<(u64, usize)>> = const { RefCell::new(Vec::new()) };
}

fn record_last_enqueued(qdisc: u64, idx: usize) {
    LAST_ENQUEUED.with(|cell| {
        let mut v = cell.borrow_mut();
        match v.iter_mut().find(|(id, _)| *id == qdisc) {
            Some(entry) => entry.1 = idx,
            None => v.push((qdisc, idx)),
        }
    });
}

fn take_last_enqueued(qdisc: u64) -> Option<usize> {
    LAST_ENQUEUED.with(|cell| {
        let mut v = cell.borrow_mut();
        let pos = v.iter().position(|(id, _)| *id == qdisc)?;
        Some(v.remove(pos).1)
    })
}

struct ChildSlot {
    candidate: Option<WorkloadHandle>,
    last_vft: f64,
}

struct ChildState {
    queue: Arc<dyn Queue>,
    weight: Weight,
    slot: Mutex<ChildSlot>,
}

impl ChildState {
    fn new(queue: Arc<dyn Queue>, weight: Weight) -> Self {
        Self {
            queue,
            weight,
            slot: Mutex::new(ChildSlot { candidate: None, last_vft: 0.0 }),
        }
    }
}

struct BetaGuard<'a> {
    lock: &'a AlphaBetaLock,
}

impl Drop for BetaGuard<'_> {
    fn drop(&mut self) {
        let _ = self.lock.exit_beta();
    }
}

struct AlphaGuard<'a> {
    lock: &'a AlphaBetaLock,
}

impl Drop for AlphaGuard<'_> {
    fn drop(&mut self) {
        let _ = self.lock.exit_alpha();
    }
}

/// A weighted, virtual-time-ordered classful qdisc (C7).
pub struct Gfq {
    handle: u64,
    config: SchedulerConfig,
    timing: Arc<VirtualTimeTable>,
    children: RwLock<Vec<Arc<ChildState>>>,
    emptiness: ConcurrentBitmap,
    generation: AtomicU64,
    structural: AlphaBetaLock,
    completed: AtomicBool,
}

impl Gfq {
    /// A new GFQ node with a single classifying local child at index 0.
    pub fn new(handle: u64, config: SchedulerConfig, timing: Arc<VirtualTimeTable>) -> Self {
        let local: Arc<dyn Queue> = Arc::new(Fifo::new(handle));
        Self {
            handle,
            config,
            timing,
            children: RwLock::new(vec![Arc::new(ChildState::new(local, Weight::uniform(1.0)))]),
            emptiness: ConcurrentBitmap::new(1, config),
            generation: AtomicU64::new(0),
            structural: AlphaBetaLock::new(config),
            completed: AtomicBool::new(false),
        }
    }

    fn enter_beta(&self) -> BetaGuard<'_> {
        let admitted = self
            .structural
            .enter_beta(Duration::from_secs(30))
            .expect("beta entry should not fail under normal operation");
        assert!(admitted, "beta entry timed out");
        BetaGuard { lock: &self.structural }
    }

    fn enter_alpha(&self) -> AlphaGuard<'_> {
        let admitted = self
            .structural
            .enter_alpha(Duration::from_secs(30))
            .expect("alpha entry should not fail under normal operation");
        assert!(admitted, "alpha entry timed out");
        AlphaGuard { lock: &self.structural }
    }

    /// §4.5: execution time estimate scaled by scheduling weight. Higher
    /// weight means a smaller per-service increment, so a heavier child's
    /// virtual finish time grows more slowly and it is selected more often
    /// (the weight ratio invariant of §8 invariant 7 / scenario S3).
    fn virtual_execution_time_nanos(&self, fingerprint: u64, weight: Weight) -> f64 {
        let estimate = self.timing.estimate_nanos(fingerprint, self.config.time_model);
        estimate / weight.scheduling_weight.max(f64::MIN_POSITIVE)
    }

    fn virtual_finish_time(&self, fingerprint: u64, weight: Weight, last_vft: f64) -> f64 {
        last_vft + self.virtual_execution_time_nanos(fingerprint, weight)
    }

    /// §4.5: the finish time a child is rebased to once it has actually
    /// been served. In short-term fairness mode this is pegged to the
    /// scheduler's global virtual clock rather than the child's own prior
    /// finish time, so a child that falls behind catches back up instead
    /// of accumulating an ever-growing debt.
    fn virtual_accumulated_finish_time(&self, fingerprint: u64, weight: Weight, last_vft: f64) -> f64 {
        let base = match self.config.fairness_mode {
            FairnessMode::ShortTerm => self.timing.now() as f64,
            FairnessMode::LongTerm => last_vft,
        };
        let estimate = self.timing.estimate_nanos(fingerprint, self.config.time_model);
        base + estimate * weight.punishment_factor
    }

    fn annotation_for(&self, child: &ChildState, workload: &WorkloadHandle) -> SchedulerAnnotation {
        SchedulerAnnotation {
            fingerprint: workload.fingerprint(),
            scheduling_weight: child.weight.scheduling_weight,
            punishment_factor: child.weight.punishment_factor,
        }
    }

    /// Unconditionally sets the last-enqueued child's has-data bit, then
    /// clears the thread-local record (§4.5 "enqueue emptiness propagation").
    fn on_work_scheduled(&self) {
        if let Some(idx) = take_last_enqueued(self.handle) {
            self.emptiness.update_bit(idx, true);
        }
    }

    /// Best-effort clear of a child's has-data bit once it reports empty,
    /// bounded by `dequeue_retry_bound` token-CAS retries (§4.5 step 3).
    fn clear_has_data_if_empty(&self, idx: usize, child: &ChildState) {
        if !child.queue.is_empty() {
            return;
        }
        for _ in 0..self.config.dequeue_retry_bound {
            let token = self.emptiness.get_token(idx);
            if self.emptiness.try_update_bit(idx, token, false) {
                return;
            }
            if !child.queue.is_empty() {
                return;
            }
        }
    }

    fn enqueue_at_index(&self, idx: usize, workload: WorkloadHandle) {
        let _beta = self.enter_beta();
        let children = self.children.read();
        let Some(child) = children.get(idx) else { return };
        workload.push_annotation(self.annotation_for(child, &workload));
        child.queue.enqueue(workload);
        record_last_enqueued(self.handle, idx);
        drop(children);
        drop(_beta);
        self.on_work_scheduled();
    }

    /// The core selection algorithm (§4.5 steps 1-6): scan every non-empty
    /// child, repopulating its candidate buffer on a try-lock basis,
    /// selecting the minimum virtual finish time, and (when `consume` is
    /// set) CAS-claiming it by generation number. `consume = false`
    /// implements `try_peek`: the same selection, without mutating any
    /// child's buffer or `last_vft`.
    fn select(&self, worker_id: u64, consume: bool) -> Option<WorkloadHandle> {
        if self.completed.load(Ordering::Acquire) {
            return None;
        }
        loop {
            let _beta = self.enter_beta();
            if self.emptiness.is_empty() {
                return None;
            }
            let generation_before = self.generation.load(Ordering::Acquire);
            let children = self.children.read().clone();

            let mut best: Option<(usize, f64)> = None;
            for (idx, child) in children.iter().enumerate() {
                if !self.emptiness.is_bit_set(idx) {
                    continue;
                }
                // Never block on a contended child slot: a scanner that
                // can't acquire it just skips the child for this round.
                let Some(mut slot) = child.slot.try_lock() else { continue };
                if slot.candidate.is_none() {
                    match child.queue.try_dequeue(worker_id, false) {
                        Some(next) => {
                            slot.candidate = Some(next);
                            self.generation.fetch_add(1, Ordering::AcqRel);
                        }
                        None => {
                            drop(slot);
                            self.clear_has_data_if_empty(idx, child);
                            continue;
                        }
                    }
                }
                if let Some(candidate) = &slot.candidate {
                    let vft = self.virtual_finish_time(candidate.fingerprint(), child.weight, slot.last_vft);
                    if best.is_none_or(|(_, b)| vft < b) {
                        best = Some((idx, vft));
                    }
                }
            }

            if self.generation.load(Ordering::Acquire) != generation_before {
                continue; // step 4: repopulation raced under us, restart the scan
            }

            let Some((idx, _)) = best else {
                if self.emptiness.is_empty() {
                    return None;
                }
                drop(_beta);
                std::thread::yield_now();
                continue;
            };

            let child = &children[idx];
            if !consume {
                return child.slot.lock().candidate.clone();
            }

            let mut slot = child.slot.lock();
            let Some(candidate) = slot.candidate.take() else {
                continue; // lost the claim race, restart
            };
            let fingerprint = candidate.fingerprint();
            slot.last_vft = self.virtual_accumulated_finish_time(fingerprint, child.weight, slot.last_vft);
            if let Some(next) = child.queue.try_dequeue(worker_id, false) {
                slot.candidate = Some(next);
            } else {
                drop(slot);
                self.clear_has_data_if_empty(idx, child);
            }
            self.generation.fetch_add(1, Ordering::AcqRel);
            if candidate.pop_annotation().is_none() {
                // §7: a dequeued workload with no annotation is a scheduler
                // inconsistency. Log it and drop the offending workload
                // rather than dispatching it.
                let inconsistency = SchedulerInconsistency::MissingAnnotation(candidate.id());
                log::warn!("gfq {}: {inconsistency}", self.handle);
                continue;
            }
            return Some(candidate);
        }
    }

    fn remove_child_impl(&self, handle: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let found_non_empty = {
                let children = self.children.read();
                match children.iter().find(|c| c.queue.handle() == handle) {
                    Some(c) => Some(!c.queue.is_empty()),
                    None => return false,
                }
            };
            match found_non_empty {
                Some(false) => break,
                Some(true) => {
                    if Instant::now() >= deadline {
                        return false;
                    }
                    std::thread::yield_now();
                }
                None => unreachable!(),
            }
        }

        let _alpha = self.enter_alpha();
        let mut children = self.children.write();
        let Some(idx) = children.iter().position(|c| c.queue.handle() == handle) else {
            return false;
        };
        children[idx].queue.complete();
        // Drain any residual workload that raced in between the emptiness
        // check above and taking the write lock, into the local child
        // rather than dropping it.
        while let Some(stray) = children[idx].queue.try_dequeue(0, false) {
            children[LOCAL_CHILD_INDEX].queue.enqueue(stray);
        }
        children.remove(idx);
        drop(children);
        self.emptiness.remove_bit_at(idx, true);
        log::debug!("gfq {} removed child {}", self.handle, handle);
        true
    }
}

impl Queue for Gfq {
    fn handle(&self) -> u64 {
        self.handle
    }

    fn is_empty(&self) -> bool {
        self.emptiness.is_empty()
    }

    fn best_effort_count(&self) -> usize {
        let _alpha = self.enter_alpha();
        self.children.read().iter().map(|c| c.queue.best_effort_count()).sum()
    }

    fn enqueue(&self, workload: WorkloadHandle) {
        self.enqueue_at_index(LOCAL_CHILD_INDEX, workload);
    }

    fn try_dequeue(&self, worker_id: u64, _back_track: bool) -> Option<WorkloadHandle> {
        self.select(worker_id, true)
    }

    fn try_peek(&self, worker_id: u64) -> Option<WorkloadHandle> {
        self.select(worker_id, false)
    }

    fn can_classify(&self, state: &ClassifyState<'_>) -> bool {
        let _beta = self.enter_beta();
        self.children.read().iter().any(|c| c.queue.can_classify(state))
    }

    fn try_enqueue(&self, state: &ClassifyState<'_>, workload: WorkloadHandle) -> bool {
        let _beta = self.enter_beta();
        let children = self.children.read();
        for (idx, child) in children.iter().enumerate() {
            if !child.queue.can_classify(state) {
                continue;
            }
            let annotated = Arc::clone(&workload);
            annotated.push_annotation(self.annotation_for(child, &annotated));
            if child.queue.try_enqueue(state, annotated) {
                record_last_enqueued(self.handle, idx);
                drop(children);
                drop(_beta);
                self.on_work_scheduled();
                return true;
            }
        }
        let fell_through = self.try_enqueue_direct_locked(&children, state, workload);
        drop(children);
        drop(_beta);
        if fell_through {
            self.on_work_scheduled();
        }
        fell_through
    }

    fn try_enqueue_direct(&self, state: &ClassifyState<'_>, workload: WorkloadHandle) -> bool {
        let _beta = self.enter_beta();
        let children = self.children.read();
        let result = self.try_enqueue_direct_locked(&children, state, workload);
        drop(children);
        drop(_beta);
        if result {
            self.on_work_scheduled();
        }
        result
    }

    fn try_find_route(&self, handle: u64, path: &mut RoutingPath) -> bool {
        let _beta = self.enter_beta();
        classful_find_route(self, handle, path)
    }

    fn will_enqueue_from_routing_path(&self, entry: &RoutingPathEntry, workload: &WorkloadHandle) {
        let children = self.children.read();
        if let Some(child) = children.get(entry.child_index) {
            workload.push_annotation(self.annotation_for(child, workload));
        }
        drop(children);
        self.emptiness.update_bit(entry.child_index, true);
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    fn try_enqueue_by_handle(&self, handle: u64, workload: WorkloadHandle) -> Result<(), ScheduleError> {
        if self.completed.load(Ordering::Acquire) {
            return Err(ScheduleError::Disposed);
        }
        let _beta = self.enter_beta();
        classful_enqueue_by_handle(self, handle, workload)
    }

    fn complete(&self) {
        if self.completed.swap(true, Ordering::AcqRel) {
            return;
        }
        let children = self.children.read();
        for child in children.iter() {
            child.queue.complete();
        }
    }

    fn dispose(&self) {
        self.complete();
        self.structural.dispose();
    }

    fn on_worker_terminated(&self, worker_id: u64) {
        let children = self.children.read();
        for child in children.iter() {
            child.queue.on_worker_terminated(worker_id);
        }
    }

    fn as_classful(&self) -> Option<&dyn Classful> {
        Some(self)
    }
}

impl Gfq {
    /// Shared tail of `try_enqueue`/`try_enqueue_direct`: bypasses child
    /// predicates entirely and enqueues straight into the local child.
    fn try_enqueue_direct_locked(
        &self,
        children: &[Arc<ChildState>],
        state: &ClassifyState<'_>,
        workload: WorkloadHandle,
    ) -> bool {
        let Some(local) = children.get(LOCAL_CHILD_INDEX) else { return false };
        let annotated = Arc::clone(&workload);
        annotated.push_annotation(self.annotation_for(local, &annotated));
        if local.queue.try_enqueue_direct(state, annotated) {
            record_last_enqueued(self.handle, LOCAL_CHILD_INDEX);
            true
        } else {
            false
        }
    }
}

impl Classful for Gfq {
    fn num_children(&self) -> usize {
        self.children.read().len()
    }

    fn child_at(&self, index: usize) -> Option<Arc<dyn Queue>> {
        self.children.read().get(index).map(|c| Arc::clone(&c.queue))
    }

    fn add_child(&self, child: Arc<dyn Queue>, weight: Weight) -> bool {
        let _alpha = self.enter_alpha();
        let mut children = self.children.write();
        if children.iter().any(|c| c.queue.handle() == child.handle()) {
            return false;
        }
        // Rebasing every existing child's last_vft to zero keeps a newly
        // admitted child from being starved by accumulated history it took
        // no part in (§4.5 "structural add/remove rebases last_vft").
        for c in children.iter() {
            c.slot.lock().last_vft = 0.0;
        }
        children.push(Arc::new(ChildState::new(child, weight)));
        drop(children);
        self.emptiness.grow(1);
        log::debug!("gfq {} admitted a new child", self.handle);
        true
    }

    fn remove_child(&self, handle: u64, timeout: Duration) -> bool {
        self.remove_child_impl(handle, timeout)
    }

    fn try_remove_child(&self, handle: u64) -> bool {
        self.remove_child_impl(handle, Duration::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::fifo::Fifo as LeafFifo;
    use crate::workload::Workload;
    use std::time::Duration;

    fn gfq() -> Gfq {
        Gfq::new(1, SchedulerConfig::default(), Arc::new(VirtualTimeTable::new()))
    }

    fn item(n: i32) -> WorkloadHandle {
        Workload::new(Box::new(move |_flag| Ok(n)), false)
    }

    #[test]
    fn root_enqueue_dequeue_round_trips() {
        // §8 invariant 8
        let q = gfq();
        assert!(q.is_empty());
        q.enqueue(item(1));
        assert!(!q.is_empty());
        let out = q.try_dequeue(0, false);
        assert!(out.is_some());
        assert!(q.try_dequeue(0, false).is_none());
        assert!(q.is_empty());
    }

    #[test]
    fn add_child_then_route_by_handle() {
        let q = gfq();
        let child: Arc<dyn Queue> = Arc::new(LeafFifo::new(42));
        assert!(q.add_child(child, Weight::uniform(1.0)));
        let submitted = item(5);
        let submitted_id = submitted.id();
        assert!(q.try_enqueue_by_handle(42, submitted).is_ok());
        let out = q.try_dequeue(0, false).unwrap();
        assert_eq!(out.id(), submitted_id);
        assert!(q.is_empty());
    }

    #[test]
    fn add_child_rejects_duplicate_handle() {
        let q = gfq();
        assert!(q.add_child(Arc::new(LeafFifo::new(7)), Weight::uniform(1.0)));
        assert!(!q.add_child(Arc::new(LeafFifo::new(7)), Weight::uniform(1.0)));
    }

    #[test]
    fn try_remove_child_fails_while_non_empty_then_succeeds_once_drained() {
        // §8 scenario S6
        let q = gfq();
        let child: Arc<dyn Queue> = Arc::new(LeafFifo::new(9));
        assert!(q.add_child(child, Weight::uniform(1.0)));
        q.try_enqueue_by_handle(9, item(1)).unwrap();
        assert!(!q.try_remove_child(9));
        assert!(q.try_dequeue(0, false).is_some());
        assert!(q.try_remove_child(9));
        assert_eq!(
            q.try_enqueue_by_handle(9, item(2)),
            Err(ScheduleError::NoRoute(9))
        );
    }

    #[test]
    fn remove_child_blocks_until_empty_then_succeeds() {
        let q = Arc::new(gfq());
        let child: Arc<dyn Queue> = Arc::new(LeafFifo::new(3));
        assert!(q.add_child(child, Weight::uniform(1.0)));
        q.try_enqueue_by_handle(3, item(1)).unwrap();

        let q2 = Arc::clone(&q);
        let drainer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            q2.try_dequeue(0, false)
        });
        assert!(q.remove_child(3, Duration::from_secs(5)));
        assert!(drainer.join().unwrap().is_some());
    }

    const LIGHT_FINGERPRINT: u64 = 100;
    const HEAVY_FINGERPRINT: u64 = 200;

    fn fingerprinted(fingerprint: u64) -> WorkloadHandle {
        Workload::new_with_fingerprint(Box::new(move |_flag| Ok(())), false, fingerprint)
    }

    #[test]
    fn heavier_weight_child_receives_more_dequeues() {
        // §8 invariant 7 / scenario S3: a 3x-weighted child should pull a
        // clear majority of dequeues away from a 1x sibling once the
        // virtual clock has actually advanced through recorded service
        // times (short-term fairness mode rebases last_vft off `now()`,
        // which only moves when the caller reports elapsed work back via
        // `VirtualTimeTable::record`, the way a real worker loop would).
        let q = gfq();
        let light: Arc<dyn Queue> = Arc::new(LeafFifo::new(10));
        let heavy: Arc<dyn Queue> = Arc::new(LeafFifo::new(20));
        assert!(q.add_child(light, Weight::uniform(1.0)));
        assert!(q.add_child(heavy, Weight::uniform(3.0)));

        const TOTAL_PER_CHILD: usize = 150;
        for _ in 0..TOTAL_PER_CHILD {
            q.try_enqueue_by_handle(10, fingerprinted(LIGHT_FINGERPRINT)).unwrap();
            q.try_enqueue_by_handle(20, fingerprinted(HEAVY_FINGERPRINT)).unwrap();
        }

        let mut light_count = 0usize;
        let mut heavy_count = 0usize;
        while let Some(w) = q.try_dequeue(0, false) {
            match w.fingerprint() {
                LIGHT_FINGERPRINT => light_count += 1,
                HEAVY_FINGERPRINT => heavy_count += 1,
                other => panic!("unexpected fingerprint {other}"),
            }
            // Simulate the worker reporting a fixed nominal service cost,
            // advancing the scheduler's virtual clock.
            q.timing.record(w.fingerprint(), Duration::from_nanos(1_000));
        }

        assert_eq!(light_count + heavy_count, TOTAL_PER_CHILD * 2);
        assert!(
            heavy_count > light_count,
            "expected the 3x-weighted child to dominate, got light={light_count} heavy={heavy_count}"
        );
    }
}
