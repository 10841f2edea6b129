//! Workload state machine and continuation list (C9).
//!
//! A `Workload<R>` is parameterized by a single user-provided invocation
//! closure rather than the source's several coexisting `Workload<T>`
//! variants (callback-only, with-state, DI-enabled, task-returning) —
//! Design Notes §9 treats those as one state machine differing only in
//! payload invocation signature.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::CancellationError;

static NEXT_WORKLOAD_ID: AtomicU64 = AtomicU64::new(1);

/// Bit-mask status word (§4.7). Most bits are mutually exclusive "primary"
/// phases; `CONTINUATIONS_INVOKED` is an additive flag that may coexist
/// with any terminal phase.
pub mod status {
    pub const INVALID: u32 = 0;
    pub const CREATED: u32 = 1 << 0;
    pub const SCHEDULED: u32 = 1 << 1;
    pub const RUNNING: u32 = 1 << 2;
    pub const RAN_TO_COMPLETION: u32 = 1 << 3;
    pub const FAULTED: u32 = 1 << 4;
    pub const CANCELED: u32 = 1 << 5;
    pub const CANCELLATION_REQUESTED: u32 = 1 << 6;
    pub const POOLED: u32 = 1 << 7;
    pub const ASYNC_SUCCESS: u32 = 1 << 8;
    pub const CONTINUATIONS_INVOKED: u32 = 1 << 9;

    pub const PRIMARY_MASK: u32 = CREATED
        | SCHEDULED
        | RUNNING
        | RAN_TO_COMPLETION
        | FAULTED
        | CANCELED
        | CANCELLATION_REQUESTED
        | POOLED;

    pub const TERMINAL_MASK: u32 = RAN_TO_COMPLETION | FAULTED | CANCELED;

    pub fn primary(word: u32) -> u32 {
        word & PRIMARY_MASK
    }

    pub fn is_terminal(word: u32) -> bool {
        primary(word) & TERMINAL_MASK != 0
    }
}

/// Opaque per-level scheduling annotation a classful qdisc attaches on
/// enqueue and strips on dequeue-claim (§4.5 step 5, §9 "opaque scheduling
/// state ... e.g. a linked list of scheduler annotations"). Pushed/popped
/// as a stack so nested classful qdiscs each see their own frame.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerAnnotation {
    pub fingerprint: u64,
    pub scheduling_weight: f64,
    pub punishment_factor: f64,
}

/// Opaque payload captured from a caught panic inside a workload body.
pub struct WorkloadFault(Box<dyn Any + Send>);

impl WorkloadFault {
    fn missing_body() -> Self {
        WorkloadFault(Box::new("workload body already consumed"))
    }

    /// Best-effort human-readable message, when the panic payload was a
    /// `&str` or `String` (the common case for `panic!("...")`).
    pub fn message(&self) -> &str {
        if let Some(s) = self.0.downcast_ref::<&str>() {
            s
        } else if let Some(s) = self.0.downcast_ref::<String>() {
            s.as_str()
        } else {
            "workload panicked with a non-string payload"
        }
    }
}

impl fmt::Debug for WorkloadFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("WorkloadFault").field(&self.message()).finish()
    }
}

/// Terminal result of running a workload.
pub enum WorkloadOutcome<R> {
    Completed(R),
    Faulted(WorkloadFault),
    Canceled,
}

/// Per-workload view of cancellation (§4.7, §6 "the core consumes a
/// standard is-cancellation-requested + register-callback contract").
/// Reads the workload's own status word rather than owning a token itself.
pub struct CancellationFlag<'a, R: Send + 'static> {
    workload: &'a Workload<R>,
}

impl<R: Send + 'static> CancellationFlag<'_, R> {
    pub fn is_cancellation_requested(&self) -> bool {
        status::primary(self.workload.status.load(Ordering::Acquire)) == status::CANCELLATION_REQUESTED
    }

    /// Acknowledges a pending cancellation, transitioning
    /// `CancellationRequested -> Canceled`. Intended to be called
    /// cooperatively from inside the workload's own body.
    pub fn throw_if_cancellation_requested(&self) -> Result<(), CancellationError> {
        if self
            .workload
            .try_transition(status::CANCELLATION_REQUESTED, status::CANCELED)
        {
            Err(CancellationError)
        } else {
            Ok(())
        }
    }
}

type Continuation<R> = Box<dyn FnOnce(&WorkloadOutcome<R>) + Send>;

enum Continuations<R> {
    Empty,
    Single(Continuation<R>),
    List(Vec<Continuation<R>>),
    Completed,
}

type Body<R> = Box<dyn FnOnce(&CancellationFlag<'_, R>) -> Result<R, CancellationError> + Send>;

/// A user-submitted unit of execution with a status machine, cancellation
/// hook, and continuation list (C9).
pub struct Workload<R: Send + 'static> {
    id: u64,
    status: AtomicU32,
    body: Mutex<Option<Body<R>>>,
    result: Mutex<Option<WorkloadOutcome<R>>>,
    continuations: Mutex<Continuations<R>>,
    annotations: Mutex<Vec<SchedulerAnnotation>>,
    /// When set, completion returns the workload to a pool instead of
    /// releasing it (Design Notes §9, "anonymous workload pool" slot).
    externally_managed: bool,
    /// Identity of the underlying callable, used by the virtual time table
    /// (C5) to correlate timing samples across workloads that run the same
    /// kind of work. Defaults to the workload's own id (a degenerate
    /// per-instance fingerprint) when the caller has no shared identity to
    /// supply — see `new_with_fingerprint`.
    fingerprint: u64,
}

impl<R: Send + 'static> Workload<R> {
    pub fn new(body: Body<R>, externally_managed: bool) -> Arc<Self> {
        let id = NEXT_WORKLOAD_ID.fetch_add(1, Ordering::Relaxed);
        Arc::new(Self {
            id,
            status: AtomicU32::new(status::CREATED),
            body: Mutex::new(Some(body)),
            result: Mutex::new(None),
            continuations: Mutex::new(Continuations::Empty),
            annotations: Mutex::new(Vec::new()),
            externally_managed,
            fingerprint: id,
        })
    }

    /// Like `new`, but with an explicit payload fingerprint shared across
    /// every workload invoking the same underlying callable.
    pub fn new_with_fingerprint(body: Body<R>, externally_managed: bool, fingerprint: u64) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_WORKLOAD_ID.fetch_add(1, Ordering::Relaxed),
            status: AtomicU32::new(status::CREATED),
            body: Mutex::new(Some(body)),
            result: Mutex::new(None),
            continuations: Mutex::new(Continuations::Empty),
            annotations: Mutex::new(Vec::new()),
            externally_managed,
            fingerprint,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn fingerprint(&self) -> u64 {
        self.fingerprint
    }

    pub fn externally_managed(&self) -> bool {
        self.externally_managed
    }

    pub fn status(&self) -> u32 {
        self.status.load(Ordering::Acquire)
    }

    pub fn is_one_of(&self, mask: u32) -> bool {
        status::primary(self.status()) & mask != 0
    }

    fn try_transition(&self, from: u32, to: u32) -> bool {
        loop {
            let cur = self.status.load(Ordering::Acquire);
            if status::primary(cur) != from {
                return false;
            }
            let new = (cur & !status::PRIMARY_MASK) | to;
            if self
                .status
                .compare_exchange_weak(cur, new, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Created -> Scheduled, on enqueue into a qdisc.
    pub fn mark_scheduled(&self) -> bool {
        self.try_transition(status::CREATED, status::SCHEDULED)
    }

    pub fn cancellation_flag(&self) -> CancellationFlag<'_, R> {
        CancellationFlag { workload: self }
    }

    /// External cancellation request. Mirrors the source's two paths: a
    /// cooperative flag flip while running, or (S5) a direct jump straight
    /// to `Canceled` if the workload was never dispatched — it "never
    /// runs" rather than observing a requested-then-acknowledged sequence.
    pub fn request_cancellation(&self) {
        if self.try_transition(status::RUNNING, status::CANCELLATION_REQUESTED) {
            return;
        }
        if self.try_transition(status::CREATED, status::CANCELED)
            || self.try_transition(status::SCHEDULED, status::CANCELED)
        {
            self.finish(WorkloadOutcome::Canceled);
        }
    }

    /// Scheduled -> Running -> terminal. Returns `false` without running
    /// the body if the workload was already canceled before dispatch.
    pub fn run(&self) -> bool {
        if !self.try_transition(status::SCHEDULED, status::RUNNING) {
            return false;
        }
        let body = self.body.lock().take();
        let outcome = match body {
            None => WorkloadOutcome::Faulted(WorkloadFault::missing_body()),
            Some(f) => {
                let flag = self.cancellation_flag();
                match panic::catch_unwind(AssertUnwindSafe(|| f(&flag))) {
                    Ok(Ok(value)) => {
                        self.try_transition(status::RUNNING, status::RAN_TO_COMPLETION);
                        WorkloadOutcome::Completed(value)
                    }
                    Ok(Err(CancellationError)) => WorkloadOutcome::Canceled,
                    Err(payload) => {
                        self.try_transition(status::RUNNING, status::FAULTED);
                        WorkloadOutcome::Faulted(WorkloadFault(payload))
                    }
                }
            }
        };
        self.finish(outcome);
        true
    }

    fn finish(&self, outcome: WorkloadOutcome<R>) {
        *self.result.lock() = Some(outcome);
        self.drain_continuations();
    }

    /// Installs a completion callback: CAS-install when the slot is empty,
    /// inflate to a list on contention, or invoke immediately if the
    /// workload has already reached a terminal state (§4.7).
    pub fn add_continuation(self: &Arc<Self>, callback: Continuation<R>) {
        let mut slot = self.continuations.lock();
        if matches!(&*slot, Continuations::Completed) {
            drop(slot);
            if let Some(outcome) = self.result.lock().as_ref() {
                callback(outcome);
            }
            return;
        }
        let prior = std::mem::replace(&mut *slot, Continuations::Empty);
        *slot = match prior {
            Continuations::Empty => Continuations::Single(callback),
            Continuations::Single(prev) => Continuations::List(vec![prev, callback]),
            Continuations::List(mut list) => {
                list.push(callback);
                Continuations::List(list)
            }
            Continuations::Completed => unreachable!(),
        };
    }

    /// Swaps the continuation slot with the `Completed` sentinel and drains
    /// whatever was installed, fencing further additions (§4.7).
    fn drain_continuations(&self) {
        if self.status.fetch_or(status::CONTINUATIONS_INVOKED, Ordering::AcqRel) & status::CONTINUATIONS_INVOKED != 0
        {
            return;
        }
        let prior = std::mem::replace(&mut *self.continuations.lock(), Continuations::Completed);
        let outcome_guard = self.result.lock();
        let Some(outcome) = outcome_guard.as_ref() else {
            return;
        };
        match prior {
            Continuations::Empty | Continuations::Completed => {}
            Continuations::Single(cb) => cb(outcome),
            Continuations::List(list) => {
                for cb in list {
                    cb(outcome);
                }
            }
        }
    }

    pub fn push_annotation(&self, annotation: SchedulerAnnotation) {
        self.annotations.lock().push(annotation);
    }

    pub fn pop_annotation(&self) -> Option<SchedulerAnnotation> {
        self.annotations.lock().pop()
    }
}

/// The narrow capability a qdisc needs from a workload, independent of its
/// invocation-result type `R` — lets the qdisc tree hold type-erased
/// `Arc<dyn Scheduled>` handles instead of threading a generic parameter
/// through every node (Design Notes §9's capability-trait approach, applied
/// to the workload/queue boundary rather than the classful/classless one).
pub trait Scheduled: Send + Sync {
    fn id(&self) -> u64;
    fn fingerprint(&self) -> u64;
    fn mark_scheduled(&self) -> bool;
    fn push_annotation(&self, annotation: SchedulerAnnotation);
    fn pop_annotation(&self) -> Option<SchedulerAnnotation>;
}

impl<R: Send + 'static> Scheduled for Workload<R> {
    fn id(&self) -> u64 {
        self.id
    }

    fn fingerprint(&self) -> u64 {
        self.fingerprint
    }

    fn mark_scheduled(&self) -> bool {
        Workload::mark_scheduled(self)
    }

    fn push_annotation(&self, annotation: SchedulerAnnotation) {
        Workload::push_annotation(self, annotation)
    }

    fn pop_annotation(&self) -> Option<SchedulerAnnotation> {
        Workload::pop_annotation(self)
    }
}

/// A type-erased handle to a workload as seen by the qdisc tree.
pub type WorkloadHandle = Arc<dyn Scheduled>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    fn simple(value: i32) -> Arc<Workload<i32>> {
        Workload::new(Box::new(move |_flag| Ok(value)), false)
    }

    #[test]
    fn created_runs_to_completion() {
        let w = simple(42);
        assert!(w.mark_scheduled());
        assert!(w.run());
        assert_eq!(status::primary(w.status()), status::RAN_TO_COMPLETION);
    }

    #[test]
    fn cancel_before_dispatch_never_runs() {
        // S5
        let w = simple(1);
        w.request_cancellation();
        assert_eq!(status::primary(w.status()), status::CANCELED);
        assert!(!w.mark_scheduled());
        assert!(!w.run());
    }

    #[test]
    fn cooperative_cancellation_acknowledged_mid_run() {
        let reached_running = Arc::new((Mutex::new(false), parking_lot::Condvar::new()));
        let may_acknowledge = Arc::new((Mutex::new(false), parking_lot::Condvar::new()));

        let reached_running2 = reached_running.clone();
        let may_acknowledge2 = may_acknowledge.clone();
        let w: Arc<Workload<i32>> = Workload::new(
            Box::new(move |flag| {
                {
                    let (lock, cvar) = &*reached_running2;
                    *lock.lock() = true;
                    cvar.notify_all();
                }
                {
                    let (lock, cvar) = &*may_acknowledge2;
                    let mut ready = lock.lock();
                    while !*ready {
                        cvar.wait(&mut ready);
                    }
                }
                flag.throw_if_cancellation_requested()?;
                Ok(99)
            }),
            false,
        );
        assert!(w.mark_scheduled());

        let w2 = w.clone();
        let runner = std::thread::spawn(move || w2.run());

        {
            let (lock, cvar) = &*reached_running;
            let mut started = lock.lock();
            while !*started {
                cvar.wait(&mut started);
            }
        }
        assert!(w.try_transition(status::RUNNING, status::CANCELLATION_REQUESTED));
        {
            let (lock, cvar) = &*may_acknowledge;
            *lock.lock() = true;
            cvar.notify_all();
        }

        assert!(runner.join().unwrap());
        assert_eq!(status::primary(w.status()), status::CANCELED);
    }

    #[test]
    fn panic_in_body_becomes_faulted() {
        let w: Arc<Workload<i32>> = Workload::new(Box::new(|_| panic!("boom")), false);
        assert!(w.mark_scheduled());
        assert!(w.run());
        assert_eq!(status::primary(w.status()), status::FAULTED);
    }

    #[test]
    fn continuation_runs_exactly_once_even_if_added_after_completion() {
        let w = simple(7);
        assert!(w.mark_scheduled());
        assert!(w.run());
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        w.add_continuation(Box::new(move |_outcome| {
            ran2.store(true, Ordering::SeqCst);
        }));
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn annotation_stack_is_lifo() {
        let w = simple(0);
        w.push_annotation(SchedulerAnnotation {
            fingerprint: 1,
            scheduling_weight: 1.0,
            punishment_factor: 1.0,
        });
        w.push_annotation(SchedulerAnnotation {
            fingerprint: 2,
            scheduling_weight: 1.0,
            punishment_factor: 1.0,
        });
        assert_eq!(w.pop_annotation().unwrap().fingerprint, 2);
        assert_eq!(w.pop_annotation().unwrap().fingerprint, 1);
        assert!(w.pop_annotation().is_none());
    }
}
