//! Alpha/Beta lock (C8): a two-group mutual-exclusion primitive where
//! alphas and betas exclude each other but members of the same group run
//! concurrently up to `max_group`. Alphas take priority over betas.

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::config::SchedulerConfig;
use crate::error::LockError;

static NEXT_LOCK_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Group {
    Alpha,
    Beta,
}

thread_local! {
    /// Per-thread ownership records, keyed by lock id. Mirrors the source's
    /// thread-static linked list of `(lock_id, ownership)` pairs (Design
    /// Notes §9) via a thread-local `Vec` instead of an intrusive list.
    static HELD_LOCKS: RefCell<Vec<(u64, Group)>> = const { RefCell::new(Vec::new()) };
}

fn held_group(lock_id: u64) -> Option<Group> {
    HELD_LOCKS.with(|h| h.borrow().iter().find(|(id, _)| *id == lock_id).map(|(_, g)| *g))
}

fn record_hold(lock_id: u64, group: Group) {
    HELD_LOCKS.with(|h| h.borrow_mut().push((lock_id, group)));
}

fn clear_hold(lock_id: u64) {
    HELD_LOCKS.with(|h| h.borrow_mut().retain(|(id, _)| *id != lock_id));
}

struct LockState {
    alpha_count: u32,
    beta_count: u32,
    /// Count of threads currently waiting to enter alpha. While non-zero,
    /// new beta entries are blocked regardless of beta capacity (§4.6
    /// "alpha priority").
    alphas_waiting: u32,
    beta_waiters: u32,
}

/// Two-group mutual-exclusion primitive with alpha priority.
pub struct AlphaBetaLock {
    id: u64,
    state: Mutex<LockState>,
    alpha_ready: Condvar,
    beta_ready: Condvar,
    config: SchedulerConfig,
    disposed: AtomicBool,
}

impl AlphaBetaLock {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            id: NEXT_LOCK_ID.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(LockState {
                alpha_count: 0,
                beta_count: 0,
                alphas_waiting: 0,
                beta_waiters: 0,
            }),
            alpha_ready: Condvar::new(),
            beta_ready: Condvar::new(),
            config,
            disposed: AtomicBool::new(false),
        }
    }

    fn check_disposed(&self) -> Result<(), LockError> {
        if self.disposed.load(Ordering::Acquire) {
            Err(LockError::Disposed)
        } else {
            Ok(())
        }
    }

    fn check_entry(&self, want: Group) -> Result<(), LockError> {
        match held_group(self.id) {
            Some(g) if g == want => Err(LockError::Recursion),
            Some(_) => Err(LockError::InvalidGroupCross),
            None => Ok(()),
        }
    }

    /// Blocks (up to `timeout`) until a beta slot is admitted.
    pub fn enter_beta(&self, timeout: Duration) -> Result<bool, LockError> {
        self.check_disposed()?;
        self.check_entry(Group::Beta)?;
        let deadline = Instant::now() + timeout;
        let mut spins = 0u32;
        let mut guard = self.state.lock();
        loop {
            if guard.alpha_count == 0 && guard.alphas_waiting == 0 && guard.beta_count < self.config.max_group {
                guard.beta_count += 1;
                drop(guard);
                record_hold(self.id, Group::Beta);
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            if spins < self.config.spin_budget && guard.alpha_count <= 2 {
                drop(guard);
                std::hint::spin_loop();
                spins += 1;
                guard = self.state.lock();
                continue;
            }
            guard.beta_waiters += 1;
            let remaining = deadline.saturating_duration_since(Instant::now());
            let result = self.beta_ready.wait_for(&mut guard, remaining);
            guard.beta_waiters -= 1;
            if result.timed_out() && Instant::now() >= deadline {
                return Ok(false);
            }
        }
    }

    /// Non-blocking `enter_beta`.
    pub fn try_enter_beta(&self) -> Result<bool, LockError> {
        self.enter_beta(Duration::ZERO)
    }

    pub fn exit_beta(&self) -> Result<(), LockError> {
        if held_group(self.id) != Some(Group::Beta) {
            return Err(LockError::InvalidGroupCross);
        }
        let mut guard = self.state.lock();
        guard.beta_count -= 1;
        self.wake_preferring_alpha(&guard);
        drop(guard);
        clear_hold(self.id);
        Ok(())
    }

    /// Blocks (up to `timeout`) until an alpha slot is admitted.
    pub fn enter_alpha(&self, timeout: Duration) -> Result<bool, LockError> {
        self.check_disposed()?;
        self.check_entry(Group::Alpha)?;
        let deadline = Instant::now() + timeout;
        let mut guard = self.state.lock();
        loop {
            if guard.beta_count == 0 && guard.alpha_count < self.config.max_group {
                guard.alpha_count += 1;
                drop(guard);
                record_hold(self.id, Group::Alpha);
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            guard.alphas_waiting += 1;
            let remaining = deadline.saturating_duration_since(Instant::now());
            let result = self.alpha_ready.wait_for(&mut guard, remaining);
            guard.alphas_waiting -= 1;
            if result.timed_out() && Instant::now() >= deadline {
                return Ok(false);
            }
        }
    }

    /// Non-blocking `enter_alpha`.
    pub fn try_enter_alpha(&self) -> Result<bool, LockError> {
        self.enter_alpha(Duration::ZERO)
    }

    pub fn exit_alpha(&self) -> Result<(), LockError> {
        if held_group(self.id) != Some(Group::Alpha) {
            return Err(LockError::InvalidGroupCross);
        }
        let mut guard = self.state.lock();
        guard.alpha_count -= 1;
        self.wake_preferring_alpha(&guard);
        drop(guard);
        clear_hold(self.id);
        Ok(())
    }

    /// §4.6 exit rule: wake alphas first if any are waiting and no betas
    /// remain active; otherwise wake betas if any are waiting.
    fn wake_preferring_alpha(&self, guard: &LockState) {
        if guard.beta_count == 0 && guard.alphas_waiting > 0 {
            self.alpha_ready.notify_all();
        } else if guard.alphas_waiting == 0 && guard.beta_waiters > 0 {
            self.beta_ready.notify_all();
        }
    }

    pub fn is_alpha_held(&self) -> bool {
        held_group(self.id) == Some(Group::Alpha)
    }

    pub fn is_beta_held(&self) -> bool {
        held_group(self.id) == Some(Group::Beta)
    }

    pub fn waiting_alpha_count(&self) -> u32 {
        self.state.lock().alphas_waiting
    }

    pub fn waiting_beta_count(&self) -> u32 {
        self.state.lock().beta_waiters
    }

    pub fn dispose(&self) {
        self.disposed.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::mpsc;
    use std::thread;

    fn lock() -> AlphaBetaLock {
        AlphaBetaLock::new(SchedulerConfig::default())
    }

    #[test]
    fn recursive_beta_is_rejected() {
        let l = lock();
        assert!(l.enter_beta(Duration::ZERO).unwrap());
        assert_eq!(l.enter_beta(Duration::ZERO), Err(LockError::Recursion));
    }

    #[test]
    fn cross_group_acquisition_is_rejected() {
        let l = lock();
        assert!(l.enter_beta(Duration::ZERO).unwrap());
        assert_eq!(l.enter_alpha(Duration::ZERO), Err(LockError::InvalidGroupCross));
    }

    #[test]
    fn betas_run_concurrently() {
        let l = lock();
        assert!(l.enter_beta(Duration::ZERO).unwrap());
        // a second thread entering beta concurrently would need its own
        // thread-local, so just assert the count-based admission directly.
        let mut guard = l.state.lock();
        guard.beta_count += 1;
        drop(guard);
        assert_eq!(l.state.lock().beta_count, 2);
    }

    #[test]
    fn disposed_lock_rejects_entry() {
        let l = lock();
        l.dispose();
        assert_eq!(l.enter_beta(Duration::ZERO), Err(LockError::Disposed));
    }

    #[test]
    fn alpha_blocks_new_betas_while_waiting() {
        // S4: T1 enters beta, T2 starts enter_alpha (blocks), T3 starts
        // enter_beta (must block even though beta holds), T1 exits -> T2
        // admitted, T2 exits -> T3 admitted.
        let l = Arc::new(lock());
        assert!(l.enter_beta(Duration::ZERO).unwrap()); // T1 (main thread)

        let (t2_admitted_tx, t2_admitted_rx) = mpsc::channel();
        let (t2_release_tx, t2_release_rx) = mpsc::channel();
        let (t2_exited_tx, t2_exited_rx) = mpsc::channel();
        let l2 = l.clone();
        let t2 = thread::spawn(move || {
            let admitted = l2.enter_alpha(Duration::from_secs(5)).unwrap();
            t2_admitted_tx.send(admitted).unwrap();
            t2_release_rx.recv().unwrap();
            l2.exit_alpha().unwrap();
            t2_exited_tx.send(()).unwrap();
        });

        // wait for T2 to register as an alpha waiter
        for _ in 0..1000 {
            if l.waiting_alpha_count() > 0 {
                break;
            }
            thread::yield_now();
        }
        assert!(l.waiting_alpha_count() > 0);

        let (t3_admitted_tx, t3_admitted_rx) = mpsc::channel();
        let l3 = l.clone();
        let t3 = thread::spawn(move || {
            let admitted = l3.enter_beta(Duration::from_secs(5)).unwrap();
            t3_admitted_tx.send(admitted).unwrap();
            l3.exit_beta().unwrap();
        });

        // wait for T3 to register as a beta waiter (blocked by alpha priority)
        for _ in 0..1000 {
            if l.waiting_beta_count() > 0 {
                break;
            }
            thread::yield_now();
        }
        assert!(l.waiting_beta_count() > 0);
        assert!(t2_admitted_rx.try_recv().is_err(), "T2 must not be admitted yet");

        // T1 releases beta -> T2 (alpha) admitted first.
        l.exit_beta().unwrap();
        assert!(t2_admitted_rx.recv_timeout(Duration::from_secs(5)).unwrap());

        // T2 releases alpha -> T3 (beta) now admitted.
        t2_release_tx.send(()).unwrap();
        t2_exited_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(t3_admitted_rx.recv_timeout(Duration::from_secs(5)).unwrap());

        t2.join().unwrap();
        t3.join().unwrap();
    }
}
