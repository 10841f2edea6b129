//! Concurrent hierarchical bitmap (C4): the public façade over clusters
//! (C2) and internal nodes (C3). Structural changes (grow/shrink/insert/
//! remove) take the alpha side of the tree's alpha/beta lock; bit reads
//! and single-bit writes take the beta side and run in unbounded
//! parallelism with each other.

pub mod cluster;
pub mod internal;
pub mod segment;
mod state_word;

use std::time::Duration;

use parking_lot::RwLock;

use cluster::CLUSTER_CAPACITY;
use internal::{BitmapNode, InternalNode};
use state_word::MAX_CHILDREN;

use crate::config::SchedulerConfig;
use crate::sync::alpha_beta::AlphaBetaLock;

/// A lock-free, token-guarded hierarchical bitmap with O(log₅₆ N) indexed
/// access (C4).
pub struct ConcurrentBitmap {
    // `RwLock` holds the tree shape itself (swapped out wholesale on
    // grow/shrink that changes node count); the alpha/beta lock is the
    // discipline that decides *when* a thread may take the write side, so
    // read-heavy bit ops never contend with each other.
    root: RwLock<BitmapNode>,
    lock: AlphaBetaLock,
    structural_timeout: Duration,
}

impl ConcurrentBitmap {
    /// Creates a bitmap of `length` logical bits, all initially clear.
    pub fn new(length: usize, config: SchedulerConfig) -> Self {
        let root = if length <= CLUSTER_CAPACITY {
            BitmapNode::new_leaf(length)
        } else {
            let mut child_capacity = CLUSTER_CAPACITY;
            while length > child_capacity * MAX_CHILDREN as usize {
                child_capacity *= MAX_CHILDREN as usize;
            }
            BitmapNode::Internal(InternalNode::new(length, child_capacity))
        };
        Self {
            root: RwLock::new(root),
            lock: AlphaBetaLock::new(config),
            structural_timeout: Duration::from_secs(30),
        }
    }

    pub fn length(&self) -> usize {
        self.root.read().bit_size()
    }

    pub fn is_empty(&self) -> bool {
        let _g = self.enter_beta();
        self.root.read().is_empty()
    }

    pub fn pop_count(&self) -> usize {
        let _g = self.enter_beta();
        self.root.read().pop_count()
    }

    pub fn is_bit_set(&self, i: usize) -> bool {
        if i >= self.length() {
            return false;
        }
        let _g = self.enter_beta();
        self.root.read().is_bit_set(i)
    }

    pub fn get_token(&self, i: usize) -> u8 {
        let _g = self.enter_beta();
        self.root.read().token(i)
    }

    pub fn update_bit(&self, i: usize, v: bool) {
        let _g = self.enter_beta();
        self.root.read().update_bit(i, v);
    }

    pub fn try_update_bit(&self, i: usize, expected_token: u8, v: bool) -> bool {
        let _g = self.enter_beta();
        self.root.read().try_update_bit(i, expected_token, v)
    }

    /// Inserts `v` at logical index `i`. Serialized by the alpha side of
    /// the lock since it shifts every bit above `i`.
    pub fn insert_bit_at(&self, i: usize, v: bool) -> bool {
        let _g = self.enter_alpha();
        self.root.read().insert_bit_at(i, v)
    }

    /// Removes the bit at logical index `i`. When `shrink` is set, also
    /// reduces the declared length by one afterward.
    pub fn remove_bit_at(&self, i: usize, shrink: bool) -> bool {
        let _g = self.enter_alpha();
        let removed = self.root.read().remove_bit_at(i, false);
        if shrink {
            drop(_g);
            self.shrink(1);
        }
        removed
    }

    pub fn grow(&self, additional: usize) {
        let _g = self.enter_alpha();
        let mut root = self.root.write();
        match root.grow(additional) {
            Ok(()) => {}
            Err(_overflow) => {
                // Needs an additional tree level: rebuild with a fresh
                // internal root one level taller, keeping the old root as
                // its first child (§4.3 "creating additional internal
                // levels only if required by the remaining depth").
                let old_capacity = root.capacity();
                let old_root = std::mem::replace(&mut *root, BitmapNode::new_leaf(0));
                let mut taller = InternalNode::new(0, old_capacity);
                taller.graft_first_child(old_root);
                taller.grow(additional).expect("taller root has room for the remainder");
                *root = BitmapNode::Internal(taller);
            }
        }
    }

    pub fn shrink(&self, removal: usize) {
        let _g = self.enter_alpha();
        let mut root = self.root.write();
        root.shrink(removal);
        if let BitmapNode::Internal(node) = &mut *root {
            if let Some(child) = node.single_child() {
                *root = child;
            }
        }
    }

    /// Re-scans from `start` and rebuilds empty/full tracking authoritatively.
    pub fn refresh_state(&self, start: usize) {
        let _g = self.enter_beta();
        if let BitmapNode::Internal(node) = &*self.root.read() {
            node.refresh_state(start as u32);
        }
    }

    fn enter_beta(&self) -> BetaGuard<'_> {
        let admitted = self
            .lock
            .enter_beta(Duration::from_secs(30))
            .expect("beta entry should not fail under normal operation");
        assert!(admitted, "beta entry timed out");
        BetaGuard { lock: &self.lock }
    }

    fn enter_alpha(&self) -> AlphaGuard<'_> {
        let admitted = self
            .lock
            .enter_alpha(self.structural_timeout)
            .expect("alpha entry should not fail under normal operation");
        assert!(admitted, "alpha entry timed out");
        AlphaGuard { lock: &self.lock }
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn s1_insert_at_front_preserves_and_shifts() {
        let bm = ConcurrentBitmap::new(128, SchedulerConfig::default());
        bm.update_bit(0, true);
        bm.update_bit(55, true);
        bm.update_bit(56, true);
        bm.update_bit(127, true);
        assert_eq!(bm.pop_count(), 4);
        assert!(bm.is_bit_set(55));
        assert!(!bm.is_bit_set(54));

        bm.insert_bit_at(0, true);
        assert_eq!(bm.pop_count(), 5);
        assert!(bm.is_bit_set(0));
        assert!(bm.is_bit_set(56));
        assert!(!bm.is_bit_set(128));
        assert_eq!(bm.length(), 128);
    }

    #[test]
    fn s2_grow_preserves_bits() {
        let bm = ConcurrentBitmap::new(28, SchedulerConfig::default());
        bm.update_bit(5, true);
        bm.grow(60);
        assert_eq!(bm.length(), 88);
        assert!(bm.is_bit_set(5));
        for i in 28..88 {
            assert!(!bm.is_bit_set(i));
        }
    }

    #[test]
    fn grow_past_one_cluster_builds_internal_root() {
        let bm = ConcurrentBitmap::new(10, SchedulerConfig::default());
        bm.update_bit(3, true);
        bm.grow(CLUSTER_CAPACITY);
        assert_eq!(bm.length(), 10 + CLUSTER_CAPACITY);
        assert!(bm.is_bit_set(3));
        bm.update_bit(CLUSTER_CAPACITY + 1, true);
        assert!(bm.is_bit_set(CLUSTER_CAPACITY + 1));
    }
}
