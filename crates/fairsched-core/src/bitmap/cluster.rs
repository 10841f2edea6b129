//! Leaf cluster node (C2): an array of up to 28 segments plus a cluster
//! state word tracking each segment's empty/full status.

use std::sync::atomic::{AtomicUsize, Ordering};

use super::segment::{Segment, SEGMENT_BITS};
use super::state_word::{self, MAX_CHILDREN};

/// Maximum logical bits a single cluster can address.
pub const CLUSTER_CAPACITY: usize = (MAX_CHILDREN as usize) * (SEGMENT_BITS as usize);

/// A leaf node: up to 28 token-guarded segments plus their empty/full map.
pub struct ClusterNode {
    segments: Vec<Segment>,
    state: Segment,
    bit_size: AtomicUsize,
}

impl ClusterNode {
    /// Creates a cluster sized to `bit_size` logical bits (`<= CLUSTER_CAPACITY`).
    pub fn new(bit_size: usize) -> Self {
        assert!(bit_size <= CLUSTER_CAPACITY, "cluster overflow");
        let n = Self::segments_for(bit_size);
        let segments = (0..n).map(|_| Segment::new()).collect();
        Self {
            segments,
            state: Segment::new(),
            bit_size: AtomicUsize::new(bit_size),
        }
    }

    fn segments_for(bit_size: usize) -> usize {
        bit_size.div_ceil(SEGMENT_BITS as usize).max(if bit_size == 0 { 0 } else { 1 })
    }

    pub fn bit_size(&self) -> usize {
        self.bit_size.load(Ordering::Acquire)
    }

    fn segment_capacity(&self, idx: usize) -> u32 {
        let full = SEGMENT_BITS as usize;
        let start = idx * full;
        let remaining = self.bit_size().saturating_sub(start);
        remaining.min(full) as u32
    }

    fn locate(&self, i: usize) -> (usize, u32) {
        (i / SEGMENT_BITS as usize, (i % SEGMENT_BITS as usize) as u32)
    }

    pub fn is_bit_set(&self, i: usize) -> bool {
        let (seg, bit) = self.locate(i);
        self.segments[seg].is_bit_set(bit)
    }

    pub fn token(&self, i: usize) -> u8 {
        let (seg, _) = self.locate(i);
        self.segments[seg].token()
    }

    fn recompute_segment_state(&self, seg: usize) {
        let cap = self.segment_capacity(seg);
        let empty = self.segments[seg].is_empty_unsafe(cap);
        let full = cap > 0 && self.segments[seg].is_full_unsafe(cap);
        state_word::set_pair(&self.state, seg as u32, empty, full);
    }

    /// Unconditional bit write; segment updated first, cluster state brought
    /// into consistency in a separate CAS (§4.2).
    pub fn update_bit(&self, i: usize, v: bool) {
        let (seg, bit) = self.locate(i);
        self.segments[seg].update_bit(bit, v);
        self.recompute_segment_state(seg);
    }

    /// Token-guarded bit write; returns `false` on token mismatch.
    pub fn try_update_bit(&self, i: usize, expected_token: u8, v: bool) -> bool {
        let (seg, bit) = self.locate(i);
        if self.segments[seg].try_update_bit(bit, expected_token, v) {
            self.recompute_segment_state(seg);
            true
        } else {
            false
        }
    }

    /// Inserts `v` at logical index `i`, cascading the overflow bit through
    /// every segment at or after `i`'s segment. Returns the bit shifted out
    /// of the cluster entirely (the bit formerly at the last declared
    /// index — §8 invariant 2). This does not truncate physical storage:
    /// a segment beyond declared capacity may still retain the shifted
    /// value until the next `grow`/`shrink` rebases capacity. Caller must
    /// hold the structural write lock.
    pub fn insert_bit_at(&self, i: usize, v: bool) -> bool {
        let (seg0, bit0) = self.locate(i);
        let mut carry = v;
        for idx in seg0..self.segments.len() {
            let at = if idx == seg0 { bit0 } else { 0 };
            carry = self.segments[idx].insert_bit_at(at, carry);
        }
        self.refresh_state(seg0 as u32);
        carry
    }

    /// Removes the bit at logical index `i`, cascading `fill` in at the
    /// cluster's top. Returns the removed bit.
    pub fn remove_bit_at(&self, i: usize, fill: bool) -> bool {
        let (seg0, bit0) = self.locate(i);
        let n = self.segments.len();
        let mut result = false;
        for idx in seg0..n {
            let at = if idx == seg0 { bit0 } else { 0 };
            let next_bit0 = if idx + 1 < n {
                self.segments[idx + 1].is_bit_set(0)
            } else {
                fill
            };
            let removed_here = self.segments[idx].remove_bit_at(at);
            self.segments[idx].update_bit(SEGMENT_BITS - 1, next_bit0);
            if idx == seg0 {
                result = removed_here;
            }
        }
        self.refresh_state(seg0 as u32);
        result
    }

    fn clear_overflow_region(&self) {
        if let Some(last) = self.segments.len().checked_sub(1) {
            let cap = self.segment_capacity(last);
            self.segments[last].clear_above(cap);
        }
    }

    /// Re-scans segments from `start_segment_index` and rebuilds the cluster
    /// state authoritatively (§4.2).
    pub fn refresh_state(&self, start_segment_index: u32) {
        for idx in start_segment_index as usize..self.segments.len() {
            self.recompute_segment_state(idx);
        }
    }

    /// Whether the whole cluster (within its declared `bit_size`) has no
    /// bits set.
    pub fn is_empty(&self) -> bool {
        state_word::all_empty(&self.state, self.segments.len() as u32)
    }

    pub fn is_full(&self) -> bool {
        state_word::all_full(&self.state, self.segments.len() as u32)
    }

    /// Counts set bits across every physically allocated segment register.
    ///
    /// Deliberately not bounded by each segment's declared `segment_capacity`:
    /// a bit shifted past the declared length by `insert_bit_at` can still
    /// occupy slack within an already-allocated segment (§8 scenario S1),
    /// and remains counted until a `grow`/`shrink` rebases capacity and
    /// clears it.
    pub fn pop_count(&self) -> usize {
        self.segments
            .iter()
            .map(|seg| seg.payload().count_ones() as usize)
            .sum()
    }

    /// Grows capacity by `additional_bits`, allocating new segments as
    /// needed. Returns `Err(overflow_bits)` if growth would exceed
    /// `CLUSTER_CAPACITY`, leaving the structural event to the parent.
    pub fn grow(&mut self, additional_bits: usize) -> Result<(), usize> {
        let new_size = self.bit_size() + additional_bits;
        if new_size > CLUSTER_CAPACITY {
            return Err(new_size - CLUSTER_CAPACITY);
        }
        let needed = Self::segments_for(new_size);
        while self.segments.len() < needed {
            self.segments.push(Segment::new());
        }
        self.bit_size.store(new_size, Ordering::Release);
        self.refresh_state(0);
        Ok(())
    }

    /// Shrinks capacity by `removal_bits`, deallocating fully-removed
    /// segments and clearing bits past the new boundary.
    pub fn shrink(&mut self, removal_bits: usize) {
        let new_size = self.bit_size().saturating_sub(removal_bits);
        let needed = Self::segments_for(new_size).max(if new_size == 0 { 0 } else { 1 });
        self.bit_size.store(new_size, Ordering::Release);
        self.clear_overflow_region();
        self.segments.truncate(needed.max(1).min(self.segments.len().max(1)));
        if self.segments.is_empty() && new_size > 0 {
            self.segments.push(Segment::new());
        }
        self.refresh_state(0);
    }

    pub fn num_segments(&self) -> usize {
        self.segments.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_cluster_is_empty() {
        let c = ClusterNode::new(64);
        assert!(c.is_empty());
        assert_eq!(c.pop_count(), 0);
    }

    #[test]
    fn set_bit_across_segment_boundary() {
        let c = ClusterNode::new(128);
        c.update_bit(0, true);
        c.update_bit(55, true);
        c.update_bit(56, true);
        c.update_bit(127, true);
        assert_eq!(c.pop_count(), 4);
        assert!(c.is_bit_set(55));
        assert!(!c.is_bit_set(54));
        assert!(!c.is_empty());
    }

    #[test]
    fn insert_shifts_subsequent_bits_right() {
        let c = ClusterNode::new(128);
        c.update_bit(0, true);
        c.update_bit(55, true);
        c.update_bit(56, true);
        c.update_bit(127, true);
        let overflow = c.insert_bit_at(0, true);
        assert!(!overflow);
        assert_eq!(c.pop_count(), 5);
        assert!(c.is_bit_set(0));
        assert!(c.is_bit_set(56));
        assert!(c.is_bit_set(57));
    }

    #[test]
    fn grow_preserves_bits_and_zero_fills() {
        let mut c = ClusterNode::new(28);
        c.update_bit(0, true);
        c.grow(60).unwrap();
        assert_eq!(c.bit_size(), 88);
        assert!(c.is_bit_set(0));
        for i in 28..88 {
            assert!(!c.is_bit_set(i));
        }
    }

    #[test]
    fn grow_past_capacity_reports_overflow() {
        let mut c = ClusterNode::new(CLUSTER_CAPACITY - 4);
        let err = c.grow(10).unwrap_err();
        assert_eq!(err, 6);
    }
}
