//! Internal node (C3): recursively composes cluster or internal children and
//! tracks per-child empty/full in its own state word. Each level multiplies
//! addressable capacity by 28 (§3).

use super::cluster::{ClusterNode, CLUSTER_CAPACITY};
use super::segment::Segment;
use super::state_word::{self, MAX_CHILDREN};

/// One level of the hierarchical bitmap tree.
pub enum BitmapNode {
    Leaf(ClusterNode),
    Internal(InternalNode),
}

impl BitmapNode {
    pub fn new_leaf(bit_size: usize) -> Self {
        BitmapNode::Leaf(ClusterNode::new(bit_size))
    }

    pub fn bit_size(&self) -> usize {
        match self {
            BitmapNode::Leaf(c) => c.bit_size(),
            BitmapNode::Internal(n) => n.bit_size(),
        }
    }

    /// Maximum capacity this subtree can reach without adding another
    /// level above it.
    pub fn capacity(&self) -> usize {
        match self {
            BitmapNode::Leaf(_) => CLUSTER_CAPACITY,
            BitmapNode::Internal(n) => full_capacity(n.child_capacity),
        }
    }

    pub fn is_bit_set(&self, i: usize) -> bool {
        match self {
            BitmapNode::Leaf(c) => c.is_bit_set(i),
            BitmapNode::Internal(n) => n.is_bit_set(i),
        }
    }

    pub fn token(&self, i: usize) -> u8 {
        match self {
            BitmapNode::Leaf(c) => c.token(i),
            BitmapNode::Internal(n) => n.token(i),
        }
    }

    pub fn update_bit(&self, i: usize, v: bool) {
        match self {
            BitmapNode::Leaf(c) => c.update_bit(i, v),
            BitmapNode::Internal(n) => n.update_bit(i, v),
        }
    }

    pub fn try_update_bit(&self, i: usize, expected_token: u8, v: bool) -> bool {
        match self {
            BitmapNode::Leaf(c) => c.try_update_bit(i, expected_token, v),
            BitmapNode::Internal(n) => n.try_update_bit(i, expected_token, v),
        }
    }

    pub fn insert_bit_at(&self, i: usize, v: bool) -> bool {
        match self {
            BitmapNode::Leaf(c) => c.insert_bit_at(i, v),
            BitmapNode::Internal(n) => n.insert_bit_at(i, v),
        }
    }

    pub fn remove_bit_at(&self, i: usize, fill: bool) -> bool {
        match self {
            BitmapNode::Leaf(c) => c.remove_bit_at(i, fill),
            BitmapNode::Internal(n) => n.remove_bit_at(i, fill),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            BitmapNode::Leaf(c) => c.is_empty(),
            BitmapNode::Internal(n) => n.is_empty(),
        }
    }

    pub fn is_full(&self) -> bool {
        match self {
            BitmapNode::Leaf(c) => c.is_full(),
            BitmapNode::Internal(n) => n.is_full(),
        }
    }

    pub fn pop_count(&self) -> usize {
        match self {
            BitmapNode::Leaf(c) => c.pop_count(),
            BitmapNode::Internal(n) => n.pop_count(),
        }
    }

    pub fn grow(&mut self, additional_bits: usize) -> Result<(), usize> {
        match self {
            BitmapNode::Leaf(c) => c.grow(additional_bits),
            BitmapNode::Internal(n) => n.grow(additional_bits),
        }
    }

    pub fn shrink(&mut self, removal_bits: usize) {
        match self {
            BitmapNode::Leaf(c) => c.shrink(removal_bits),
            BitmapNode::Internal(n) => n.shrink(removal_bits),
        }
    }

}

/// Max capacity a fully-populated internal node can address, given the
/// capacity of one fully-populated child.
fn full_capacity(child_capacity: usize) -> usize {
    child_capacity * MAX_CHILDREN as usize
}

/// A non-leaf node: up to 28 children (clusters or further internal nodes).
pub struct InternalNode {
    children: Vec<BitmapNode>,
    state: Segment,
    bit_size: usize,
    /// Capacity of one fully-populated child at this level.
    child_capacity: usize,
}

impl InternalNode {
    /// Builds a node addressing `bit_size` logical bits, whose children
    /// each have capacity `child_capacity` (`CLUSTER_CAPACITY` for the
    /// level directly above leaves, `28x` larger per additional level).
    pub fn new(bit_size: usize, child_capacity: usize) -> Self {
        assert!(bit_size <= full_capacity(child_capacity), "internal node overflow");
        let mut children = Vec::new();
        let mut remaining = bit_size;
        while remaining > 0 {
            let take = remaining.min(child_capacity);
            children.push(Self::make_child(child_capacity, take));
            remaining -= take;
        }
        let node = Self {
            children,
            state: Segment::new(),
            bit_size,
            child_capacity,
        };
        node.refresh_state(0);
        node
    }

    fn make_child(child_capacity: usize, size: usize) -> BitmapNode {
        if child_capacity == CLUSTER_CAPACITY {
            BitmapNode::new_leaf(size)
        } else {
            BitmapNode::Internal(InternalNode::new(size, child_capacity / MAX_CHILDREN as usize))
        }
    }

    pub fn bit_size(&self) -> usize {
        self.bit_size
    }

    fn locate(&self, i: usize) -> (usize, usize) {
        (i / self.child_capacity, i % self.child_capacity)
    }

    pub fn is_bit_set(&self, i: usize) -> bool {
        let (c, local) = self.locate(i);
        self.children[c].is_bit_set(local)
    }

    pub fn token(&self, i: usize) -> u8 {
        let (c, local) = self.locate(i);
        self.children[c].token(local)
    }

    fn recompute_child_state(&self, idx: usize) {
        let child = &self.children[idx];
        state_word::set_pair(&self.state, idx as u32, child.is_empty(), child.is_full());
    }

    /// Forwards to the child, then brings this node's EMPTY/FULL tracking
    /// for that child into consistency via a coarse re-scan (§4.3).
    pub fn update_bit(&self, i: usize, v: bool) {
        let (c, local) = self.locate(i);
        self.children[c].update_bit(local, v);
        self.recompute_child_state(c);
    }

    pub fn try_update_bit(&self, i: usize, expected_token: u8, v: bool) -> bool {
        let (c, local) = self.locate(i);
        if self.children[c].try_update_bit(local, expected_token, v) {
            self.recompute_child_state(c);
            true
        } else {
            false
        }
    }

    pub fn insert_bit_at(&self, i: usize, v: bool) -> bool {
        let (c0, local0) = self.locate(i);
        let mut carry = v;
        for idx in c0..self.children.len() {
            let at = if idx == c0 { local0 } else { 0 };
            carry = self.children[idx].insert_bit_at(at, carry);
        }
        self.refresh_state(c0 as u32);
        carry
    }

    pub fn remove_bit_at(&self, i: usize, fill: bool) -> bool {
        let (c0, local0) = self.locate(i);
        let n = self.children.len();
        let mut result = false;
        for idx in c0..n {
            let at = if idx == c0 { local0 } else { 0 };
            let next_bit0 = if idx + 1 < n {
                self.children[idx + 1].is_bit_set(0)
            } else {
                fill
            };
            let removed_here = self.children[idx].remove_bit_at(at, next_bit0);
            if idx == c0 {
                result = removed_here;
            }
        }
        self.refresh_state(c0 as u32);
        result
    }

    /// Re-scans children from `start` and rebuilds this node's state
    /// authoritatively.
    pub fn refresh_state(&self, start: u32) {
        for idx in start as usize..self.children.len() {
            self.recompute_child_state(idx);
        }
    }

    pub fn is_empty(&self) -> bool {
        state_word::all_empty(&self.state, self.children.len() as u32)
    }

    pub fn is_full(&self) -> bool {
        self.children.len() == MAX_CHILDREN as usize
            && state_word::all_full(&self.state, self.children.len() as u32)
    }

    pub fn pop_count(&self) -> usize {
        self.children.iter().map(|c| c.pop_count()).sum()
    }

    /// Grows the last child in place if it has room; otherwise allocates
    /// further children, recursing into additional internal levels only if
    /// the remaining depth requires it (§4.3).
    pub fn grow(&mut self, additional_bits: usize) -> Result<(), usize> {
        let max_capacity = full_capacity(self.child_capacity);
        if self.bit_size + additional_bits > max_capacity {
            return Err(self.bit_size + additional_bits - max_capacity);
        }
        let mut remaining = additional_bits;
        if let Some(last) = self.children.last_mut() {
            let room = self.child_capacity - last.bit_size();
            if room > 0 {
                let take = remaining.min(room);
                last.grow(take).expect("room was bounded by child_capacity");
                remaining -= take;
            }
        }
        while remaining > 0 {
            let take = remaining.min(self.child_capacity);
            let child = Self::make_child(self.child_capacity, 0);
            self.children.push(child);
            let last = self.children.last_mut().unwrap();
            last.grow(take).expect("fresh child has full room");
            remaining -= take;
        }
        self.bit_size += additional_bits;
        self.refresh_state(0);
        Ok(())
    }

    /// Trims the last child, deallocating children that are fully removed.
    /// Degeneration to a single child is handled by the owning facade,
    /// which can simply replace its owned root value — no parent
    /// back-reference is needed (Design Notes §9).
    pub fn shrink(&mut self, removal_bits: usize) {
        let to_remove = removal_bits.min(self.bit_size);
        let mut remaining = to_remove;
        while remaining > 0 {
            let Some(last) = self.children.last_mut() else {
                break;
            };
            let last_size = last.bit_size();
            if remaining >= last_size {
                self.children.pop();
                remaining -= last_size;
            } else {
                last.shrink(remaining);
                remaining = 0;
            }
        }
        self.bit_size -= to_remove;
        self.refresh_state(0);
    }

    /// Whether this node has degenerated to a single child (root-only
    /// replacement trigger, §4.3).
    pub fn single_child(&mut self) -> Option<BitmapNode> {
        if self.children.len() == 1 {
            Some(self.children.pop().unwrap())
        } else {
            None
        }
    }

    pub fn num_children(&self) -> usize {
        self.children.len()
    }

    /// Grafts `child` as this (freshly built, empty) node's sole child,
    /// used when the tree gains a level above an existing root (§4.3).
    pub fn graft_first_child(&mut self, child: BitmapNode) {
        assert!(self.children.is_empty(), "graft only valid on a fresh node");
        self.bit_size = child.bit_size();
        self.children.push(child);
        self.refresh_state(0);
    }
}
