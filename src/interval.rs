//! Augmented interval tree holding the granted locks of one mode.
//!
//! Each resource keeps one [`IntervalTree`] per lock mode. Nodes are keyed by
//! the granted extent `(start, end)` and live in an arena indexed by `usize`,
//! so the tree never holds pointers into lock records. Locks granted with an
//! identical extent share a single node: the first lock occupies the tree
//! slot and the others form the node's same-extent ring.
//!
//! Balancing is AVL. Every node carries `subtree_hi`, the largest `end` in
//! its subtree, which lets overlap queries skip whole subtrees.
//!
//! ```text
//!              [100, 199]  subtree_hi=EOF
//!             /                          \
//!    [0, 4095]  subtree_hi=4095     [4096, EOF]  subtree_hi=EOF
//!                                   locks: lock#7, lock#9 (ring)
//! ```

use crate::types::{Extent, LockId};
use std::cmp::Ordering;

#[derive(Debug, Clone)]
struct Node {
    extent: Extent,
    subtree_hi: u64,
    height: u8,
    left: Option<usize>,
    right: Option<usize>,
    /// `locks[0]` owns the tree slot, the rest is the same-extent ring.
    locks: Vec<LockId>,
}

/// Interval tree over granted extents.
#[derive(Debug, Clone, Default)]
pub struct IntervalTree {
    nodes: Vec<Node>,
    free: Vec<usize>,
    root: Option<usize>,
    /// Number of locks, ring members included.
    len: usize,
    node_count: usize,
}

impl IntervalTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of locks in the tree, ring members included.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of distinct extents.
    pub fn node_count(&self) -> usize {
        self.node_count
    }

    /// Largest `end` of any lock in the tree.
    pub fn max_end(&self) -> Option<u64> {
        self.root.map(|r| self.nodes[r].subtree_hi)
    }

    fn height(&self, n: Option<usize>) -> u8 {
        n.map_or(0, |i| self.nodes[i].height)
    }

    fn hi(&self, n: Option<usize>) -> Option<u64> {
        n.map(|i| self.nodes[i].subtree_hi)
    }

    fn alloc(&mut self, extent: Extent, id: LockId) -> usize {
        let node = Node {
            extent,
            subtree_hi: extent.end,
            height: 1,
            left: None,
            right: None,
            locks: vec![id],
        };
        self.node_count += 1;
        match self.free.pop() {
            Some(i) => {
                self.nodes[i] = node;
                i
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        }
    }

    fn release(&mut self, i: usize) {
        let node = &mut self.nodes[i];
        node.locks.clear();
        node.left = None;
        node.right = None;
        self.free.push(i);
        self.node_count -= 1;
    }

    fn update(&mut self, i: usize) {
        let (l, r) = (self.nodes[i].left, self.nodes[i].right);
        let height = 1 + self.height(l).max(self.height(r));
        let mut hi = self.nodes[i].extent.end;
        if let Some(h) = self.hi(l) {
            hi = hi.max(h);
        }
        if let Some(h) = self.hi(r) {
            hi = hi.max(h);
        }
        let node = &mut self.nodes[i];
        node.height = height;
        node.subtree_hi = hi;
    }

    fn rotate_right(&mut self, i: usize) -> usize {
        let l = self.nodes[i].left.expect("rotate_right needs a left child");
        self.nodes[i].left = self.nodes[l].right;
        self.nodes[l].right = Some(i);
        self.update(i);
        self.update(l);
        l
    }

    fn rotate_left(&mut self, i: usize) -> usize {
        let r = self.nodes[i].right.expect("rotate_left needs a right child");
        self.nodes[i].right = self.nodes[r].left;
        self.nodes[r].left = Some(i);
        self.update(i);
        self.update(r);
        r
    }

    fn rebalance(&mut self, i: usize) -> usize {
        self.update(i);
        let (l, r) = (self.nodes[i].left, self.nodes[i].right);
        let balance = self.height(l) as i16 - self.height(r) as i16;
        if balance > 1 {
            let l = l.expect("left-heavy node has a left child");
            if self.height(self.nodes[l].left) < self.height(self.nodes[l].right) {
                let nl = self.rotate_left(l);
                self.nodes[i].left = Some(nl);
            }
            return self.rotate_right(i);
        }
        if balance < -1 {
            let r = r.expect("right-heavy node has a right child");
            if self.height(self.nodes[r].right) < self.height(self.nodes[r].left) {
                let nr = self.rotate_right(r);
                self.nodes[i].right = Some(nr);
            }
            return self.rotate_left(i);
        }
        i
    }

    /// Insert a lock. If a node with the same extent exists, the lock joins
    /// its ring and the lock owning that node is returned.
    pub fn insert_unique(&mut self, extent: Extent, id: LockId) -> Option<LockId> {
        let mut existing = None;
        let root = self.insert_at(self.root, extent, id, &mut existing);
        self.root = Some(root);
        self.len += 1;
        existing
    }

    fn insert_at(
        &mut self,
        n: Option<usize>,
        extent: Extent,
        id: LockId,
        existing: &mut Option<LockId>,
    ) -> usize {
        let Some(i) = n else {
            return self.alloc(extent, id);
        };
        match extent.cmp(&self.nodes[i].extent) {
            Ordering::Less => {
                let l = self.insert_at(self.nodes[i].left, extent, id, existing);
                self.nodes[i].left = Some(l);
            }
            Ordering::Greater => {
                let r = self.insert_at(self.nodes[i].right, extent, id, existing);
                self.nodes[i].right = Some(r);
            }
            Ordering::Equal => {
                *existing = Some(self.nodes[i].locks[0]);
                self.nodes[i].locks.push(id);
                return i;
            }
        }
        self.rebalance(i)
    }

    fn find(&self, extent: &Extent) -> Option<usize> {
        let mut n = self.root;
        while let Some(i) = n {
            n = match extent.cmp(&self.nodes[i].extent) {
                Ordering::Less => self.nodes[i].left,
                Ordering::Greater => self.nodes[i].right,
                Ordering::Equal => return Some(i),
            };
        }
        None
    }

    /// Remove a lock inserted with `extent`. A ring member is simply
    /// detached; removing the slot owner promotes the next ring member; the
    /// node leaves the tree only with its last lock.
    pub fn remove(&mut self, extent: &Extent, id: LockId) -> bool {
        let Some(i) = self.find(extent) else {
            return false;
        };
        let Some(pos) = self.nodes[i].locks.iter().position(|l| *l == id) else {
            return false;
        };
        self.nodes[i].locks.remove(pos);
        self.len -= 1;
        if self.nodes[i].locks.is_empty() {
            self.root = self.remove_at(self.root, extent);
        }
        true
    }

    fn remove_at(&mut self, n: Option<usize>, extent: &Extent) -> Option<usize> {
        let i = n?;
        match extent.cmp(&self.nodes[i].extent) {
            Ordering::Less => {
                let l = self.remove_at(self.nodes[i].left, extent);
                self.nodes[i].left = l;
            }
            Ordering::Greater => {
                let r = self.remove_at(self.nodes[i].right, extent);
                self.nodes[i].right = r;
            }
            Ordering::Equal => {
                let (l, r) = (self.nodes[i].left, self.nodes[i].right);
                self.release(i);
                let (Some(l), Some(r)) = (l, r) else {
                    return l.or(r);
                };
                let (rest, min) = self.remove_min(r);
                self.nodes[min].left = Some(l);
                self.nodes[min].right = rest;
                return Some(self.rebalance(min));
            }
        }
        Some(self.rebalance(i))
    }

    fn remove_min(&mut self, i: usize) -> (Option<usize>, usize) {
        match self.nodes[i].left {
            None => (self.nodes[i].right, i),
            Some(l) => {
                let (rest, min) = self.remove_min(l);
                self.nodes[i].left = rest;
                (Some(self.rebalance(i)), min)
            }
        }
    }

    /// Locks sharing `extent`, slot owner first.
    pub fn locks_at(&self, extent: &Extent) -> &[LockId] {
        match self.find(extent) {
            Some(i) => &self.nodes[i].locks,
            None => &[],
        }
    }

    /// Every lock whose extent intersects `[lo, hi]`, ring members included.
    pub fn iter_overlap(&self, lo: u64, hi: u64) -> OverlapIter<'_> {
        let mut iter = OverlapIter {
            tree: self,
            stack: Vec::new(),
            lo,
            hi,
            current: None,
        };
        iter.push_left(self.root);
        iter
    }

    /// Whether any lock intersects `[lo, hi]`.
    pub fn is_overlapped(&self, lo: u64, hi: u64) -> bool {
        self.iter_overlap(lo, hi).next().is_some()
    }

    /// The lock with the smallest start among those covering some position
    /// greater than `x`.
    pub fn first_overlap_after(&self, x: u64) -> Option<(Extent, LockId)> {
        let mut n = self.root;
        while let Some(i) = n {
            let node = &self.nodes[i];
            if self.hi(node.left).is_some_and(|h| h > x) {
                n = node.left;
            } else if node.extent.end > x {
                return Some((node.extent, node.locks[0]));
            } else if self.hi(node.right).is_some_and(|h| h > x) {
                n = node.right;
            } else {
                return None;
            }
        }
        None
    }

    /// Largest `end` among locks lying wholly below `x`.
    pub fn max_end_below(&self, x: u64) -> Option<u64> {
        self.max_end_below_at(self.root, x)
    }

    fn max_end_below_at(&self, n: Option<usize>, x: u64) -> Option<u64> {
        let i = n?;
        let node = &self.nodes[i];
        if node.subtree_hi < x {
            return Some(node.subtree_hi);
        }
        let mut best = self.max_end_below_at(node.left, x);
        if node.extent.start < x {
            if node.extent.end < x {
                best = best.max(Some(node.extent.end));
            }
            best = best.max(self.max_end_below_at(node.right, x));
        }
        best
    }

    /// Smallest `start` among locks lying wholly above `x`.
    pub fn min_start_above(&self, x: u64) -> Option<u64> {
        let mut n = self.root;
        let mut best = None;
        while let Some(i) = n {
            let node = &self.nodes[i];
            if node.extent.start > x {
                best = Some(node.extent.start);
                n = node.left;
            } else {
                n = node.right;
            }
        }
        best
    }

    /// Lowest extent in the tree.
    pub fn first(&self) -> Option<Extent> {
        let mut n = self.root?;
        while let Some(l) = self.nodes[n].left {
            n = l;
        }
        Some(self.nodes[n].extent)
    }

    /// Highest extent in the tree.
    pub fn last(&self) -> Option<Extent> {
        let mut n = self.root?;
        while let Some(r) = self.nodes[n].right {
            n = r;
        }
        Some(self.nodes[n].extent)
    }

    /// Next distinct extent after `extent` in tree order.
    pub fn next(&self, extent: &Extent) -> Option<Extent> {
        let mut n = self.root;
        let mut best = None;
        while let Some(i) = n {
            let node = &self.nodes[i];
            if node.extent > *extent {
                best = Some(node.extent);
                n = node.left;
            } else {
                n = node.right;
            }
        }
        best
    }

    /// Previous distinct extent before `extent` in tree order.
    pub fn prev(&self, extent: &Extent) -> Option<Extent> {
        let mut n = self.root;
        let mut best = None;
        while let Some(i) = n {
            let node = &self.nodes[i];
            if node.extent < *extent {
                best = Some(node.extent);
                n = node.right;
            } else {
                n = node.left;
            }
        }
        best
    }

    /// Distinct extents in ascending order, each with its locks.
    pub fn iter(&self) -> NodeIter<'_> {
        NodeIter::new(self, false)
    }

    /// Distinct extents in descending order, each with its locks.
    pub fn iter_rev(&self) -> NodeIter<'_> {
        NodeIter::new(self, true)
    }

    /// Verify ordering, balance and the `subtree_hi` augmentation.
    pub fn check_invariants(&self) -> Result<(), String> {
        let mut count = 0;
        self.check_at(self.root, None, None, &mut count)?;
        if count != self.len {
            return Err(format!("len {} but {} locks reachable", self.len, count));
        }
        Ok(())
    }

    fn check_at(
        &self,
        n: Option<usize>,
        lower: Option<Extent>,
        upper: Option<Extent>,
        count: &mut usize,
    ) -> Result<(u8, u64), String> {
        let Some(i) = n else {
            return Ok((0, 0));
        };
        let node = &self.nodes[i];
        if lower.is_some_and(|l| node.extent <= l) || upper.is_some_and(|u| node.extent >= u) {
            return Err(format!("node {} out of order", node.extent));
        }
        if node.locks.is_empty() {
            return Err(format!("node {} has no locks", node.extent));
        }
        *count += node.locks.len();
        let (lh, lhi) = self.check_at(node.left, lower, Some(node.extent), count)?;
        let (rh, rhi) = self.check_at(node.right, Some(node.extent), upper, count)?;
        if (lh as i16 - rh as i16).abs() > 1 {
            return Err(format!("node {} unbalanced", node.extent));
        }
        let height = 1 + lh.max(rh);
        if height != node.height {
            return Err(format!("node {} height {} != {}", node.extent, node.height, height));
        }
        let mut hi = node.extent.end;
        if node.left.is_some() {
            hi = hi.max(lhi);
        }
        if node.right.is_some() {
            hi = hi.max(rhi);
        }
        if hi != node.subtree_hi {
            return Err(format!(
                "node {} subtree_hi {} != {}",
                node.extent, node.subtree_hi, hi
            ));
        }
        Ok((height, hi))
    }
}

/// Iterator returned by [`IntervalTree::iter_overlap`].
pub struct OverlapIter<'a> {
    tree: &'a IntervalTree,
    stack: Vec<usize>,
    lo: u64,
    hi: u64,
    current: Option<(usize, usize)>,
}

impl OverlapIter<'_> {
    fn push_left(&mut self, mut n: Option<usize>) {
        while let Some(i) = n {
            let node = &self.tree.nodes[i];
            if node.subtree_hi < self.lo {
                break;
            }
            self.stack.push(i);
            n = node.left;
        }
    }
}

impl Iterator for OverlapIter<'_> {
    type Item = (Extent, LockId);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some((i, pos)) = self.current {
                let node = &self.tree.nodes[i];
                if pos < node.locks.len() {
                    self.current = Some((i, pos + 1));
                    return Some((node.extent, node.locks[pos]));
                }
                self.current = None;
            }
            let i = self.stack.pop()?;
            let node = &self.tree.nodes[i];
            if node.extent.start > self.hi {
                // In-order: everything left on the stack starts even later.
                self.stack.clear();
                return None;
            }
            if node.extent.end >= self.lo {
                self.current = Some((i, 0));
            }
            self.push_left(node.right);
        }
    }
}

/// In-order (or reverse-order) walk over distinct extents.
pub struct NodeIter<'a> {
    tree: &'a IntervalTree,
    stack: Vec<usize>,
    reverse: bool,
}

impl<'a> NodeIter<'a> {
    fn new(tree: &'a IntervalTree, reverse: bool) -> Self {
        let mut iter = Self {
            tree,
            stack: Vec::new(),
            reverse,
        };
        iter.descend(tree.root);
        iter
    }

    fn descend(&mut self, mut n: Option<usize>) {
        while let Some(i) = n {
            self.stack.push(i);
            let node = &self.tree.nodes[i];
            n = if self.reverse { node.right } else { node.left };
        }
    }
}

impl<'a> Iterator for NodeIter<'a> {
    type Item = (Extent, &'a [LockId]);

    fn next(&mut self) -> Option<Self::Item> {
        let i = self.stack.pop()?;
        let node = &self.tree.nodes[i];
        let child = if self.reverse { node.left } else { node.right };
        self.descend(child);
        Some((node.extent, node.locks.as_slice()))
    }
}
