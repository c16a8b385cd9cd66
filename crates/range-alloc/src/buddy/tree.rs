//! Buddy nodes, per-order free lists, splitting and coalescing.
//!
//! Every node is in exactly one of three places: the free list of its
//! order (state [`BuddyState::Free`]), the interior of the tree
//! ([`BuddyState::Split`], with two children), or handed out
//! ([`BuddyState::Allocated`]). The tree does not know who owns an
//! allocated node; the allocator keeps its own indices for that.

use alloc::{collections::BTreeMap, vec, vec::Vec};

use derive_more::{Display, IsVariant};
use log::trace;

use super::class::SizeClass;
use crate::{
    arena::{Arena, NodeId},
    stats::OrderStats,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IsVariant)]
pub(crate) enum BuddyState {
    #[display("free")]
    Free,
    #[display("split")]
    Split,
    #[display("allocated")]
    Allocated,
}

#[derive(Debug)]
pub(crate) struct Buddy {
    pub(crate) start: u64,
    pub(crate) order: u32,
    pub(crate) state: BuddyState,
    pub(crate) class: Option<SizeClass>,
    parent: Option<NodeId>,
    sibling: Option<NodeId>,
    children: Option<(NodeId, NodeId)>,
    // free-list links, meaningful only while `state` is `Free`
    prev: Option<NodeId>,
    next: Option<NodeId>,
}

impl Buddy {
    fn new(start: u64, order: u32, parent: Option<NodeId>, class: Option<SizeClass>) -> Self {
        Self {
            start,
            order,
            state: BuddyState::Free,
            class,
            parent,
            sibling: None,
            children: None,
            prev: None,
            next: None,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct FreeList {
    head: Option<NodeId>,
    tail: Option<NodeId>,
    len: u64,
}

#[derive(Debug, Default, Clone, Copy)]
struct OrderCounts {
    split: u64,
    allocated: u64,
}

#[derive(Debug)]
pub(crate) struct BuddyTree {
    start: u64,
    end: u64,
    blk_shift: u32,
    max_order: u32,
    nodes: Arena<Buddy>,
    roots: BTreeMap<u64, NodeId>,
    free_lists: Vec<FreeList>,
    counts: Vec<OrderCounts>,
}

impl BuddyTree {
    /// Tiles `start..end` with the largest buddies that fit, capped at
    /// `max_order`. Both ends must be block aligned.
    pub(crate) fn new(start: u64, end: u64, blk_shift: u32, max_order: u32) -> Self {
        let orders = max_order as usize + 1;
        let mut tree = Self {
            start,
            end,
            blk_shift,
            max_order,
            nodes: Arena::new(),
            roots: BTreeMap::new(),
            free_lists: vec![FreeList::default(); orders],
            counts: vec![OrderCounts::default(); orders],
        };

        let mut pos = start;
        while pos < end {
            let blocks = (end - pos) >> blk_shift;
            let order = u32::min(blocks.ilog2(), max_order);
            let id = tree.nodes.insert(Buddy::new(pos, order, None, None));
            tree.roots.insert(pos, id);
            tree.push_free(id);
            pos += tree.order_len(order);
        }
        tree
    }

    #[cfg(test)]
    pub(crate) fn max_order(&self) -> u32 {
        self.max_order
    }

    pub(crate) fn order_len(&self, order: u32) -> u64 {
        1 << (order + self.blk_shift)
    }

    pub(crate) fn node(&self, id: NodeId) -> &Buddy {
        &self.nodes[id]
    }

    pub(crate) fn node_len(&self, id: NodeId) -> u64 {
        self.order_len(self.nodes[id].order)
    }

    #[cfg(test)]
    pub(crate) fn node_count(&self) -> usize {
        self.nodes.len()
    }

    #[cfg(test)]
    pub(crate) fn root_count(&self) -> usize {
        self.roots.len()
    }

    pub(crate) fn free_len(&self, order: u32) -> u64 {
        self.free_lists[order as usize].len
    }

    pub(crate) fn order_stats(&self) -> Vec<OrderStats> {
        (0..=self.max_order)
            .map(|order| {
                let counts = self.counts[order as usize];
                OrderStats {
                    order,
                    free: self.free_len(order),
                    allocated: counts.allocated,
                    split: counts.split,
                }
            })
            .collect()
    }

    fn push_free(&mut self, id: NodeId) {
        let order = self.nodes[id].order as usize;
        let old_head = self.free_lists[order].head;
        {
            let node = &mut self.nodes[id];
            debug_assert!(node.state.is_free());
            node.prev = None;
            node.next = old_head;
        }
        match old_head {
            Some(head) => self.nodes[head].prev = Some(id),
            None => self.free_lists[order].tail = Some(id),
        }
        let list = &mut self.free_lists[order];
        list.head = Some(id);
        list.len += 1;
    }

    fn unlink_free(&mut self, id: NodeId) {
        let (order, prev, next) = {
            let node = &mut self.nodes[id];
            assert!(
                node.state.is_free(),
                "unlinking {} buddy at {:#x} from a free list",
                node.state,
                node.start
            );
            (node.order as usize, node.prev.take(), node.next.take())
        };
        match prev {
            Some(prev) => self.nodes[prev].next = next,
            None => self.free_lists[order].head = next,
        }
        match next {
            Some(next) => self.nodes[next].prev = prev,
            None => self.free_lists[order].tail = prev,
        }
        self.free_lists[order].len -= 1;
    }

    /// Picks a free buddy of exactly `order`.
    ///
    /// Without a class, the first buddy from the chosen end wins. With a
    /// class, a buddy tagged with that class wins, otherwise the first
    /// untagged buddy; buddies tagged with another class are skipped.
    pub(crate) fn find_free(
        &self,
        order: u32,
        class: Option<SizeClass>,
        from_back: bool,
    ) -> Option<NodeId> {
        let list = self.free_lists.get(order as usize)?;
        let mut cursor = if from_back { list.tail } else { list.head };
        let mut untagged = None;
        while let Some(id) = cursor {
            let node = &self.nodes[id];
            match (class, node.class) {
                (None, _) => return Some(id),
                (Some(want), Some(have)) if want == have => return Some(id),
                (Some(_), None) if untagged.is_none() => untagged = Some(id),
                _ => {}
            }
            cursor = if from_back { node.prev } else { node.next };
        }
        untagged
    }

    /// Splits a free buddy into two free children tagged with `class`.
    pub(crate) fn split(&mut self, id: NodeId, class: Option<SizeClass>) -> (NodeId, NodeId) {
        let (start, order) = {
            let node = &self.nodes[id];
            assert!(node.order > 0, "splitting order-0 buddy at {:#x}", node.start);
            (node.start, node.order)
        };
        self.unlink_free(id);

        let half = self.order_len(order - 1);
        let left = self
            .nodes
            .insert(Buddy::new(start, order - 1, Some(id), class));
        let right = self
            .nodes
            .insert(Buddy::new(start + half, order - 1, Some(id), class));
        self.nodes[left].sibling = Some(right);
        self.nodes[right].sibling = Some(left);

        let node = &mut self.nodes[id];
        node.state = BuddyState::Split;
        node.children = Some((left, right));
        self.counts[order as usize].split += 1;

        self.push_free(right);
        self.push_free(left);

        trace!("split order {order} buddy at {start:#x}");
        (left, right)
    }

    /// Takes a free buddy off its free list and marks it allocated.
    pub(crate) fn mark_allocated(&mut self, id: NodeId) {
        self.unlink_free(id);
        let node = &mut self.nodes[id];
        node.state = BuddyState::Allocated;
        self.counts[node.order as usize].allocated += 1;
    }

    /// Returns an allocated buddy to the free lists and merges it with its
    /// sibling for as long as the sibling is free too.
    pub(crate) fn release(&mut self, id: NodeId) {
        {
            let node = &mut self.nodes[id];
            assert!(
                node.state.is_allocated(),
                "releasing {} buddy at {:#x}",
                node.state,
                node.start
            );
            node.state = BuddyState::Free;
            self.counts[node.order as usize].allocated -= 1;
        }
        self.push_free(id);
        self.coalesce(id);
    }

    fn coalesce(&mut self, mut id: NodeId) {
        loop {
            let node = &self.nodes[id];
            let (Some(parent), Some(sibling)) = (node.parent, node.sibling) else {
                return;
            };
            if !self.nodes[sibling].state.is_free() {
                return;
            }

            self.unlink_free(id);
            self.unlink_free(sibling);
            self.nodes.remove(id);
            self.nodes.remove(sibling);

            let parent_node = &mut self.nodes[parent];
            parent_node.children = None;
            parent_node.state = BuddyState::Free;
            let order = parent_node.order;
            let start = parent_node.start;
            self.counts[order as usize].split -= 1;
            self.push_free(parent);

            trace!("coalesced order {order} buddy at {start:#x}");
            id = parent;
        }
    }

    /// Finds or makes a free buddy that starts at `pos` with at most
    /// `order`, splitting larger free buddies on the way down.
    ///
    /// Returns `None` when the range at `pos` is already partly or fully
    /// in use. `pos` must be aligned to `order` relative to the tree
    /// start.
    pub(crate) fn carve(&mut self, pos: u64, order: u32) -> Option<NodeId> {
        if pos < self.start || pos >= self.end {
            return None;
        }
        let (_, &root) = self.roots.range(..=pos).next_back()?;
        let order = u32::min(order, self.nodes[root].order);
        let mut id = root;
        loop {
            let node = &self.nodes[id];
            match node.state {
                BuddyState::Allocated => return None,
                BuddyState::Split if node.order > order => {
                    let (left, right) = node.children?;
                    id = if pos < self.nodes[right].start {
                        left
                    } else {
                        right
                    };
                }
                BuddyState::Split => return None,
                BuddyState::Free if node.order > order => {
                    let (left, right) = self.split(id, None);
                    id = if pos < self.nodes[right].start {
                        left
                    } else {
                        right
                    };
                }
                BuddyState::Free => {
                    debug_assert_eq!(node.start, pos);
                    return Some(id);
                }
            }
        }
    }

    /// Removes every root, which must all be free. Leaves the tree empty.
    pub(crate) fn drain(&mut self) {
        let roots = core::mem::take(&mut self.roots);
        for id in roots.into_values() {
            self.unlink_free(id);
            self.nodes.remove(id);
        }
        assert!(
            self.nodes.is_empty(),
            "{} buddies left after draining",
            self.nodes.len()
        );
        for (order, list) in self.free_lists.iter().enumerate() {
            assert_eq!(list.len, 0, "order {order} free list not empty");
        }
        for (order, counts) in self.counts.iter().enumerate() {
            assert_eq!(counts.split, 0, "order {order} has split buddies");
            assert_eq!(counts.allocated, 0, "order {order} has allocated buddies");
        }
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;

    fn free_starts(tree: &BuddyTree, order: u32) -> Vec<u64> {
        let mut out = Vec::new();
        let mut cursor = tree.free_lists[order as usize].head;
        while let Some(id) = cursor {
            out.push(tree.nodes[id].start);
            cursor = tree.nodes[id].next;
        }
        out
    }

    #[test]
    fn test_tiling() {
        // 15 blocks of 0x40 starting at 0x40.
        let tree = BuddyTree::new(0x40, 0x400, 6, 3);
        assert_eq!(tree.root_count(), 4);
        assert_eq!(free_starts(&tree, 3), [0x40]);
        assert_eq!(free_starts(&tree, 2), [0x240]);
        assert_eq!(free_starts(&tree, 1), [0x340]);
        assert_eq!(free_starts(&tree, 0), [0x3c0]);
    }

    #[test]
    fn test_tiling_capped_by_max_order() {
        let tree = BuddyTree::new(0, 0x1000, 6, 2);
        assert_eq!(tree.free_len(2), 16);
        assert_eq!(tree.root_count(), 16);
    }

    #[test]
    fn test_split_and_coalesce() {
        let mut tree = BuddyTree::new(0x1000, 0x1400, 6, 4);
        let root = tree.find_free(4, None, false).unwrap();
        let (left, right) = tree.split(root, None);
        assert_eq!(tree.node(left).start, 0x1000);
        assert_eq!(tree.node(right).start, 0x1200);
        assert_eq!(free_starts(&tree, 3), [0x1000, 0x1200]);

        let (ll, _) = tree.split(left, None);
        tree.mark_allocated(ll);
        assert_eq!(tree.order_stats()[2].allocated, 1);
        assert_eq!(tree.order_stats()[3].split, 1);

        tree.release(ll);
        assert_eq!(tree.node_count(), 1);
        assert_eq!(free_starts(&tree, 4), [0x1000]);
        assert!(tree.order_stats()[..4].iter().all(OrderStats::is_empty));
        tree.drain();
    }

    #[test]
    fn test_find_free_prefers_matching_class() {
        let mut tree = BuddyTree::new(0, 0x400, 6, 4);
        let root = tree.find_free(4, None, false).unwrap();
        let (left, right) = tree.split(root, None);
        let (a, b) = tree.split(left, Some(SizeClass(1)));
        let (c, d) = tree.split(right, None);
        // order-2 list front to back: c d a b
        assert_eq!(tree.find_free(2, None, false), Some(c));
        assert_eq!(tree.find_free(2, None, true), Some(b));
        assert_eq!(tree.find_free(2, Some(SizeClass(1)), false), Some(a));
        assert_eq!(tree.find_free(2, Some(SizeClass(2)), false), Some(c));
        assert_eq!(tree.find_free(2, Some(SizeClass(2)), true), Some(d));
        assert_eq!(tree.find_free(3, None, false), None);

        tree.mark_allocated(c);
        tree.mark_allocated(d);
        assert_eq!(tree.find_free(2, Some(SizeClass(2)), false), None);
        tree.release(c);
        tree.release(d);
    }

    #[test]
    fn test_carve() {
        let mut tree = BuddyTree::new(0, 0x400, 6, 4);
        let id = tree.carve(0xc0, 0).unwrap();
        assert_eq!(tree.node(id).start, 0xc0);
        assert_eq!(tree.node(id).order, 0);
        tree.mark_allocated(id);

        // The order-1 buddy around 0x80 is now split.
        assert!(tree.carve(0x80, 1).is_none());
        assert!(tree.carve(0xc0, 0).is_none());
        let other = tree.carve(0x80, 0).unwrap();
        assert_eq!(tree.node(other).start, 0x80);

        assert!(tree.carve(0x400, 0).is_none());
        tree.release(id);
        assert_eq!(tree.node_count(), 1);
        tree.drain();
    }

    #[test]
    #[should_panic(expected = "releasing free buddy")]
    fn test_release_free_buddy_panics() {
        let mut tree = BuddyTree::new(0, 0x400, 6, 4);
        let root = tree.find_free(4, None, false).unwrap();
        tree.release(root);
    }
}
