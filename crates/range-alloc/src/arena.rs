//! Index arena with generation-checked handles.
//!
//! Buddy nodes link to their parent, sibling and children through
//! [`NodeId`]s into an [`Arena`]. Removing a node bumps its slot's
//! generation, so any handle still pointing at the old node is detected on
//! the next access instead of silently aliasing a newer node.

use alloc::vec::Vec;
use core::ops::{Index, IndexMut};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct NodeId {
    index: u32,
    generation: u32,
}

#[derive(Debug)]
enum Slot<T> {
    Occupied { generation: u32, value: T },
    Vacant { generation: u32 },
}

#[derive(Debug)]
pub(crate) struct Arena<T> {
    slots: Vec<Slot<T>>,
    vacant: Vec<u32>,
    len: usize,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Arena<T> {
    pub(crate) const fn new() -> Self {
        Self {
            slots: Vec::new(),
            vacant: Vec::new(),
            len: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub(crate) fn insert(&mut self, value: T) -> NodeId {
        self.len += 1;
        if let Some(index) = self.vacant.pop() {
            let slot = &mut self.slots[index as usize];
            let Slot::Vacant { generation } = *slot else {
                panic!("vacant list points at occupied slot {index}");
            };
            *slot = Slot::Occupied { generation, value };
            return NodeId { index, generation };
        }

        let index = u32::try_from(self.slots.len()).expect("arena index overflow");
        self.slots.push(Slot::Occupied {
            generation: 0,
            value,
        });
        NodeId {
            index,
            generation: 0,
        }
    }

    /// Removes the node and invalidates every handle to it.
    ///
    /// # Panics
    ///
    /// Panics if `id` is stale.
    pub(crate) fn remove(&mut self, id: NodeId) -> T {
        let slot = &mut self.slots[id.index as usize];
        match slot {
            Slot::Occupied { generation, .. } if *generation == id.generation => {}
            _ => panic!("stale node handle {id:?}"),
        }
        let old = core::mem::replace(
            slot,
            Slot::Vacant {
                generation: id.generation.wrapping_add(1),
            },
        );
        self.vacant.push(id.index);
        self.len -= 1;
        match old {
            Slot::Occupied { value, .. } => value,
            Slot::Vacant { .. } => unreachable!(),
        }
    }

    pub(crate) fn get(&self, id: NodeId) -> Option<&T> {
        match self.slots.get(id.index as usize)? {
            Slot::Occupied { generation, value } if *generation == id.generation => Some(value),
            _ => None,
        }
    }

    pub(crate) fn get_mut(&mut self, id: NodeId) -> Option<&mut T> {
        match self.slots.get_mut(id.index as usize)? {
            Slot::Occupied { generation, value } if *generation == id.generation => Some(value),
            _ => None,
        }
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, id: NodeId) -> bool {
        self.get(id).is_some()
    }

    #[cfg(test)]
    pub(crate) fn iter(&self) -> impl Iterator<Item = (NodeId, &T)> {
        self.slots
            .iter()
            .zip(0..)
            .filter_map(|(slot, index)| match slot {
                Slot::Occupied { generation, value } => Some((
                    NodeId {
                        index,
                        generation: *generation,
                    },
                    value,
                )),
                Slot::Vacant { .. } => None,
            })
    }
}

impl<T> Index<NodeId> for Arena<T> {
    type Output = T;

    fn index(&self, id: NodeId) -> &T {
        self.get(id)
            .unwrap_or_else(|| panic!("stale node handle {id:?}"))
    }
}

impl<T> IndexMut<NodeId> for Arena<T> {
    fn index_mut(&mut self, id: NodeId) -> &mut T {
        self.get_mut(id)
            .unwrap_or_else(|| panic!("stale node handle {id:?}"))
    }
}
