//! Sub-page slabs.
//!
//! Each slab class hands out slots of one power-of-two size carved from
//! whole pages of the source allocator. Pages move between the class's
//! empty, partial and full sets as slots are taken and returned, and at
//! most one empty page per class is kept around for reuse.

use alloc::{
    collections::{BTreeMap, BTreeSet},
    vec::Vec,
};

use arrayvec::ArrayVec;
use derive_more::{Display, IsVariant};
use log::trace;

use crate::{
    RangeAllocator as _, bitmap::Bitmap, buddy::BuddyAllocator, error::AllocError,
    stats::SlabStats,
};

/// Most slab classes a page allocator can have: slabs range from
/// `page_size / 64` to `page_size / 2`.
pub(crate) const MAX_SLAB_CLASSES: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IsVariant)]
enum SlabPageState {
    #[display("empty")]
    Empty,
    #[display("partial")]
    Partial,
    #[display("full")]
    Full,
}

#[derive(Debug)]
struct SlabPage {
    class: usize,
    slots: Bitmap,
    used: usize,
    state: SlabPageState,
}

impl SlabPage {
    fn state_for(&self) -> SlabPageState {
        match self.used {
            0 => SlabPageState::Empty,
            n if n == self.slots.len() => SlabPageState::Full,
            _ => SlabPageState::Partial,
        }
    }
}

#[derive(Debug)]
struct SlabClass {
    slab_size: u64,
    empty: BTreeSet<u64>,
    partial: BTreeSet<u64>,
    full: BTreeSet<u64>,
}

impl SlabClass {
    fn set_mut(&mut self, state: SlabPageState) -> &mut BTreeSet<u64> {
        match state {
            SlabPageState::Empty => &mut self.empty,
            SlabPageState::Partial => &mut self.partial,
            SlabPageState::Full => &mut self.full,
        }
    }
}

/// A slot handed out by [`Slabs::alloc`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SlabSlot {
    pub(crate) addr: u64,
    pub(crate) slab_size: u64,
    /// Whether the slot's page was taken from the source for this call.
    pub(crate) fresh_page: bool,
}

#[derive(Debug)]
pub(crate) struct Slabs {
    page_size: u64,
    min_slab_size: u64,
    classes: ArrayVec<SlabClass, MAX_SLAB_CLASSES>,
    /// Page address to page descriptor.
    pages: BTreeMap<u64, SlabPage>,
}

impl Slabs {
    /// `page_size` must be at least twice `min_slab_size` and at most 64
    /// times it, both powers of two.
    pub(crate) fn new(page_size: u64, min_slab_size: u64) -> Self {
        let mut classes = ArrayVec::new();
        let mut slab_size = min_slab_size;
        while slab_size <= page_size / 2 {
            classes.push(SlabClass {
                slab_size,
                empty: BTreeSet::new(),
                partial: BTreeSet::new(),
                full: BTreeSet::new(),
            });
            slab_size *= 2;
        }
        Self {
            page_size,
            min_slab_size,
            classes,
            pages: BTreeMap::new(),
        }
    }

    fn class_for(&self, len: u64) -> usize {
        let size = u64::max(self.min_slab_size, len.next_power_of_two());
        (size / self.min_slab_size).trailing_zeros() as usize
    }

    pub(crate) fn alloc(
        &mut self,
        len: u64,
        source: &BuddyAllocator,
    ) -> Result<SlabSlot, AllocError> {
        let class_index = self.class_for(len);
        let class = &self.classes[class_index];
        let slab_size = class.slab_size;

        let existing = class
            .partial
            .first()
            .or_else(|| class.empty.first())
            .copied();
        let (page_addr, fresh_page) = match existing {
            Some(page_addr) => (page_addr, false),
            None => {
                let page_addr = source.alloc(self.page_size)?;
                let nr_slots = usize::try_from(self.page_size / slab_size)
                    .expect("slab slot count overflow");
                self.pages.insert(
                    page_addr,
                    SlabPage {
                        class: class_index,
                        slots: Bitmap::new(nr_slots),
                        used: 0,
                        state: SlabPageState::Empty,
                    },
                );
                self.classes[class_index].empty.insert(page_addr);
                trace!("new slab page {page_addr:#x} for {slab_size:#x} slabs");
                (page_addr, true)
            }
        };

        let page = self
            .pages
            .get_mut(&page_addr)
            .expect("slab page listed but not tracked");
        let slot = page
            .slots
            .find_zero_area(0, page.slots.len(), 1)
            .expect("non-full slab page without a free slot");
        page.slots.set_range(slot, 1);
        page.used += 1;

        let old = page.state;
        page.state = page.state_for();
        let new = page.state;
        if old != new {
            let class = &mut self.classes[class_index];
            class.set_mut(old).remove(&page_addr);
            class.set_mut(new).insert(page_addr);
        }

        Ok(SlabSlot {
            addr: page_addr + slot as u64 * slab_size,
            slab_size,
            fresh_page,
        })
    }

    /// Returns a slot. Yields the page address if the page became empty
    /// while the class already holds a spare; the caller hands it back to
    /// the source allocator.
    pub(crate) fn free(&mut self, addr: u64) -> Option<u64> {
        let page_addr = addr & !(self.page_size - 1);
        let Some(page) = self.pages.get_mut(&page_addr) else {
            panic!("slab free of {addr:#x}: no slab page at {page_addr:#x}");
        };
        let class_index = page.class;
        let slab_size = self.classes[class_index].slab_size;
        let slot = usize::try_from((addr - page_addr) / slab_size).expect("slab slot overflow");
        assert!(
            (addr - page_addr) % slab_size == 0 && page.slots.test(slot),
            "slab free of {addr:#x}: slot is not allocated"
        );
        page.slots.clear_range(slot, 1);
        page.used -= 1;

        let old = page.state;
        let new = page.state_for();
        page.state = new;
        let class = &mut self.classes[class_index];
        if old != new {
            class.set_mut(old).remove(&page_addr);
            if new.is_empty() && !class.empty.is_empty() {
                self.pages.remove(&page_addr);
                trace!("releasing spare slab page {page_addr:#x}");
                return Some(page_addr);
            }
            class.set_mut(new).insert(page_addr);
        }
        None
    }

    /// Removes every empty page and returns their addresses.
    pub(crate) fn drain_empty(&mut self) -> Vec<u64> {
        let mut drained = Vec::new();
        for class in &mut self.classes {
            drained.extend(core::mem::take(&mut class.empty));
        }
        for page_addr in &drained {
            self.pages.remove(page_addr);
        }
        drained
    }

    pub(crate) fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub(crate) fn stats(&self) -> Vec<SlabStats> {
        self.classes
            .iter()
            .map(|class| SlabStats {
                slab_size: class.slab_size,
                empty: class.empty.len(),
                partial: class.partial.len(),
                full: class.full.len(),
            })
            .collect()
    }
}
