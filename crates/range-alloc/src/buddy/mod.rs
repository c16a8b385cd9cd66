//! Binary buddy allocator.
//!
//! The managed range is tiled with power-of-two "buddies" of blocks. An
//! allocation is rounded up to the next power of two blocks and served by
//! the smallest free buddy that fits, splitting larger buddies in halves
//! as needed. Freeing a buddy merges it back with its sibling whenever
//! both halves are free.
//!
//! Besides the power-of-two path the allocator supports *fixed*
//! allocations at caller-chosen addresses, which are assembled from as
//! many naturally aligned buddies as the range needs, and named
//! *carveouts*: fixed allocations reserved before any other allocation
//! is made.

mod class;
mod tree;

use alloc::{collections::BTreeMap, string::String, vec::Vec};
use core::{fmt, mem};

use log::{debug, warn};
use snafu::{OptionExt as _, ResultExt as _, ensure};
use snafu_utils::Report;
use spin::Mutex;

pub use self::class::{SizeClass, SizeClassifier, SizeGrouping, ThresholdClassifier};
use self::tree::BuddyTree;
use crate::{
    AllocatorKind, RangeAllocator,
    arena::NodeId,
    carveout::Carveout,
    error::{
        AllocError, AllocationsMadeSnafu, BlockSizeNotPowerOfTwoSnafu, BusySnafu,
        CarveoutError, CarveoutOutOfRangeSnafu, InitError, InvalidLengthSnafu,
        MaxOrderTooLargeSnafu, MisalignedSnafu, MissingGroupingSnafu, OutOfRangeSnafu,
        OutOfSpaceSnafu, OverlapSnafu, ReserveSnafu, TooSmallSnafu, ZeroBlockSizeSnafu,
        ZeroLengthSnafu,
    },
    flags::AllocFlags,
    stats::{AllocStats, OrderStats},
};

/// Largest order a buddy allocator may be configured with.
pub const MAX_ORDER_LIMIT: u32 = 63;

/// Construction options beyond the common range parameters.
#[derive(Debug, Clone, Default)]
pub struct BuddyOptions {
    /// Upper bound on the buddy order. Defaults to the largest order the
    /// range can hold.
    pub max_order: Option<u32>,
    /// Size-class grouping, required with [`AllocFlags::GVA_SPACE`].
    pub grouping: Option<SizeGrouping>,
}

#[derive(Debug)]
struct FixedAlloc {
    len: u64,
    buddies: Vec<NodeId>,
}

#[derive(Debug)]
struct BuddyInner {
    tree: BuddyTree,
    /// Start address to buddy, for power-of-two allocations.
    allocated: BTreeMap<u64, NodeId>,
    /// Start address to fixed allocation, including carveouts.
    fixed: BTreeMap<u64, FixedAlloc>,
    carveouts: Vec<Carveout>,
    alloc_made: bool,
    stats: AllocStats,
}

/// Buddy allocator over a block-aligned address range.
#[derive(Debug)]
pub struct BuddyAllocator {
    name: String,
    base: u64,
    length: u64,
    start: u64,
    end: u64,
    block_size: u64,
    blk_shift: u32,
    max_order: u32,
    flags: AllocFlags,
    grouping: Option<SizeGrouping>,
    /// Buddies at or below this order carry size-class tags.
    class_order: u32,
    inner: Mutex<BuddyInner>,
}

fn ceil_log2(n: u64) -> Option<u32> {
    n.checked_next_power_of_two().map(u64::trailing_zeros)
}

impl BuddyAllocator {
    /// Creates a buddy allocator over `base..base + length`.
    ///
    /// The range is shrunk inwards to block boundaries. A zero `base`
    /// withholds the first block so that no allocation starts at address
    /// zero.
    pub fn new(
        name: impl Into<String>,
        base: u64,
        length: u64,
        block_size: u64,
        flags: AllocFlags,
        options: BuddyOptions,
    ) -> Result<Self, InitError> {
        let name = name.into();
        ensure!(block_size != 0, ZeroBlockSizeSnafu);
        ensure!(
            block_size.is_power_of_two(),
            BlockSizeNotPowerOfTwoSnafu { block_size }
        );
        ensure!(length != 0, ZeroLengthSnafu);
        if let Some(max_order) = options.max_order {
            ensure!(
                max_order <= MAX_ORDER_LIMIT,
                MaxOrderTooLargeSnafu {
                    max_order,
                    limit: MAX_ORDER_LIMIT,
                }
            );
        }
        let grouping = if flags.contains(AllocFlags::GVA_SPACE) {
            Some(options.grouping.context(MissingGroupingSnafu)?)
        } else {
            None
        };

        let (base, length) = if base == 0 {
            ensure!(length > block_size, TooSmallSnafu { length, block_size });
            (block_size, length - block_size)
        } else {
            (base, length)
        };

        let start = base.checked_next_multiple_of(block_size);
        let end = base.saturating_add(length) & !(block_size - 1);
        let Some(start) = start.filter(|&start| start < end) else {
            return TooSmallSnafu { length, block_size }.fail();
        };

        let blk_shift = block_size.trailing_zeros();
        let blocks = (end - start) >> blk_shift;
        let max_order = options
            .max_order
            .unwrap_or(MAX_ORDER_LIMIT)
            .min(blocks.ilog2());
        let class_order = grouping
            .as_ref()
            .and_then(|g| ceil_log2((g.group_len >> blk_shift).max(1)))
            .unwrap_or(0);

        debug!(
            "{name}: new buddy allocator base={base:#x} length={length:#x} \
             blk_size={block_size:#x} start={start:#x} end={end:#x} \
             max_order={max_order} flags={flags:?}"
        );

        Ok(Self {
            name,
            base,
            length,
            start,
            end,
            block_size,
            blk_shift,
            max_order,
            flags,
            grouping,
            class_order,
            inner: Mutex::new(BuddyInner {
                tree: BuddyTree::new(start, end, blk_shift, max_order),
                allocated: BTreeMap::new(),
                fixed: BTreeMap::new(),
                carveouts: Vec::new(),
                alloc_made: false,
                stats: AllocStats::default(),
            }),
        })
    }

    #[must_use]
    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    #[must_use]
    pub fn max_order(&self) -> u32 {
        self.max_order
    }

    #[must_use]
    pub fn flags(&self) -> AllocFlags {
        self.flags
    }

    /// First block-aligned address of the managed range.
    #[must_use]
    pub fn start(&self) -> u64 {
        self.start
    }

    /// Block-aligned end of the managed range.
    #[must_use]
    pub fn aligned_end(&self) -> u64 {
        self.end
    }

    /// Whether any allocation has been made, which closes the window for
    /// carveouts.
    #[must_use]
    pub fn alloc_made(&self) -> bool {
        self.inner.lock().alloc_made
    }

    /// Free, allocated and split buddy counts for every order up to
    /// [`max_order`](Self::max_order).
    #[must_use]
    pub fn order_table(&self) -> Vec<OrderStats> {
        self.inner.lock().tree.order_stats()
    }

    #[must_use]
    pub fn carveouts(&self) -> Vec<Carveout> {
        self.inner.lock().carveouts.clone()
    }

    fn order_for(&self, len: u64) -> Option<u32> {
        ceil_log2(len.div_ceil(self.block_size)).filter(|&order| order <= self.max_order)
    }

    fn alloc_fixed_locked(
        &self,
        inner: &mut BuddyInner,
        base: u64,
        len: u64,
    ) -> Result<u64, AllocError> {
        ensure!(len != 0, InvalidLengthSnafu { len });
        ensure!(
            base & (self.block_size - 1) == 0,
            MisalignedSnafu {
                base,
                block_size: self.block_size,
            }
        );
        let real_len = len
            .div_ceil(self.block_size)
            .checked_mul(self.block_size)
            .filter(|&real| {
                base >= self.start && base.checked_add(real).is_some_and(|end| end <= self.end)
            });
        let Some(real_len) = real_len else {
            return OutOfRangeSnafu {
                base,
                len,
                start: self.start,
                end: self.end,
            }
            .fail();
        };
        let end = base + real_len;

        if let Some((&other, fixed)) = inner.fixed.range(..end).next_back() {
            ensure!(other + fixed.len <= base, BusySnafu { base, len });
        }
        if let Some((&other, &id)) = inner.allocated.range(..end).next_back() {
            ensure!(
                other + inner.tree.node_len(id) <= base,
                BusySnafu { base, len }
            );
        }

        let mut buddies = Vec::new();
        let mut pos = base;
        while pos < end {
            let blocks = (pos - self.start) >> self.blk_shift;
            let align_order = if blocks == 0 {
                u32::MAX
            } else {
                blocks.trailing_zeros()
            };
            let fit_order = ((end - pos) >> self.blk_shift).ilog2();
            let order = align_order.min(fit_order).min(self.max_order);

            let Some(id) = inner.tree.carve(pos, order) else {
                for id in buddies {
                    inner.tree.release(id);
                }
                debug!(
                    "{}: fixed alloc {base:#x} + {len:#x} collides at {pos:#x}",
                    self.name
                );
                return BusySnafu { base, len }.fail();
            };
            inner.tree.mark_allocated(id);
            pos += inner.tree.node_len(id);
            buddies.push(id);
        }

        debug!(
            "{}: alloc (fixed) {base:#x} + {real_len:#x} in {} buddies",
            self.name,
            buddies.len()
        );
        inner.fixed.insert(
            base,
            FixedAlloc {
                len: real_len,
                buddies,
            },
        );
        inner.stats.record_fixed_alloc(len, real_len);
        Ok(base)
    }

    fn free_locked(&self, inner: &mut BuddyInner, addr: u64) {
        if let Some(fixed) = inner.fixed.remove(&addr) {
            for id in fixed.buddies {
                inner.tree.release(id);
            }
            inner.stats.record_fixed_free(fixed.len);
            inner.carveouts.retain(|c| c.base != addr);
            debug!("{}: free (fixed) {addr:#x} + {:#x}", self.name, fixed.len);
            return;
        }

        let Some(id) = inner.allocated.remove(&addr) else {
            panic!("{}: free of unallocated address {addr:#x}", self.name);
        };
        let order = inner.tree.node(id).order;
        let real_len = inner.tree.node_len(id);
        inner.tree.release(id);
        inner.stats.record_free(real_len);
        debug!("{}: free {addr:#x} (order {order})", self.name);
    }

    fn reserve_locked(
        &self,
        inner: &mut BuddyInner,
        carveout: &Carveout,
    ) -> Result<(), CarveoutError> {
        let name = &carveout.name;
        ensure!(!inner.alloc_made, AllocationsMadeSnafu { name });
        let in_range = carveout.length != 0
            && carveout.base >= self.start
            && carveout
                .base
                .checked_add(carveout.length)
                .is_some_and(|end| end <= self.end);
        ensure!(
            in_range,
            CarveoutOutOfRangeSnafu {
                name,
                start: self.start,
                end: self.end,
            }
        );
        if let Some(other) = inner.carveouts.iter().find(|c| c.overlaps(carveout)) {
            return OverlapSnafu {
                name,
                other: &other.name,
            }
            .fail();
        }

        self.alloc_fixed_locked(inner, carveout.base, carveout.length)
            .context(ReserveSnafu { name })?;
        inner.carveouts.push(carveout.clone());
        Ok(())
    }
}

impl RangeAllocator for BuddyAllocator {
    fn kind(&self) -> AllocatorKind {
        AllocatorKind::Buddy
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn alloc(&self, len: u64) -> Result<u64, AllocError> {
        ensure!(len != 0, InvalidLengthSnafu { len });
        let Some(order) = self.order_for(len) else {
            debug!("{}: alloc {len:#x} exceeds max order", self.name);
            return OutOfSpaceSnafu { len }.fail();
        };
        let class = self.grouping.as_ref().map(|g| g.classifier.classify(len));
        let from_back = self
            .grouping
            .as_ref()
            .zip(class)
            .is_some_and(|(g, class)| g.classifier.prefer_back(class));

        let mut inner = self.inner.lock();
        let found = (order..=self.max_order)
            .find_map(|o| inner.tree.find_free(o, class, from_back));
        let Some(mut id) = found else {
            debug!("{}: alloc {len:#x} (order {order}) failed: no space", self.name);
            return OutOfSpaceSnafu { len }.fail();
        };

        while inner.tree.node(id).order > order {
            let child_order = inner.tree.node(id).order - 1;
            let tag = class.filter(|_| child_order <= self.class_order);
            id = inner.tree.split(id, tag).0;
        }
        inner.tree.mark_allocated(id);

        let addr = inner.tree.node(id).start;
        let real_len = inner.tree.node_len(id);
        inner.allocated.insert(addr, id);
        inner.alloc_made = true;
        inner.stats.record_alloc(len, real_len);

        debug!("{}: alloc {addr:#x} + {len:#x} (order {order})", self.name);
        Ok(addr)
    }

    fn free(&self, addr: u64) {
        if addr == 0 {
            return;
        }
        let mut inner = self.inner.lock();
        self.free_locked(&mut inner, addr);
    }

    fn alloc_fixed(&self, base: u64, len: u64) -> Result<u64, AllocError> {
        let mut inner = self.inner.lock();
        let addr = self.alloc_fixed_locked(&mut inner, base, len)?;
        inner.alloc_made = true;
        Ok(addr)
    }

    fn free_fixed(&self, base: u64, _len: u64) -> Result<(), AllocError> {
        self.free(base);
        Ok(())
    }

    fn reserve_carveout(&self, carveout: &Carveout) -> Result<(), CarveoutError> {
        let mut inner = self.inner.lock();
        let result = self.reserve_locked(&mut inner, carveout);
        match &result {
            Ok(()) => debug!(
                "{}: reserved carveout {:?} {:#x} + {:#x}",
                self.name, carveout.name, carveout.base, carveout.length
            ),
            Err(err) => warn!("{}: {}", self.name, Report::new(err)),
        }
        result
    }

    fn release_carveout(&self, carveout: &Carveout) -> Result<(), CarveoutError> {
        let mut inner = self.inner.lock();
        let Some(index) = inner
            .carveouts
            .iter()
            .position(|c| c.base == carveout.base && c.name == carveout.name)
        else {
            panic!(
                "{}: carveout {:?} at {:#x} is not reserved",
                self.name, carveout.name, carveout.base
            );
        };
        inner.carveouts.remove(index);
        self.free_locked(&mut inner, carveout.base);
        Ok(())
    }

    fn base(&self) -> u64 {
        self.base
    }

    fn length(&self) -> u64 {
        self.length
    }

    fn space(&self) -> u64 {
        let inner = self.inner.lock();
        self.end - self.start - inner.stats.outstanding_bytes()
    }

    fn stats(&self) -> AllocStats {
        self.inner.lock().stats
    }

    fn print_stats(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        let inner = self.inner.lock();
        writeln!(out, "Buddy allocator {}:", self.name)?;
        writeln!(out, "  base      = {:#x}", self.base)?;
        writeln!(out, "  length    = {:#x}", self.length)?;
        writeln!(out, "  start     = {:#x}", self.start)?;
        writeln!(out, "  end       = {:#x}", self.end)?;
        writeln!(out, "  blk_size  = {:#x}", self.block_size)?;
        writeln!(out, "  max_order = {}", self.max_order)?;
        if self.grouping.is_some() {
            writeln!(out, "  grouping  = up to order {}", self.class_order)?;
        }
        writeln!(
            out,
            "  space     = {:#x}",
            self.end - self.start - inner.stats.outstanding_bytes()
        )?;

        if !inner.carveouts.is_empty() {
            writeln!(out, "Carveouts:")?;
            for carveout in &inner.carveouts {
                writeln!(
                    out,
                    "  {:<16} {:#x}..{:#x}",
                    carveout.name,
                    carveout.base,
                    carveout.end()
                )?;
            }
        }
        if !inner.fixed.is_empty() {
            writeln!(out, "Fixed allocations:")?;
            for (base, fixed) in &inner.fixed {
                writeln!(
                    out,
                    "  {base:#x} + {:#x} ({} buddies)",
                    fixed.len,
                    fixed.buddies.len()
                )?;
            }
        }

        writeln!(out, "  Order  Free  Alloc  Split")?;
        for row in inner.tree.order_stats().iter().filter(|row| !row.is_empty()) {
            writeln!(
                out,
                "  {:>5}  {:>4}  {:>5}  {:>5}",
                row.order, row.free, row.allocated, row.split
            )?;
        }
        write!(out, "{}", inner.stats)
    }

    fn destroy(self) {
        let mut inner = self.inner.into_inner();

        for (_, fixed) in mem::take(&mut inner.fixed) {
            for id in fixed.buddies {
                inner.tree.release(id);
            }
        }
        inner.carveouts.clear();

        if !inner.allocated.is_empty() {
            warn!(
                "{}: destroyed with {} outstanding allocations",
                self.name,
                inner.allocated.len()
            );
        }
        for (_, id) in mem::take(&mut inner.allocated) {
            inner.tree.release(id);
        }

        inner.tree.drain();
        debug!("{}: destroyed", self.name);
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use proptest::prelude::*;

    use super::*;

    fn with_buddy<F>(base: u64, length: u64, block_size: u64, test_fn: F)
    where
        F: FnOnce(&BuddyAllocator),
    {
        with_buddy_opts(
            base,
            length,
            block_size,
            AllocFlags::empty(),
            BuddyOptions::default(),
            test_fn,
        );
    }

    fn with_buddy_opts<F>(
        base: u64,
        length: u64,
        block_size: u64,
        flags: AllocFlags,
        options: BuddyOptions,
        test_fn: F,
    ) where
        F: FnOnce(&BuddyAllocator),
    {
        let allocator =
            BuddyAllocator::new("test", base, length, block_size, flags, options).unwrap();
        test_fn(&allocator);
        allocator.destroy();
    }

    fn row(a: &BuddyAllocator, order: u32) -> (u64, u64, u64) {
        let stats = a.order_table()[order as usize];
        (stats.free, stats.allocated, stats.split)
    }

    #[test]
    fn test_invalid_config() {
        let new = |base, length, block_size, flags, options| {
            BuddyAllocator::new("t", base, length, block_size, flags, options)
        };
        let empty = AllocFlags::empty();
        assert!(matches!(
            new(0x1000, 0x1000, 0, empty, BuddyOptions::default()),
            Err(InitError::ZeroBlockSize { .. })
        ));
        assert!(matches!(
            new(0x1000, 0x1000, 0x30, empty, BuddyOptions::default()),
            Err(InitError::BlockSizeNotPowerOfTwo { .. })
        ));
        assert!(matches!(
            new(0x1000, 0, 0x40, empty, BuddyOptions::default()),
            Err(InitError::ZeroLength { .. })
        ));
        assert!(matches!(
            new(0x1010, 0x40, 0x40, empty, BuddyOptions::default()),
            Err(InitError::TooSmall { .. })
        ));
        assert!(matches!(
            new(0, 0x40, 0x40, empty, BuddyOptions::default()),
            Err(InitError::TooSmall { .. })
        ));
        assert!(matches!(
            new(
                0x1000,
                0x1000,
                0x40,
                empty,
                BuddyOptions {
                    max_order: Some(64),
                    grouping: None,
                }
            ),
            Err(InitError::MaxOrderTooLarge { max_order: 64, .. })
        ));
        assert!(matches!(
            new(0x1000, 0x1000, 0x40, AllocFlags::GVA_SPACE, BuddyOptions::default()),
            Err(InitError::MissingGrouping { .. })
        ));
    }

    #[test]
    fn test_unaligned_range_is_shrunk() {
        with_buddy(0x1010, 0x1000, 0x100, |a| {
            assert_eq!(a.start(), 0x1100);
            assert_eq!(a.aligned_end(), 0x2000);
            assert_eq!(a.space(), 0xf00);
            // 15 blocks: 8 + 4 + 2 + 1
            assert_eq!(a.max_order(), 3);
            assert_eq!(row(a, 3).0, 1);
            assert_eq!(row(a, 0).0, 1);
        });
    }

    #[test]
    fn test_max_order_option() {
        let options = BuddyOptions {
            max_order: Some(2),
            grouping: None,
        };
        with_buddy_opts(0x1_0000, 0x1000, 0x40, AllocFlags::empty(), options, |a| {
            assert_eq!(a.max_order(), 2);
            assert_eq!(row(a, 2).0, 16);
            assert!(a.alloc(0x100).is_ok());
            assert!(a.alloc(0x101).unwrap_err().is_out_of_space());
        });
    }

    #[test]
    fn test_sibling_in_use_blocks_coalescing() {
        with_buddy(0x1_0000, 1024, 64, |a| {
            assert_eq!(a.max_order(), 4);

            let big = a.alloc(256).unwrap();
            assert_eq!(big, 0x1_0000);
            let small = a.alloc(64).unwrap();
            assert_eq!(small, 0x1_0100);

            a.free(big);
            assert_eq!(row(a, 4), (0, 0, 1));
            assert_eq!(row(a, 3), (1, 0, 1));
            assert_eq!(row(a, 2), (1, 0, 1));
            assert_eq!(row(a, 1), (1, 0, 1));
            assert_eq!(row(a, 0), (1, 1, 0));

            a.free(small);
            assert_eq!(row(a, 4), (1, 0, 0));
            for order in 0..4 {
                assert_eq!(row(a, order), (0, 0, 0));
            }
        });
    }

    #[test]
    fn test_zero_base_never_returns_zero() {
        with_buddy(0, 1024, 64, |a| {
            assert_eq!(a.base(), 64);
            assert_eq!(a.start(), 64);
            assert_eq!(a.space(), 960);

            let big = a.alloc(256).unwrap();
            let small = a.alloc(64).unwrap();
            assert_ne!(big, 0);
            assert_ne!(small, 0);
            assert_eq!((big - a.start()) % 256, 0);
            a.free(big);
            a.free(small);
            assert_eq!(a.space(), 960);
        });
    }

    #[test]
    fn test_alloc_rounds_to_power_of_two() {
        with_buddy(0x1_0000, 0x1000, 0x40, |a| {
            let addr = a.alloc(0x41).unwrap();
            assert_eq!(a.space(), 0x1000 - 0x80);
            let stats = a.stats();
            assert_eq!(stats.bytes_alloced, 0x41);
            assert_eq!(stats.bytes_alloced_real, 0x80);
            a.free(addr);
            assert_eq!(a.space(), 0x1000);
            assert_eq!(a.stats().bytes_freed, 0x80);
        });
    }

    #[test]
    fn test_exhaustion() {
        with_buddy(0x1_0000, 0x400, 0x40, |a| {
            assert!(a.alloc(0x401).unwrap_err().is_out_of_space());
            let whole = a.alloc(0x400).unwrap();
            assert!(a.alloc(0x40).unwrap_err().is_out_of_space());
            a.free(whole);
            assert!(matches!(
                a.alloc(0),
                Err(AllocError::InvalidLength { .. })
            ));
        });
    }

    #[test]
    fn test_fixed_alloc_spans_several_buddies() {
        with_buddy(0x1_0000, 0x400, 0x40, |a| {
            // Blocks 1..6: one order-0, then two order-1 buddies.
            let base = 0x1_0040;
            assert_eq!(a.alloc_fixed(base, 0x140).unwrap(), base);
            assert_eq!(a.space(), 0x400 - 0x140);
            assert_eq!(row(a, 0).1, 1);
            assert_eq!(row(a, 1).1, 2);
            assert!(a.alloc_made());

            // Plain allocations steer around the fixed range.
            let addr = a.alloc(0x40).unwrap();
            assert!(addr < base || addr >= base + 0x140);
            a.free(addr);

            a.free_fixed(base, 0x140).unwrap();
            assert_eq!(a.space(), 0x400);
            assert_eq!(row(a, 4), (1, 0, 0));
            let stats = a.stats();
            assert_eq!(stats.nr_fixed_allocs, 1);
            assert_eq!(stats.nr_fixed_frees, 1);
        });
    }

    #[test]
    fn test_fixed_alloc_rounds_to_blocks() {
        with_buddy(0x1_0000, 0x400, 0x40, |a| {
            a.alloc_fixed(0x1_0000, 0x50).unwrap();
            assert_eq!(a.space(), 0x400 - 0x80);
            a.free(0x1_0000);
        });
    }

    #[test]
    fn test_fixed_alloc_rejections() {
        with_buddy(0x1_0000, 0x400, 0x40, |a| {
            assert!(matches!(
                a.alloc_fixed(0x1_0010, 0x40),
                Err(AllocError::Misaligned { .. })
            ));
            assert!(matches!(
                a.alloc_fixed(0xffc0, 0x80),
                Err(AllocError::OutOfRange { .. })
            ));
            assert!(matches!(
                a.alloc_fixed(0x1_0380, 0x100),
                Err(AllocError::OutOfRange { .. })
            ));
            assert!(matches!(
                a.alloc_fixed(0x1_0000, 0),
                Err(AllocError::InvalidLength { .. })
            ));

            a.alloc_fixed(0x1_0100, 0x100).unwrap();
            assert!(matches!(
                a.alloc_fixed(0x1_01c0, 0x80),
                Err(AllocError::Busy { .. })
            ));
            assert!(matches!(
                a.alloc_fixed(0x1_00c0, 0x80),
                Err(AllocError::Busy { .. })
            ));
            a.free(0x1_0100);
        });
    }

    #[test]
    fn test_failed_fixed_alloc_leaves_tree_untouched() {
        with_buddy(0x1_0000, 0x400, 0x40, |a| {
            let blocks: Vec<_> = (0..8).map(|_| a.alloc(0x40).unwrap()).collect();
            assert_eq!(blocks[7], 0x1_01c0);
            for &addr in &blocks[..7] {
                a.free(addr);
            }
            let before = a.order_table();
            let space = a.space();

            // Blocks 2..8 include the allocated block 7.
            assert!(matches!(
                a.alloc_fixed(0x1_0080, 0x180),
                Err(AllocError::Busy { .. })
            ));
            assert_eq!(a.order_table(), before);
            assert_eq!(a.space(), space);

            a.free(blocks[7]);
            assert_eq!(row(a, 4), (1, 0, 0));
        });
    }

    #[test]
    fn test_carveouts() {
        with_buddy(0x1_0000, 0x1000, 0x40, |a| {
            let fw = Carveout::new("fw", 0x1_0400, 0x200);
            a.reserve_carveout(&fw).unwrap();
            assert_eq!(a.space(), 0x1000 - 0x200);
            assert!(!a.alloc_made());

            let overlapping = Carveout::new("log", 0x1_0500, 0x200);
            assert!(matches!(
                a.reserve_carveout(&overlapping),
                Err(CarveoutError::Overlap { other, .. }) if other == "fw"
            ));
            let outside = Carveout::new("far", 0x1_0f00, 0x200);
            assert!(matches!(
                a.reserve_carveout(&outside),
                Err(CarveoutError::CarveoutOutOfRange { .. })
            ));
            let misaligned = Carveout::new("odd", 0x1_0010, 0x40);
            assert!(matches!(
                a.reserve_carveout(&misaligned),
                Err(CarveoutError::Reserve {
                    source: AllocError::Misaligned { .. },
                    ..
                })
            ));

            let log = Carveout::new("log", 0x1_0000, 0x100);
            a.reserve_carveout(&log).unwrap();
            assert_eq!(a.carveouts(), [fw.clone(), log.clone()]);

            let addr = a.alloc(0x40).unwrap();
            assert!(a.alloc_made());
            let late = Carveout::new("late", 0x1_0800, 0x100);
            assert!(matches!(
                a.reserve_carveout(&late),
                Err(CarveoutError::AllocationsMade { .. })
            ));

            a.release_carveout(&fw).unwrap();
            assert_eq!(a.carveouts(), [log.clone()]);
            a.release_carveout(&log).unwrap();
            a.free(addr);
            assert_eq!(a.space(), 0x1000);
        });
    }

    #[test]
    fn test_free_of_carveout_base_drops_carveout() {
        with_buddy(0x1_0000, 0x1000, 0x40, |a| {
            let fw = Carveout::new("fw", 0x1_0000, 0x200);
            a.reserve_carveout(&fw).unwrap();
            a.free(0x1_0000);
            assert!(a.carveouts().is_empty());
            assert_eq!(a.space(), 0x1000);

            let mut out = String::new();
            a.print_stats(&mut out).unwrap();
            assert!(!out.contains("Carveouts:"));
        });
    }

    #[test]
    fn test_size_class_grouping() {
        let grouping = SizeGrouping::new(ThresholdClassifier::new(0x100), 0x100);
        let options = BuddyOptions {
            max_order: None,
            grouping: Some(grouping),
        };
        with_buddy_opts(0x1_0000, 0x400, 0x40, AllocFlags::GVA_SPACE, options, |a| {
            let small = a.alloc(0x40).unwrap();
            assert_eq!(small, 0x1_0000);
            // The free order-2 buddy at 0x100 carries the small class, so
            // the large request splits the untagged order-3 buddy instead.
            let large = a.alloc(0x100).unwrap();
            assert_eq!(large, 0x1_0200);
            // Small requests keep filling the small group.
            let small2 = a.alloc(0x40).unwrap();
            assert_eq!(small2, 0x1_0040);

            for addr in [small, large, small2] {
                a.free(addr);
            }
            assert_eq!(row(a, 4), (1, 0, 0));
        });
    }

    #[test]
    fn test_without_grouping_first_fit() {
        with_buddy(0x1_0000, 0x400, 0x40, |a| {
            let small = a.alloc(0x40).unwrap();
            assert_eq!(a.alloc(0x100).unwrap(), 0x1_0100);
            a.free(small);
            a.free(0x1_0100);
        });
    }

    #[test]
    fn test_free_null_is_noop() {
        with_buddy(0x1_0000, 0x400, 0x40, |a| {
            a.free(0);
            assert_eq!(a.stats().nr_frees, 0);
        });
    }

    #[test]
    #[should_panic(expected = "free of unallocated address")]
    fn test_double_free_panics() {
        with_buddy(0x1_0000, 0x400, 0x40, |a| {
            let addr = a.alloc(0x40).unwrap();
            a.free(addr);
            a.free(addr);
        });
    }

    #[test]
    #[should_panic(expected = "is not reserved")]
    fn test_release_unknown_carveout_panics() {
        with_buddy(0x1_0000, 0x400, 0x40, |a| {
            a.release_carveout(&Carveout::new("ghost", 0x1_0000, 0x40))
                .unwrap();
        });
    }

    #[test]
    fn test_destroy_reclaims_outstanding() {
        let a = BuddyAllocator::new(
            "test",
            0x1_0000,
            0x1000,
            0x40,
            AllocFlags::empty(),
            BuddyOptions::default(),
        )
        .unwrap();
        a.reserve_carveout(&Carveout::new("fw", 0x1_0000, 0x80))
            .unwrap();
        a.alloc(0x100).unwrap();
        a.alloc_fixed(0x1_0c40, 0x80).unwrap();
        a.destroy();
    }

    #[test]
    fn test_print_stats() {
        with_buddy(0x1_0000, 0x400, 0x40, |a| {
            a.reserve_carveout(&Carveout::new("fw", 0x1_0000, 0x40))
                .unwrap();
            let addr = a.alloc(0x80).unwrap();
            let mut out = String::new();
            a.print_stats(&mut out).unwrap();
            assert!(out.contains("Buddy allocator test:"));
            assert!(out.contains("Carveouts:"));
            assert!(out.contains("fw"));
            assert!(out.contains("Fixed allocations:"));
            assert!(out.contains("  Order  Free  Alloc  Split"));
            a.free(addr);
        });
    }

    fn rounded(len: u64, block_size: u64) -> u64 {
        len.div_ceil(block_size).next_power_of_two() * block_size
    }

    proptest! {
        #[test]
        fn test_alloc_free_restores_tree(
            lens in prop::collection::vec(1_u64..0x3000, 1..48),
            keys in prop::collection::vec(any::<u32>(), 48),
        ) {
            let a = BuddyAllocator::new(
                "prop",
                0x10_0000,
                0x1_0000,
                0x40,
                AllocFlags::empty(),
                BuddyOptions::default(),
            )
            .unwrap();
            let initial = a.order_table();

            let mut live = Vec::new();
            for len in lens {
                if let Ok(addr) = a.alloc(len) {
                    prop_assert_eq!((addr - a.start()) % rounded(len, 0x40), 0);
                    live.push((addr, rounded(len, 0x40)));
                }
            }

            let mut sorted = live.clone();
            sorted.sort_unstable();
            for pair in sorted.windows(2) {
                prop_assert!(pair[0].0 + pair[0].1 <= pair[1].0);
            }
            let outstanding: u64 = live.iter().map(|&(_, len)| len).sum();
            prop_assert_eq!(a.space(), 0x1_0000 - outstanding);

            let mut order: Vec<_> = live.iter().zip(&keys).map(|(&(addr, _), &k)| (k, addr)).collect();
            order.sort_unstable();
            let freed: BTreeSet<_> = order.iter().map(|&(_, addr)| addr).collect();
            prop_assert_eq!(freed.len(), live.len());
            for (_, addr) in order {
                a.free(addr);
            }

            prop_assert_eq!(a.order_table(), initial);
            prop_assert_eq!(a.space(), 0x1_0000);
            a.destroy();
        }

        #[test]
        fn test_full_exhaustion_coalesces_back(
            perm in Just((0..256_usize).collect::<Vec<_>>()).prop_shuffle(),
        ) {
            let a = BuddyAllocator::new(
                "prop",
                0x10_0000,
                0x4000,
                0x40,
                AllocFlags::empty(),
                BuddyOptions::default(),
            )
            .unwrap();
            let initial = a.order_table();

            let mut blocks = Vec::new();
            while let Ok(addr) = a.alloc(0x40) {
                blocks.push(addr);
            }
            prop_assert_eq!(blocks.len(), 256);
            prop_assert_eq!(a.space(), 0);

            for index in perm {
                a.free(blocks[index]);
            }

            prop_assert_eq!(a.order_table(), initial);
            prop_assert_eq!(a.space(), 0x4000);
            a.destroy();
        }
    }
}
