//! Lock-free pool of equally sized blocks.
//!
//! Free blocks form an intrusive singly linked list threaded through
//! `next`, one link per block. The list head packs a modification tag
//! into the upper half of a 64-bit word next to the block index, so a
//! compare-and-swap cannot succeed against a head that was popped and
//! pushed back in between.

use alloc::{string::String, vec::Vec};
use core::{
    fmt,
    sync::atomic::{AtomicU32, AtomicU64, Ordering},
};

use log::debug;
use snafu::ensure;

use crate::{
    AllocatorKind, RangeAllocator,
    error::{
        AllocError, BlockSizeNotPowerOfTwoSnafu, InitError, InvalidLengthSnafu, OutOfSpaceSnafu,
        TooManyBlocksSnafu, UnalignedConfigSnafu, ZeroBlockSizeSnafu, ZeroLengthSnafu,
    },
    flags::AllocFlags,
    stats::AllocStats,
};

const EMPTY: u32 = u32::MAX;

const fn pack(tag: u32, index: u32) -> u64 {
    ((tag as u64) << 32) | index as u64
}

#[expect(clippy::cast_possible_truncation)]
const fn unpack(head: u64) -> (u32, u32) {
    ((head >> 32) as u32, head as u32)
}

/// Fixed-block-size allocator without locks.
#[derive(Debug)]
pub struct LocklessAllocator {
    name: String,
    base: u64,
    length: u64,
    block_size: u64,
    flags: AllocFlags,
    next: Vec<AtomicU32>,
    head: AtomicU64,
    outstanding: AtomicU64,
    nr_allocs: AtomicU64,
    nr_frees: AtomicU64,
}

impl LocklessAllocator {
    /// Creates a pool of `length / block_size` blocks starting at `base`.
    ///
    /// A zero `base` withholds the first block.
    pub fn new(
        name: impl Into<String>,
        base: u64,
        length: u64,
        block_size: u64,
        flags: AllocFlags,
    ) -> Result<Self, InitError> {
        let name = name.into();
        ensure!(block_size != 0, ZeroBlockSizeSnafu);
        ensure!(
            block_size.is_power_of_two(),
            BlockSizeNotPowerOfTwoSnafu { block_size }
        );
        ensure!(length != 0, ZeroLengthSnafu);
        ensure!(
            base & (block_size - 1) == 0,
            UnalignedConfigSnafu {
                what: "base",
                value: base,
                block_size,
            }
        );
        ensure!(
            length & (block_size - 1) == 0,
            UnalignedConfigSnafu {
                what: "length",
                value: length,
                block_size,
            }
        );

        let (base, length) = if base == 0 {
            (block_size, length - block_size)
        } else {
            (base, length)
        };
        ensure!(length != 0, ZeroLengthSnafu);

        let count = length / block_size;
        let Some(count) = u32::try_from(count).ok().filter(|&c| c < EMPTY) else {
            return TooManyBlocksSnafu { count }.fail();
        };

        let next = (1..=count)
            .map(|n| AtomicU32::new(if n == count { EMPTY } else { n }))
            .collect();

        debug!(
            "{name}: new lockless allocator base={base:#x} length={length:#x} \
             blk_size={block_size:#x} blocks={count}"
        );

        Ok(Self {
            name,
            base,
            length,
            block_size,
            flags,
            next,
            head: AtomicU64::new(pack(0, 0)),
            outstanding: AtomicU64::new(0),
            nr_allocs: AtomicU64::new(0),
            nr_frees: AtomicU64::new(0),
        })
    }

    #[must_use]
    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    #[must_use]
    pub fn flags(&self) -> AllocFlags {
        self.flags
    }

    #[must_use]
    pub fn num_blocks(&self) -> u64 {
        self.next.len() as u64
    }

    /// Number of blocks currently handed out.
    #[must_use]
    pub fn outstanding(&self) -> u64 {
        self.outstanding.load(Ordering::Relaxed)
    }

    fn index_of(&self, addr: u64) -> u32 {
        assert!(
            addr >= self.base && addr < self.end() && (addr - self.base) % self.block_size == 0,
            "{}: address {addr:#x} is not a block of this pool",
            self.name
        );
        #[expect(clippy::cast_possible_truncation)]
        let index = ((addr - self.base) / self.block_size) as u32;
        index
    }

    fn pop(&self) -> Option<u32> {
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            let (tag, index) = unpack(head);
            if index == EMPTY {
                return None;
            }
            let next = self.next[index as usize].load(Ordering::Relaxed);
            match self.head.compare_exchange_weak(
                head,
                pack(tag.wrapping_add(1), next),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(index),
                Err(current) => head = current,
            }
        }
    }

    fn push(&self, index: u32) {
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            let (tag, first) = unpack(head);
            self.next[index as usize].store(first, Ordering::Relaxed);
            match self.head.compare_exchange_weak(
                head,
                pack(tag.wrapping_add(1), index),
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(current) => head = current,
            }
        }
    }
}

impl RangeAllocator for LocklessAllocator {
    fn kind(&self) -> AllocatorKind {
        AllocatorKind::Lockless
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn alloc(&self, len: u64) -> Result<u64, AllocError> {
        ensure!(len == self.block_size, InvalidLengthSnafu { len });

        let Some(index) = self.pop() else {
            debug!("{}: alloc failed: pool exhausted", self.name);
            return OutOfSpaceSnafu { len }.fail();
        };
        self.outstanding.fetch_add(1, Ordering::Relaxed);
        self.nr_allocs.fetch_add(1, Ordering::Relaxed);

        let addr = self.base + u64::from(index) * self.block_size;
        debug!("{}: alloc {addr:#x} (block {index})", self.name);
        Ok(addr)
    }

    fn free(&self, addr: u64) {
        if addr == 0 {
            return;
        }
        let index = self.index_of(addr);
        // Counted out before the block is visible to other poppers.
        self.outstanding.fetch_sub(1, Ordering::Relaxed);
        self.nr_frees.fetch_add(1, Ordering::Relaxed);
        self.push(index);

        debug!("{}: free {addr:#x} (block {index})", self.name);
    }

    fn base(&self) -> u64 {
        self.base
    }

    fn length(&self) -> u64 {
        self.length
    }

    fn space(&self) -> u64 {
        self.num_blocks().saturating_sub(self.outstanding()) * self.block_size
    }

    fn stats(&self) -> AllocStats {
        let nr_allocs = self.nr_allocs.load(Ordering::Relaxed);
        let nr_frees = self.nr_frees.load(Ordering::Relaxed);
        AllocStats {
            bytes_alloced: nr_allocs * self.block_size,
            bytes_alloced_real: nr_allocs * self.block_size,
            bytes_freed: nr_frees * self.block_size,
            nr_allocs,
            nr_frees,
            nr_fixed_allocs: 0,
            nr_fixed_frees: 0,
        }
    }

    fn print_stats(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        writeln!(out, "Lockless allocator {}:", self.name)?;
        writeln!(out, "  start       = {:#x}", self.base)?;
        writeln!(out, "  end         = {:#x}", self.end())?;
        writeln!(out, "  blk_size    = {:#x}", self.block_size)?;
        writeln!(out, "  blocks      = {}", self.num_blocks())?;
        writeln!(out, "  outstanding = {}", self.outstanding())?;
        write!(out, "{}", self.stats())
    }

    fn destroy(self) {
        debug!(
            "{}: destroyed with {} blocks outstanding",
            self.name,
            self.outstanding()
        );
    }
}
