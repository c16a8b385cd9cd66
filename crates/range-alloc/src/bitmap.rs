//! Bit-per-block allocator.
//!
//! [`BitmapAllocator`] keeps one bit per block and searches for runs of
//! clear bits starting at a rotating cursor placed just past the most
//! recent allocation. When the tail of the space after the cursor has no
//! suitable run, the search restarts from the beginning of the bitmap but
//! stops at the first allocated block at or after the cursor, so a search
//! never scans across the whole space twice.
//!
//! The [`Bitmap`] helper is shared with the slab pages of the page
//! allocator.

use alloc::{collections::BTreeMap, string::String, vec, vec::Vec};
use core::fmt;

use log::{debug, trace};
use snafu::ensure;
use spin::Mutex;

use crate::{
    AllocatorKind, RangeAllocator,
    error::{
        AllocError, BlockSizeNotPowerOfTwoSnafu, BusySnafu, InitError, InvalidLengthSnafu,
        MisalignedSnafu, OutOfRangeSnafu, OutOfSpaceSnafu, UnalignedConfigSnafu,
        ZeroBlockSizeSnafu, ZeroLengthSnafu,
    },
    flags::AllocFlags,
    stats::AllocStats,
};

const WORD_BITS: usize = u64::BITS as usize;

/// Fixed-length bit vector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Bitmap {
    words: Vec<u64>,
    nbits: usize,
}

impl Bitmap {
    pub(crate) fn new(nbits: usize) -> Self {
        Self {
            words: vec![0; nbits.div_ceil(WORD_BITS)],
            nbits,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.nbits
    }

    pub(crate) fn test(&self, index: usize) -> bool {
        assert!(index < self.nbits);
        self.words[index / WORD_BITS] & (1 << (index % WORD_BITS)) != 0
    }

    pub(crate) fn set_range(&mut self, start: usize, count: usize) {
        self.update_range(start, count, true);
    }

    pub(crate) fn clear_range(&mut self, start: usize, count: usize) {
        self.update_range(start, count, false);
    }

    fn update_range(&mut self, start: usize, count: usize, value: bool) {
        assert!(
            start + count <= self.nbits,
            "bit range {start}+{count} exceeds {}",
            self.nbits
        );
        let mut index = start;
        let end = start + count;
        while index < end {
            let bit = index % WORD_BITS;
            let span = usize::min(WORD_BITS - bit, end - index);
            let mask = if span == WORD_BITS {
                !0
            } else {
                ((1_u64 << span) - 1) << bit
            };
            let word = &mut self.words[index / WORD_BITS];
            if value {
                *word |= mask;
            } else {
                *word &= !mask;
            }
            index += span;
        }
    }

    pub(crate) fn count_ones(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Returns `true` if every bit in `start..start + count` is set.
    pub(crate) fn all_set(&self, start: usize, count: usize) -> bool {
        self.find_next(start, start + count, false) == start + count
    }

    /// Index of the first bit equal to `set` in `start..limit`, or `limit`.
    fn find_next(&self, start: usize, limit: usize, set: bool) -> usize {
        let limit = usize::min(limit, self.nbits);
        let mut index = start;
        while index < limit {
            let word_index = index / WORD_BITS;
            let mut word = self.words[word_index];
            if !set {
                word = !word;
            }
            word &= !0 << (index % WORD_BITS);
            if word != 0 {
                let found = word_index * WORD_BITS + word.trailing_zeros() as usize;
                return usize::min(found, limit);
            }
            index = (word_index + 1) * WORD_BITS;
        }
        limit
    }

    /// Index of the first set bit at or after `start`, or `len()`.
    pub(crate) fn find_next_set(&self, start: usize) -> usize {
        self.find_next(start, self.nbits, true)
    }

    /// Finds `count` consecutive clear bits starting at or after `start`
    /// and ending at or before `limit`.
    pub(crate) fn find_zero_area(&self, start: usize, limit: usize, count: usize) -> Option<usize> {
        let limit = usize::min(limit, self.nbits);
        let mut index = start;
        loop {
            index = self.find_next(index, limit, false);
            let end = index.checked_add(count)?;
            if end > limit {
                return None;
            }
            let busy = self.find_next(index, end, true);
            if busy == end {
                return Some(index);
            }
            index = busy + 1;
        }
    }
}

#[derive(Debug)]
struct BitmapInner {
    bitmap: Bitmap,
    /// Block index just past the most recent allocation.
    next_blk: usize,
    /// Base address to length, for `free`.
    allocs: BTreeMap<u64, u64>,
    stats: AllocStats,
}

/// Flat bit-per-block allocator.
#[derive(Debug)]
pub struct BitmapAllocator {
    name: String,
    base: u64,
    length: u64,
    block_size: u64,
    blk_shift: u32,
    flags: AllocFlags,
    inner: Mutex<BitmapInner>,
}

impl BitmapAllocator {
    /// Creates a bitmap allocator over `base..base + length`.
    ///
    /// If `base` is zero the first block is withheld, so that no allocation
    /// can start at address zero.
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

        let blk_shift = block_size.trailing_zeros();
        let num_bits = usize::try_from(length >> blk_shift).expect("bitmap too large");

        debug!(
            "{name}: new bitmap allocator base={base:#x} length={length:#x} \
             blk_size={block_size:#x} bits={num_bits} flags={flags:?}"
        );

        Ok(Self {
            name,
            base,
            length,
            block_size,
            blk_shift,
            flags,
            inner: Mutex::new(BitmapInner {
                bitmap: Bitmap::new(num_bits),
                next_blk: 0,
                allocs: BTreeMap::new(),
                stats: AllocStats::default(),
            }),
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

    fn blocks_for(&self, len: u64) -> u64 {
        len.div_ceil(self.block_size)
    }

    fn addr_of(&self, offs: usize) -> u64 {
        self.base + ((offs as u64) << self.blk_shift)
    }

    fn offs_of(&self, addr: u64) -> usize {
        usize::try_from((addr - self.base) >> self.blk_shift).expect("bitmap offset overflow")
    }

    /// Validates a caller-placed range and converts it to bit offsets.
    fn fixed_bits(&self, base: u64, len: u64) -> Result<(usize, usize), AllocError> {
        ensure!(len != 0, InvalidLengthSnafu { len });
        ensure!(
            base & (self.block_size - 1) == 0,
            MisalignedSnafu {
                base,
                block_size: self.block_size,
            }
        );
        let blks = self.blocks_for(len);
        let in_range = base >= self.base
            && blks
                .checked_mul(self.block_size)
                .and_then(|real| base.checked_add(real))
                .is_some_and(|end| end <= self.end());
        ensure!(
            in_range,
            OutOfRangeSnafu {
                base,
                len,
                start: self.base,
                end: self.end(),
            }
        );
        let blks = usize::try_from(blks).expect("bitmap offset overflow");
        Ok((self.offs_of(base), blks))
    }
}

impl RangeAllocator for BitmapAllocator {
    fn kind(&self) -> AllocatorKind {
        AllocatorKind::Bitmap
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn alloc(&self, len: u64) -> Result<u64, AllocError> {
        ensure!(len != 0, InvalidLengthSnafu { len });
        let mut inner = self.inner.lock();
        let Ok(blks) = usize::try_from(self.blocks_for(len)) else {
            return OutOfSpaceSnafu { len }.fail();
        };

        let num_bits = inner.bitmap.len();
        let next_blk = inner.next_blk;
        let found = inner
            .bitmap
            .find_zero_area(next_blk, num_bits, blks)
            .or_else(|| {
                // Free space may straddle the cursor, so search up to the
                // first busy block after it.
                let limit = inner.bitmap.find_next_set(next_blk);
                inner.bitmap.find_zero_area(0, limit, blks)
            });
        let Some(offs) = found else {
            inner.next_blk = 0;
            debug!("{}: alloc {len:#x} failed: no space", self.name);
            return OutOfSpaceSnafu { len }.fail();
        };

        inner.bitmap.set_range(offs, blks);
        inner.next_blk = offs + blks;

        let addr = self.addr_of(offs);
        let real_len = (blks as u64) << self.blk_shift;
        if !self.flags.contains(AllocFlags::NO_ALLOC_PAGE) {
            let prev = inner.allocs.insert(addr, real_len);
            assert!(prev.is_none(), "{}: duplicate record at {addr:#x}", self.name);
        }
        inner.stats.record_alloc(len, real_len);

        debug!("{}: alloc {addr:#x} + {len:#x} ({blks} blocks)", self.name);
        Ok(addr)
    }

    fn free(&self, addr: u64) {
        if addr == 0 {
            return;
        }
        assert!(
            !self.flags.contains(AllocFlags::NO_ALLOC_PAGE),
            "{}: free() needs allocation records; use free_fixed()",
            self.name
        );

        let mut inner = self.inner.lock();
        let Some(real_len) = inner.allocs.remove(&addr) else {
            panic!("{}: free of unallocated address {addr:#x}", self.name);
        };
        let offs = self.offs_of(addr);
        let blks = usize::try_from(real_len >> self.blk_shift).expect("bitmap offset overflow");
        inner.bitmap.clear_range(offs, blks);
        inner.stats.record_free(real_len);

        debug!("{}: free {addr:#x} + {real_len:#x}", self.name);
    }

    fn alloc_fixed(&self, base: u64, len: u64) -> Result<u64, AllocError> {
        let (offs, blks) = self.fixed_bits(base, len)?;
        let mut inner = self.inner.lock();

        if inner.bitmap.find_zero_area(offs, offs + blks, blks) != Some(offs) {
            debug!("{}: fixed alloc {base:#x} + {len:#x} collides", self.name);
            return BusySnafu { base, len }.fail();
        }

        inner.bitmap.set_range(offs, blks);
        let real_len = (blks as u64) << self.blk_shift;
        let prev = inner.allocs.insert(base, real_len);
        assert!(prev.is_none(), "{}: duplicate record at {base:#x}", self.name);
        inner.stats.record_fixed_alloc(len, real_len);

        debug!("{}: alloc (fixed) {base:#x} + {len:#x}", self.name);
        Ok(base)
    }

    fn free_fixed(&self, base: u64, len: u64) -> Result<(), AllocError> {
        let (offs, blks) = self.fixed_bits(base, len)?;
        let mut inner = self.inner.lock();

        assert!(
            inner.bitmap.all_set(offs, blks),
            "{}: free of unallocated range {base:#x} + {len:#x}",
            self.name
        );
        let real_len = (blks as u64) << self.blk_shift;
        if let Some(&recorded) = inner.allocs.get(&base) {
            assert!(
                recorded == real_len,
                "{}: free of {base:#x} + {len:#x} does not match allocation of {recorded:#x}",
                self.name
            );
            inner.allocs.remove(&base);
            trace!("{}: dropped record for {base:#x}", self.name);
        }
        inner.bitmap.clear_range(offs, blks);
        inner.stats.record_fixed_free(real_len);

        debug!("{}: free (fixed) {base:#x} + {len:#x}", self.name);
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
        let free = inner.bitmap.len() - inner.bitmap.count_ones();
        (free as u64) << self.blk_shift
    }

    fn stats(&self) -> AllocStats {
        self.inner.lock().stats
    }

    fn print_stats(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        let inner = self.inner.lock();
        writeln!(out, "Bitmap allocator {}:", self.name)?;
        writeln!(out, "  start     = {:#x}", self.base)?;
        writeln!(out, "  end       = {:#x}", self.end())?;
        writeln!(out, "  blk_size  = {:#x}", self.block_size)?;
        writeln!(out, "  blocks    = {}", inner.bitmap.len())?;
        writeln!(out, "  used      = {}", inner.bitmap.count_ones())?;
        writeln!(out, "  next_blk  = {}", inner.next_blk)?;
        writeln!(out, "  records   = {}", inner.allocs.len())?;
        write!(out, "{}", inner.stats)
    }

    fn destroy(self) {
        let inner = self.inner.into_inner();
        debug!(
            "{}: destroyed with {} blocks in use",
            self.name,
            inner.bitmap.count_ones()
        );
    }
}
