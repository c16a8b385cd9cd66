//! Page allocator.
//!
//! A [`PageAllocator`] owns a [`BuddyAllocator`] with one block per page
//! and hands out page-granular allocations from it. Requests that cannot
//! be satisfied contiguously are assembled from several power-of-two
//! chunks unless [`AllocFlags::FORCE_CONTIG`] is set. With
//! [`AllocFlags::SUBPAGES_4K`], requests shorter than half a page are
//! served from slab pages instead.
//!
//! Callers get back a handle naming the allocation, which [`lookup`]
//! resolves to the chunk list. With [`AllocFlags::NO_SCATTER_GATHER`] the
//! handle is the base address of the single chunk.
//!
//! [`lookup`]: PageAllocator::lookup

mod slab;

use alloc::{collections::BTreeMap, format, string::String, vec, vec::Vec};
use core::fmt;

use derive_more::{Display, IsVariant};
use log::{debug, trace};
use snafu::{ResultExt as _, ensure};
use spin::Mutex;

use self::slab::{MAX_SLAB_CLASSES, Slabs};
use crate::{
    AllocatorKind, RangeAllocator,
    buddy::{BuddyAllocator, BuddyOptions},
    carveout::Carveout,
    error::{
        AllocError, BlockSizeNotPowerOfTwoSnafu, CarveoutError, InitError, InvalidLengthSnafu,
        InvalidSlabGeometrySnafu, OutOfSpaceSnafu, ScatterGatherNeedsContigSnafu,
        SourceInitSnafu, ZeroBlockSizeSnafu,
    },
    flags::AllocFlags,
    stats::{AllocStats, PageStats, SlabStats},
};

/// Page allocator configuration beyond the common range parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageOptions {
    /// Smallest slab slot, used with [`AllocFlags::SUBPAGES_4K`].
    pub min_slab_size: u64,
}

impl Default for PageOptions {
    fn default() -> Self {
        Self {
            min_slab_size: 0x1000,
        }
    }
}

/// One contiguous piece of a page allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    pub base: u64,
    pub length: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IsVariant)]
pub enum PageAllocKind {
    #[display("pages")]
    Pages,
    #[display("slab({slab_size:#x})")]
    Slab { slab_size: u64 },
    #[display("fixed")]
    Fixed,
}

/// Allocation record behind a page allocator handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageAlloc {
    /// Address of the first chunk.
    pub base: u64,
    /// Bytes covered by all chunks together.
    pub length: u64,
    pub chunks: Vec<Chunk>,
    pub kind: PageAllocKind,
}

#[derive(Debug)]
struct PageInner {
    allocs: BTreeMap<u64, PageAlloc>,
    slabs: Option<Slabs>,
    next_handle: u64,
    stats: PageStats,
    alloc_stats: AllocStats,
}

impl PageInner {
    fn insert(&mut self, flags: AllocFlags, alloc: PageAlloc) -> u64 {
        let handle = if flags.contains(AllocFlags::NO_SCATTER_GATHER) {
            alloc.base
        } else {
            let handle = self.next_handle;
            self.next_handle += 1;
            handle
        };
        let prev = self.allocs.insert(handle, alloc);
        assert!(prev.is_none(), "page handle {handle:#x} reused");
        handle
    }
}

/// Page-granular allocator over a buddy allocator source.
#[derive(Debug)]
pub struct PageAllocator {
    name: String,
    base: u64,
    length: u64,
    page_size: u64,
    page_shift: u32,
    flags: AllocFlags,
    source: BuddyAllocator,
    inner: Mutex<PageInner>,
}

impl PageAllocator {
    /// Creates a page allocator over `base..base + length` with pages of
    /// `page_size` bytes.
    pub fn new(
        name: impl Into<String>,
        base: u64,
        length: u64,
        page_size: u64,
        flags: AllocFlags,
        options: PageOptions,
    ) -> Result<Self, InitError> {
        let name = name.into();
        ensure!(page_size != 0, ZeroBlockSizeSnafu);
        ensure!(
            page_size.is_power_of_two(),
            BlockSizeNotPowerOfTwoSnafu {
                block_size: page_size
            }
        );
        ensure!(
            !flags.contains(AllocFlags::NO_SCATTER_GATHER)
                || flags.contains(AllocFlags::FORCE_CONTIG),
            ScatterGatherNeedsContigSnafu
        );

        let slabs = if flags.contains(AllocFlags::SUBPAGES_4K) {
            let min_slab_size = options.min_slab_size;
            let geometry_ok = min_slab_size.is_power_of_two()
                && page_size / 2 >= min_slab_size
                && page_size / min_slab_size <= 1 << MAX_SLAB_CLASSES;
            ensure!(
                geometry_ok,
                InvalidSlabGeometrySnafu {
                    page_size,
                    min_slab_size,
                }
            );
            Some(Slabs::new(page_size, min_slab_size))
        } else {
            None
        };

        let source = BuddyAllocator::new(
            format!("{name}-src"),
            base,
            length,
            page_size,
            AllocFlags::empty(),
            BuddyOptions::default(),
        )
        .context(SourceInitSnafu)?;

        debug!(
            "{name}: new page allocator base={base:#x} length={length:#x} \
             page_size={page_size:#x} flags={flags:?}"
        );

        Ok(Self {
            name,
            base,
            length,
            page_size,
            page_shift: page_size.trailing_zeros(),
            flags,
            source,
            inner: Mutex::new(PageInner {
                allocs: BTreeMap::new(),
                slabs,
                next_handle: 1,
                stats: PageStats::default(),
                alloc_stats: AllocStats::default(),
            }),
        })
    }

    #[must_use]
    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    #[must_use]
    pub fn flags(&self) -> AllocFlags {
        self.flags
    }

    /// The buddy allocator pages come from.
    #[must_use]
    pub fn source(&self) -> &BuddyAllocator {
        &self.source
    }

    /// Resolves a handle returned by [`alloc`](RangeAllocator::alloc) or
    /// [`alloc_fixed`](RangeAllocator::alloc_fixed).
    #[must_use]
    pub fn lookup(&self, handle: u64) -> Option<PageAlloc> {
        self.inner.lock().allocs.get(&handle).cloned()
    }

    #[must_use]
    pub fn page_stats(&self) -> PageStats {
        self.inner.lock().stats
    }

    /// Per-class slab occupancy; empty unless slabs are enabled.
    #[must_use]
    pub fn slab_stats(&self) -> Vec<SlabStats> {
        self.inner
            .lock()
            .slabs
            .as_ref()
            .map(Slabs::stats)
            .unwrap_or_default()
    }

    fn alloc_pages(&self, len: u64) -> Result<PageAlloc, AllocError> {
        let pages = len.div_ceil(self.page_size);
        let Some(total) = pages.checked_mul(self.page_size) else {
            return OutOfSpaceSnafu { len }.fail();
        };

        if let Ok(base) = self.source.alloc(total) {
            return Ok(PageAlloc {
                base,
                length: total,
                chunks: vec![Chunk {
                    base,
                    length: total,
                }],
                kind: PageAllocKind::Pages,
            });
        }
        if self.flags.contains(AllocFlags::FORCE_CONTIG) {
            debug!("{}: no contiguous {total:#x} for {len:#x}", self.name);
            return OutOfSpaceSnafu { len }.fail();
        }

        let max_chunk_pages = 1_u64 << self.source.max_order();
        let mut chunk_pages = max_chunk_pages;
        let mut remaining = pages;
        let mut chunks = Vec::new();
        while remaining > 0 {
            chunk_pages = chunk_pages.min(1 << remaining.ilog2());
            let chunk_len = chunk_pages << self.page_shift;
            match self.source.alloc(chunk_len) {
                Ok(base) => {
                    trace!("{}: chunk {base:#x} + {chunk_len:#x}", self.name);
                    chunks.push(Chunk {
                        base,
                        length: chunk_len,
                    });
                    remaining -= chunk_pages;
                }
                Err(_) if chunk_pages > 1 => chunk_pages /= 2,
                Err(_) => {
                    for chunk in &chunks {
                        self.source.free(chunk.base);
                    }
                    debug!(
                        "{}: alloc {len:#x} failed with {remaining} pages unmet",
                        self.name
                    );
                    return OutOfSpaceSnafu { len }.fail();
                }
            }
        }

        Ok(PageAlloc {
            base: chunks[0].base,
            length: total,
            chunks,
            kind: PageAllocKind::Pages,
        })
    }

    fn release_chunks(&self, alloc: &PageAlloc) {
        for chunk in &alloc.chunks {
            self.source.free(chunk.base);
        }
    }
}

impl RangeAllocator for PageAllocator {
    fn kind(&self) -> AllocatorKind {
        AllocatorKind::Page
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn alloc(&self, len: u64) -> Result<u64, AllocError> {
        ensure!(len != 0, InvalidLengthSnafu { len });
        let mut inner = self.inner.lock();

        if len < self.page_size / 2
            && let Some(slabs) = inner.slabs.as_mut()
        {
            let slot = slabs.alloc(len, &self.source)?;
            if slot.fresh_page {
                inner.stats.pages_alloced += 1;
            }
            inner.stats.nr_slab_allocs += 1;
            inner.alloc_stats.record_alloc(len, slot.slab_size);
            let handle = inner.insert(
                self.flags,
                PageAlloc {
                    base: slot.addr,
                    length: slot.slab_size,
                    chunks: vec![Chunk {
                        base: slot.addr,
                        length: slot.slab_size,
                    }],
                    kind: PageAllocKind::Slab {
                        slab_size: slot.slab_size,
                    },
                },
            );
            debug!(
                "{}: alloc {len:#x} -> slab {:#x} (handle {handle:#x})",
                self.name, slot.addr
            );
            return Ok(handle);
        }

        let alloc = self.alloc_pages(len)?;
        inner.stats.nr_allocs += 1;
        inner.stats.pages_alloced += alloc.length >> self.page_shift;
        inner.alloc_stats.record_alloc(len, alloc.length);
        let nr_chunks = alloc.chunks.len();
        let base = alloc.base;
        let handle = inner.insert(self.flags, alloc);
        debug!(
            "{}: alloc {len:#x} -> {base:#x} in {nr_chunks} chunks (handle {handle:#x})",
            self.name
        );
        Ok(handle)
    }

    fn free(&self, handle: u64) {
        if handle == 0 {
            return;
        }
        let mut inner = self.inner.lock();
        let Some(alloc) = inner.allocs.remove(&handle) else {
            panic!("{}: free of unknown handle {handle:#x}", self.name);
        };

        match alloc.kind {
            PageAllocKind::Slab { .. } => {
                let released = inner
                    .slabs
                    .as_mut()
                    .and_then(|slabs| slabs.free(alloc.base));
                if let Some(page) = released {
                    self.source.free(page);
                    inner.stats.pages_freed += 1;
                }
                inner.stats.nr_slab_frees += 1;
                inner.alloc_stats.record_free(alloc.length);
            }
            PageAllocKind::Pages => {
                self.release_chunks(&alloc);
                inner.stats.nr_frees += 1;
                inner.stats.pages_freed += alloc.length >> self.page_shift;
                inner.alloc_stats.record_free(alloc.length);
            }
            PageAllocKind::Fixed => {
                self.release_chunks(&alloc);
                inner.stats.nr_fixed_frees += 1;
                inner.stats.pages_freed += alloc.length >> self.page_shift;
                inner.alloc_stats.record_fixed_free(alloc.length);
            }
        }
        debug!(
            "{}: free handle {handle:#x} ({}, {:#x} + {:#x})",
            self.name, alloc.kind, alloc.base, alloc.length
        );
    }

    fn alloc_fixed(&self, base: u64, len: u64) -> Result<u64, AllocError> {
        ensure!(len != 0, InvalidLengthSnafu { len });
        let Some(length) = len.checked_next_multiple_of(self.page_size) else {
            return OutOfSpaceSnafu { len }.fail();
        };
        let mut inner = self.inner.lock();
        self.source.alloc_fixed(base, length)?;

        inner.stats.nr_fixed_allocs += 1;
        inner.stats.pages_alloced += length >> self.page_shift;
        inner.alloc_stats.record_fixed_alloc(len, length);
        let handle = inner.insert(
            self.flags,
            PageAlloc {
                base,
                length,
                chunks: vec![Chunk { base, length }],
                kind: PageAllocKind::Fixed,
            },
        );
        debug!(
            "{}: alloc (fixed) {base:#x} + {length:#x} (handle {handle:#x})",
            self.name
        );
        Ok(handle)
    }

    fn free_fixed(&self, handle: u64, len: u64) -> Result<(), AllocError> {
        let found = self.inner.lock().allocs.get(&handle).map(|a| a.length);
        let Some(length) = found else {
            panic!("{}: free_fixed of unknown handle {handle:#x}", self.name);
        };
        debug_assert!(len <= length, "free_fixed length {len:#x} exceeds {length:#x}");
        self.free(handle);
        Ok(())
    }

    fn reserve_carveout(&self, carveout: &Carveout) -> Result<(), CarveoutError> {
        let _inner = self.inner.lock();
        self.source.reserve_carveout(carveout)
    }

    fn release_carveout(&self, carveout: &Carveout) -> Result<(), CarveoutError> {
        let _inner = self.inner.lock();
        self.source.release_carveout(carveout)
    }

    fn base(&self) -> u64 {
        self.base
    }

    fn length(&self) -> u64 {
        self.length
    }

    fn space(&self) -> u64 {
        self.source.space()
    }

    fn is_initialized(&self) -> bool {
        self.source.is_initialized()
    }

    fn stats(&self) -> AllocStats {
        self.inner.lock().alloc_stats
    }

    fn print_stats(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        {
            let inner = self.inner.lock();
            writeln!(out, "Page allocator {}:", self.name)?;
            writeln!(out, "  base      = {:#x}", self.base)?;
            writeln!(out, "  length    = {:#x}", self.length)?;
            writeln!(out, "  page_size = {:#x}", self.page_size)?;
            writeln!(out, "  flags     = {:?}", self.flags)?;
            writeln!(out, "  outstanding handles = {}", inner.allocs.len())?;
            write!(out, "{}", inner.stats)?;
            if let Some(slabs) = &inner.slabs {
                writeln!(out, "  Slab size  Empty  Partial  Full")?;
                for class in slabs.stats() {
                    writeln!(
                        out,
                        "  {:>9x}  {:>5}  {:>7}  {:>4}",
                        class.slab_size, class.empty, class.partial, class.full
                    )?;
                }
            }
        }
        writeln!(out, "Source allocator:")?;
        self.source.print_stats(out)
    }

    fn destroy(self) {
        let mut inner = self.inner.into_inner();
        assert!(
            inner.allocs.is_empty(),
            "{}: destroyed with {} outstanding allocations",
            self.name,
            inner.allocs.len()
        );
        if let Some(slabs) = inner.slabs.as_mut() {
            for page in slabs.drain_empty() {
                self.source.free(page);
            }
            assert_eq!(slabs.page_count(), 0, "{}: slab pages leaked", self.name);
        }
        self.source.destroy();
        debug!("{}: destroyed", self.name);
    }
}
