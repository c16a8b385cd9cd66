//! Read-only counter snapshots exposed to statistics reporters.

use core::fmt;

/// Byte and call counters kept by every strategy.
///
/// `bytes_alloced` counts requested lengths, `bytes_alloced_real` counts
/// what was actually taken from the space after rounding, and
/// `bytes_freed` counts rounded lengths returned to the space.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AllocStats {
    pub bytes_alloced: u64,
    pub bytes_alloced_real: u64,
    pub bytes_freed: u64,
    pub nr_allocs: u64,
    pub nr_frees: u64,
    pub nr_fixed_allocs: u64,
    pub nr_fixed_frees: u64,
}

impl AllocStats {
    /// Rounded bytes currently handed out.
    #[must_use]
    pub fn outstanding_bytes(&self) -> u64 {
        self.bytes_alloced_real - self.bytes_freed
    }

    pub(crate) fn record_alloc(&mut self, len: u64, real_len: u64) {
        self.bytes_alloced += len;
        self.bytes_alloced_real += real_len;
        self.nr_allocs += 1;
    }

    pub(crate) fn record_fixed_alloc(&mut self, len: u64, real_len: u64) {
        self.bytes_alloced += len;
        self.bytes_alloced_real += real_len;
        self.nr_fixed_allocs += 1;
    }

    pub(crate) fn record_free(&mut self, real_len: u64) {
        self.bytes_freed += real_len;
        self.nr_frees += 1;
    }

    pub(crate) fn record_fixed_free(&mut self, real_len: u64) {
        self.bytes_freed += real_len;
        self.nr_fixed_frees += 1;
    }
}

impl fmt::Display for AllocStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Bytes allocated:        {}", self.bytes_alloced)?;
        writeln!(f, "Bytes allocated (real): {}", self.bytes_alloced_real)?;
        writeln!(f, "Bytes freed:            {}", self.bytes_freed)?;
        writeln!(
            f,
            "Allocs/frees:           {}/{}",
            self.nr_allocs, self.nr_frees
        )?;
        writeln!(
            f,
            "Fixed allocs/frees:     {}/{}",
            self.nr_fixed_allocs, self.nr_fixed_frees
        )
    }
}

/// Per-order buddy counts. Every buddy node is counted in exactly one
/// column.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OrderStats {
    pub order: u32,
    pub free: u64,
    pub allocated: u64,
    pub split: u64,
}

impl OrderStats {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.free == 0 && self.allocated == 0 && self.split == 0
    }
}

/// Page allocator counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PageStats {
    pub nr_allocs: u64,
    pub nr_frees: u64,
    pub nr_fixed_allocs: u64,
    pub nr_fixed_frees: u64,
    pub nr_slab_allocs: u64,
    pub nr_slab_frees: u64,
    pub pages_alloced: u64,
    pub pages_freed: u64,
}

impl fmt::Display for PageStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "  allocs         {}", self.nr_allocs)?;
        writeln!(f, "  frees          {}", self.nr_frees)?;
        writeln!(f, "  fixed_allocs   {}", self.nr_fixed_allocs)?;
        writeln!(f, "  fixed_frees    {}", self.nr_fixed_frees)?;
        writeln!(f, "  slab_allocs    {}", self.nr_slab_allocs)?;
        writeln!(f, "  slab_frees     {}", self.nr_slab_frees)?;
        writeln!(f, "  pages alloced  {}", self.pages_alloced)?;
        writeln!(f, "  pages freed    {}", self.pages_freed)
    }
}

/// Occupancy of one slab class.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlabStats {
    pub slab_size: u64,
    pub empty: usize,
    pub partial: usize,
    pub full: usize,
}
