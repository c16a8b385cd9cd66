//! Configuration bitmask shared by every allocator strategy.

use bitflags::bitflags;

bitflags! {
    /// Options recognized by the allocator constructors.
    ///
    /// A strategy ignores the options that do not apply to it, except where
    /// the combination is contradictory (see [`InitError`](crate::InitError)).
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AllocFlags: u64 {
        /// Group buddy allocations by size class.
        ///
        /// Requires a [`SizeGrouping`](crate::buddy::SizeGrouping) in the
        /// buddy options.
        const GVA_SPACE = 1 << 0;

        /// Do not keep per-allocation metadata in the bitmap allocator.
        ///
        /// Callers must release ranges with `free_fixed` and remember the
        /// `(base, len)` of each allocation themselves.
        const NO_ALLOC_PAGE = 1 << 1;

        /// Enable the slab sub-allocator of the page allocator.
        const SUBPAGES_4K = 1 << 2;

        /// Page allocations must be satisfied by one contiguous chunk.
        const FORCE_CONTIG = 1 << 3;

        /// Page allocations return the bare base address instead of a
        /// handle. Requires [`FORCE_CONTIG`](Self::FORCE_CONTIG).
        const NO_SCATTER_GATHER = 1 << 4;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bit_values() {
        assert_eq!(AllocFlags::GVA_SPACE.bits(), 0x1);
        assert_eq!(AllocFlags::NO_ALLOC_PAGE.bits(), 0x2);
        assert_eq!(AllocFlags::SUBPAGES_4K.bits(), 0x4);
        assert_eq!(AllocFlags::FORCE_CONTIG.bits(), 0x8);
        assert_eq!(AllocFlags::NO_SCATTER_GATHER.bits(), 0x10);
    }

    #[test]
    fn test_unknown_bits_are_dropped() {
        let flags = AllocFlags::from_bits_truncate(0x8 | 0x100);
        assert_eq!(flags, AllocFlags::FORCE_CONTIG);
    }
}
