//! Error types reported by the allocator constructors and operations.
//!
//! Capacity exhaustion and invalid requests are ordinary [`Result`]s.
//! Broken internal invariants (double free, leftover buddies at teardown)
//! are not represented here: they panic.

use alloc::boxed::Box;

use snafu::Snafu;
use snafu_utils::{Located, Location};

use crate::AllocatorKind;

/// Invalid configuration passed to an allocator constructor.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum InitError {
    #[snafu(display("block size must not be zero"))]
    ZeroBlockSize {
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("block size {block_size:#x} is not a power of two"))]
    BlockSizeNotPowerOfTwo {
        block_size: u64,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("allocator length must not be zero"))]
    ZeroLength {
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("length {length:#x} holds no block of {block_size:#x}"))]
    TooSmall {
        length: u64,
        block_size: u64,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("{what} {value:#x} is not aligned to block size {block_size:#x}"))]
    UnalignedConfig {
        what: &'static str,
        value: u64,
        block_size: u64,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("max order {max_order} exceeds the limit {limit}"))]
    MaxOrderTooLarge {
        max_order: u32,
        limit: u32,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("{count} blocks do not fit a lock-free free list"))]
    TooManyBlocks {
        count: u64,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("GVA_SPACE requires a size-class grouping"))]
    MissingGrouping {
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("NO_SCATTER_GATHER requires FORCE_CONTIG"))]
    ScatterGatherNeedsContig {
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display(
        "page size {page_size:#x} cannot be split into slabs of {min_slab_size:#x}"
    ))]
    InvalidSlabGeometry {
        page_size: u64,
        min_slab_size: u64,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("failed to initialize the source allocator"))]
    SourceInit {
        #[snafu(source(from(InitError, Box::new)))]
        source: Box<InitError>,
        #[snafu(implicit)]
        location: Location,
    },
}

/// Failure of a single allocation request.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum AllocError {
    /// The allocator has no free range of the requested size.
    #[snafu(display("no free space for {len:#x}"))]
    OutOfSpace {
        len: u64,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("invalid allocation length {len:#x}"))]
    InvalidLength {
        len: u64,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("address {base:#x} is not aligned to block size {block_size:#x}"))]
    Misaligned {
        base: u64,
        block_size: u64,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("range {base:#x}+{len:#x} is outside {start:#x}..{end:#x}"))]
    OutOfRange {
        base: u64,
        len: u64,
        start: u64,
        end: u64,
        #[snafu(implicit)]
        location: Location,
    },
    /// Part of a fixed range is already allocated.
    #[snafu(display("range {base:#x}+{len:#x} is already in use"))]
    Busy {
        base: u64,
        len: u64,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("{operation} is not supported by the {kind} allocator"))]
    Unsupported {
        operation: &'static str,
        kind: AllocatorKind,
        #[snafu(implicit)]
        location: Location,
    },
}

impl AllocError {
    /// Returns `true` for the expected "allocator is full" outcome.
    #[must_use]
    pub fn is_out_of_space(&self) -> bool {
        matches!(self, Self::OutOfSpace { .. })
    }
}

/// Rejected carveout reservation.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CarveoutError {
    #[snafu(display("carveout {name:?} requested after the first allocation"))]
    AllocationsMade {
        name: alloc::string::String,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("carveout {name:?} overlaps carveout {other:?}"))]
    Overlap {
        name: alloc::string::String,
        other: alloc::string::String,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("carveout {name:?} is outside {start:#x}..{end:#x}"))]
    CarveoutOutOfRange {
        name: alloc::string::String,
        start: u64,
        end: u64,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("failed to reserve carveout {name:?}"))]
    Reserve {
        name: alloc::string::String,
        source: AllocError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("the {kind} allocator does not support carveouts"))]
    CarveoutsUnsupported {
        kind: AllocatorKind,
        #[snafu(implicit)]
        location: Location,
    },
}

macro_rules! impl_located {
    ($ty:ty { $($variant:ident),* $(,)? }) => {
        impl Located for $ty {
            fn location(&self) -> Location {
                match self {
                    $(Self::$variant { location, .. })|* => *location,
                }
            }
        }
    };
}

impl_located!(InitError {
    ZeroBlockSize,
    BlockSizeNotPowerOfTwo,
    ZeroLength,
    TooSmall,
    UnalignedConfig,
    MaxOrderTooLarge,
    TooManyBlocks,
    MissingGrouping,
    ScatterGatherNeedsContig,
    InvalidSlabGeometry,
    SourceInit,
});

impl_located!(AllocError {
    OutOfSpace,
    InvalidLength,
    Misaligned,
    OutOfRange,
    Busy,
    Unsupported,
});

impl_located!(CarveoutError {
    AllocationsMade,
    Overlap,
    CarveoutOutOfRange,
    Reserve,
    CarveoutsUnsupported,
});
