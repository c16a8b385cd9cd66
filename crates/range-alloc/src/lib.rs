//! Range allocators for device address spaces.
//!
//! This crate hands out sub-ranges of an abstract `u64` address space. It
//! never touches the memory behind the addresses, so the same allocators
//! serve physical memory, device virtual address spaces and any other
//! linear resource. The crate is `no_std` and needs only `alloc`.
//!
//! # Available Allocators
//!
//! ## [`BitmapAllocator`]
//!
//! One bit per block and a search cursor that rotates through the space.
//! Best suited for:
//!
//! - Small spaces with many same-sized allocations
//! - Callers that keep `(base, len)` themselves ([`AllocFlags::NO_ALLOC_PAGE`])
//!
//! ## [`LocklessAllocator`]
//!
//! A pool of equally sized blocks on a compare-and-swap free list. The only
//! allocator that takes no lock.
//!
//! ## [`BuddyAllocator`]
//!
//! The general-purpose strategy: a binary buddy system with coalescing,
//! fixed allocations at caller-chosen addresses, named carveouts reserved at
//! start-up and optional size-class grouping ([`AllocFlags::GVA_SPACE`]).
//!
//! ## [`PageAllocator`]
//!
//! Page-granular allocations built on an internal buddy allocator. Large
//! requests may be assembled from several chunks; small requests can be
//! served from slabs ([`AllocFlags::SUBPAGES_4K`]).
//!
//! # Usage Examples
//!
//! ```rust
//! use range_alloc::{AllocFlags, BuddyAllocator, BuddyOptions, Carveout, RangeAllocator};
//!
//! let buddy = BuddyAllocator::new(
//!     "vidmem",
//!     0x10_0000,
//!     0x10_0000,
//!     0x1000,
//!     AllocFlags::empty(),
//!     BuddyOptions::default(),
//! )?;
//!
//! // Carveouts must be reserved before the first allocation.
//! buddy.reserve_carveout(&Carveout::new("firmware", 0x10_0000, 0x2_0000))?;
//!
//! // Three blocks round up to an order-2 buddy.
//! let addr = buddy.alloc(0x3000)?;
//! assert_eq!((addr - buddy.start()) % 0x4000, 0);
//! buddy.free(addr);
//!
//! buddy.destroy();
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! The closed [`Allocator`] enum picks a strategy at run time:
//!
//! ```rust
//! use range_alloc::{AllocFlags, Allocator, BitmapAllocator, RangeAllocator};
//!
//! let allocator: Allocator =
//!     BitmapAllocator::new("sema", 0x1000, 0x1000, 0x100, AllocFlags::empty())?.into();
//! let addr = allocator.alloc(0x100)?;
//! allocator.free(addr);
//! assert_eq!(allocator.space(), 0x1000);
//! allocator.destroy();
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! # Design Considerations
//!
//! ## Address Zero
//!
//! Address `0` never names an allocation. An allocator configured with a
//! zero base withholds its first block, and `free(0)` is a no-op.
//!
//! ## Errors and Panics
//!
//! Running out of space and invalid requests are reported through
//! [`AllocError`], invalid configuration through [`InitError`] and
//! rejected carveouts through [`CarveoutError`]. Freeing something that was
//! never allocated breaks the allocator's bookkeeping and panics.
//!
//! ## Thread Safety
//!
//! All allocators are `Send + Sync`. Bitmap, buddy and page allocators take
//! one spin lock per call; a page allocator holds its own lock while calling
//! into its source buddy allocator.
//!
//! ## Performance Characteristics
//!
//! | Allocator | Allocation | Deallocation | Metadata |
//! |-----------|------------|--------------|----------|
//! | `BitmapAllocator` | O(n) | O(log n) | 1 bit/block + record |
//! | `LocklessAllocator` | O(1)* | O(1)* | 4 bytes/block |
//! | `BuddyAllocator` | O(max order) | O(max order) | node per buddy |
//! | `PageAllocator` | O(max order × chunks) | O(chunks) | record + chunk list |
//!
//! *Retries under contention

#![cfg_attr(not(test), no_std)]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

extern crate alloc;

use alloc::string::String;
use core::fmt;

use derive_more::{Display, From, IsVariant};
use log::info;

pub use self::{
    bitmap::BitmapAllocator,
    buddy::{BuddyAllocator, BuddyOptions},
    carveout::Carveout,
    error::{AllocError, CarveoutError, InitError},
    flags::AllocFlags,
    lockless::LocklessAllocator,
    page::{PageAllocator, PageOptions},
    stats::AllocStats,
};
use self::error::{CarveoutsUnsupportedSnafu, UnsupportedSnafu};

mod arena;
pub mod bitmap;
pub mod buddy;
mod carveout;
pub mod error;
mod flags;
pub mod lockless;
pub mod page;
pub mod stats;

/// Allocation strategy of an allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IsVariant)]
pub enum AllocatorKind {
    #[display("bitmap")]
    Bitmap,
    #[display("buddy")]
    Buddy,
    #[display("lockless")]
    Lockless,
    #[display("page")]
    Page,
}

/// Operations shared by every allocation strategy.
///
/// `alloc` and `free` are mandatory. Fixed allocations and carveouts are
/// optional: strategies without them report
/// [`AllocError::Unsupported`] and [`CarveoutError::CarveoutsUnsupported`].
pub trait RangeAllocator {
    fn kind(&self) -> AllocatorKind;

    /// Name given at construction, used in log lines and statistics.
    fn name(&self) -> &str;

    /// Allocates `len` bytes and returns the start address (or, for page
    /// allocators, a handle).
    fn alloc(&self, len: u64) -> Result<u64, AllocError>;

    /// Frees an allocation. `free(0)` is a no-op.
    ///
    /// # Panics
    ///
    /// Panics if `addr` does not name a live allocation.
    fn free(&self, addr: u64);

    /// Allocates exactly `base..base + len`.
    fn alloc_fixed(&self, base: u64, len: u64) -> Result<u64, AllocError> {
        let _ = (base, len);
        UnsupportedSnafu {
            operation: "alloc_fixed",
            kind: self.kind(),
        }
        .fail()
    }

    fn free_fixed(&self, base: u64, len: u64) -> Result<(), AllocError> {
        let _ = (base, len);
        UnsupportedSnafu {
            operation: "free_fixed",
            kind: self.kind(),
        }
        .fail()
    }

    /// Permanently reserves a named range. Only allowed before the first
    /// allocation.
    fn reserve_carveout(&self, carveout: &Carveout) -> Result<(), CarveoutError> {
        let _ = carveout;
        CarveoutsUnsupportedSnafu { kind: self.kind() }.fail()
    }

    fn release_carveout(&self, carveout: &Carveout) -> Result<(), CarveoutError> {
        let _ = carveout;
        CarveoutsUnsupportedSnafu { kind: self.kind() }.fail()
    }

    fn base(&self) -> u64;

    fn length(&self) -> u64;

    fn end(&self) -> u64 {
        self.base() + self.length()
    }

    /// Bytes not currently handed out.
    fn space(&self) -> u64;

    fn is_initialized(&self) -> bool {
        true
    }

    fn stats(&self) -> AllocStats;

    /// Writes a human-readable summary of the allocator state.
    fn print_stats(&self, out: &mut dyn fmt::Write) -> fmt::Result;

    /// Sends [`print_stats`](Self::print_stats) output to the log, one line
    /// per record.
    fn log_stats(&self) {
        let mut text = String::new();
        if self.print_stats(&mut text).is_ok() {
            for line in text.lines() {
                info!("{line}");
            }
        }
    }

    /// Tears the allocator down.
    fn destroy(self)
    where
        Self: Sized;
}

/// Any of the four strategies, dispatched statically.
#[derive(Debug, From, IsVariant)]
pub enum Allocator {
    Bitmap(BitmapAllocator),
    Buddy(BuddyAllocator),
    Lockless(LocklessAllocator),
    Page(PageAllocator),
}

macro_rules! dispatch {
    ($self:expr, $inner:ident => $body:expr) => {
        match $self {
            Allocator::Bitmap($inner) => $body,
            Allocator::Buddy($inner) => $body,
            Allocator::Lockless($inner) => $body,
            Allocator::Page($inner) => $body,
        }
    };
}

impl RangeAllocator for Allocator {
    fn kind(&self) -> AllocatorKind {
        dispatch!(self, a => a.kind())
    }

    fn name(&self) -> &str {
        dispatch!(self, a => a.name())
    }

    fn alloc(&self, len: u64) -> Result<u64, AllocError> {
        dispatch!(self, a => a.alloc(len))
    }

    fn free(&self, addr: u64) {
        dispatch!(self, a => a.free(addr));
    }

    fn alloc_fixed(&self, base: u64, len: u64) -> Result<u64, AllocError> {
        dispatch!(self, a => a.alloc_fixed(base, len))
    }

    fn free_fixed(&self, base: u64, len: u64) -> Result<(), AllocError> {
        dispatch!(self, a => a.free_fixed(base, len))
    }

    fn reserve_carveout(&self, carveout: &Carveout) -> Result<(), CarveoutError> {
        dispatch!(self, a => a.reserve_carveout(carveout))
    }

    fn release_carveout(&self, carveout: &Carveout) -> Result<(), CarveoutError> {
        dispatch!(self, a => a.release_carveout(carveout))
    }

    fn base(&self) -> u64 {
        dispatch!(self, a => a.base())
    }

    fn length(&self) -> u64 {
        dispatch!(self, a => a.length())
    }

    fn end(&self) -> u64 {
        dispatch!(self, a => a.end())
    }

    fn space(&self) -> u64 {
        dispatch!(self, a => a.space())
    }

    fn is_initialized(&self) -> bool {
        dispatch!(self, a => a.is_initialized())
    }

    fn stats(&self) -> AllocStats {
        dispatch!(self, a => a.stats())
    }

    fn print_stats(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        dispatch!(self, a => a.print_stats(out))
    }

    fn destroy(self) {
        dispatch!(self, a => a.destroy());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_kinds() -> [Allocator; 4] {
        let flags = AllocFlags::empty();
        [
            BitmapAllocator::new("bitmap", 0x1_0000, 0x1_0000, 0x1000, flags)
                .unwrap()
                .into(),
            BuddyAllocator::new(
                "buddy",
                0x1_0000,
                0x1_0000,
                0x1000,
                flags,
                BuddyOptions::default(),
            )
            .unwrap()
            .into(),
            LocklessAllocator::new("lockless", 0x1_0000, 0x1_0000, 0x1000, flags)
                .unwrap()
                .into(),
            PageAllocator::new(
                "page",
                0x1_0000,
                0x1_0000,
                0x1000,
                flags,
                PageOptions::default(),
            )
            .unwrap()
            .into(),
        ]
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(AllocatorKind::Bitmap.to_string(), "bitmap");
        assert_eq!(AllocatorKind::Lockless.to_string(), "lockless");
        assert!(AllocatorKind::Page.is_page());
    }

    #[test]
    fn test_dispatch_round_trip() {
        for allocator in all_kinds() {
            let name = allocator.name().to_owned();
            assert_eq!(allocator.kind().to_string(), name);
            assert!(allocator.is_initialized());
            assert_eq!(allocator.base(), 0x1_0000);
            assert_eq!(allocator.end(), 0x2_0000);

            let before = allocator.space();
            let addr = allocator.alloc(0x1000).unwrap();
            assert_ne!(addr, 0);
            assert_eq!(allocator.space(), before - 0x1000, "{name}");
            allocator.free(addr);
            assert_eq!(allocator.space(), before, "{name}");
            assert_eq!(allocator.stats().nr_allocs + allocator.stats().nr_frees, 2);

            let mut out = String::new();
            allocator.print_stats(&mut out).unwrap();
            assert!(out.to_lowercase().contains(&name), "{out}");
            allocator.log_stats();
            allocator.destroy();
        }
    }

    #[test]
    fn test_optional_operations() {
        let [bitmap, buddy, lockless, page] = all_kinds();
        let carveout = Carveout::new("co", 0x1_0000, 0x1000);

        assert!(matches!(
            lockless.alloc_fixed(0x1_0000, 0x1000),
            Err(AllocError::Unsupported {
                operation: "alloc_fixed",
                ..
            })
        ));
        assert!(matches!(
            lockless.free_fixed(0x1_0000, 0x1000),
            Err(AllocError::Unsupported {
                operation: "free_fixed",
                ..
            })
        ));
        for allocator in [&bitmap, &lockless] {
            assert!(matches!(
                allocator.reserve_carveout(&carveout),
                Err(CarveoutError::CarveoutsUnsupported { .. })
            ));
            assert!(matches!(
                allocator.release_carveout(&carveout),
                Err(CarveoutError::CarveoutsUnsupported { .. })
            ));
        }
        for allocator in [&buddy, &page] {
            allocator.reserve_carveout(&carveout).unwrap();
            allocator.release_carveout(&carveout).unwrap();
        }

        for allocator in [bitmap, buddy, lockless, page] {
            allocator.destroy();
        }
    }

    #[test]
    fn test_trait_object() {
        let buddy = BuddyAllocator::new(
            "dyn",
            0x1_0000,
            0x1_0000,
            0x1000,
            AllocFlags::empty(),
            BuddyOptions::default(),
        )
        .unwrap();
        let allocator: &dyn RangeAllocator = &buddy;
        let addr = allocator.alloc(0x2000).unwrap();
        assert_eq!(allocator.kind(), AllocatorKind::Buddy);
        allocator.free(addr);
        buddy.destroy();
    }

    #[test]
    fn test_allocators_are_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<BitmapAllocator>();
        assert_send_sync::<BuddyAllocator>();
        assert_send_sync::<LocklessAllocator>();
        assert_send_sync::<PageAllocator>();
        assert_send_sync::<Allocator>();
    }
}
