use alloc::string::String;
use core::ops::Range;

/// A named range reserved permanently in an allocator before it is used.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Carveout {
    pub name: String,
    pub base: u64,
    pub length: u64,
}

impl Carveout {
    pub fn new(name: impl Into<String>, base: u64, length: u64) -> Self {
        Self {
            name: name.into(),
            base,
            length,
        }
    }

    #[must_use]
    pub fn end(&self) -> u64 {
        self.base + self.length
    }

    #[must_use]
    pub fn range(&self) -> Range<u64> {
        self.base..self.end()
    }

    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        self.base < other.end() && other.base < self.end()
    }
}
