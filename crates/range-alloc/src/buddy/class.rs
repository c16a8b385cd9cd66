//! Size-class grouping for `GVA_SPACE` buddy allocators.
//!
//! When grouping is enabled, every allocation is classified by its
//! length. Buddies split below the group order inherit the class of the
//! allocation that split them, and later searches prefer buddies of the
//! same class, so same-sized allocations cluster within one group.

use alloc::sync::Arc;
use core::fmt;

/// Opaque tag produced by a [`SizeClassifier`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SizeClass(pub u32);

impl fmt::Display for SizeClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "class{}", self.0)
    }
}

/// Maps allocation lengths to size classes and picks the free-list end
/// to search for each class.
pub trait SizeClassifier: Send + Sync {
    fn classify(&self, len: u64) -> SizeClass;

    /// Whether buddies for `class` are taken from the back of a free list
    /// rather than the front.
    fn prefer_back(&self, class: SizeClass) -> bool {
        let _ = class;
        false
    }
}

/// Two-class split at a length threshold.
///
/// Lengths below `threshold` are [`ThresholdClassifier::SMALL`] and are
/// searched from the front of each free list; the rest are
/// [`ThresholdClassifier::LARGE`] and are searched from the back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThresholdClassifier {
    pub threshold: u64,
}

impl ThresholdClassifier {
    pub const SMALL: SizeClass = SizeClass(0);
    pub const LARGE: SizeClass = SizeClass(1);

    #[must_use]
    pub const fn new(threshold: u64) -> Self {
        Self { threshold }
    }
}

impl SizeClassifier for ThresholdClassifier {
    fn classify(&self, len: u64) -> SizeClass {
        if len < self.threshold {
            Self::SMALL
        } else {
            Self::LARGE
        }
    }

    fn prefer_back(&self, class: SizeClass) -> bool {
        class == Self::LARGE
    }
}

/// Grouping configuration: the classifier and the byte length of one
/// group. Buddies at or below the group length carry class tags.
#[derive(Clone)]
pub struct SizeGrouping {
    pub classifier: Arc<dyn SizeClassifier>,
    pub group_len: u64,
}

impl SizeGrouping {
    pub fn new(classifier: impl SizeClassifier + 'static, group_len: u64) -> Self {
        Self {
            classifier: Arc::new(classifier),
            group_len,
        }
    }
}

impl fmt::Debug for SizeGrouping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SizeGrouping")
            .field("group_len", &self.group_len)
            .finish_non_exhaustive()
    }
}
