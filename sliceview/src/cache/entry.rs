//! Per-thread cache entry

use log::warn;

use crate::analysis::interval_index;
use crate::trace_data::Slice;

/// Resident slices of one thread and the window they are complete for.
///
/// Every slice lies within `[start, end]`; slices are sorted by start, ties
/// in fetch order.
#[derive(Debug, Clone)]
pub(crate) struct CacheEntry {
    pub(crate) start: i64,
    pub(crate) end: i64,
    pub(crate) slices: Vec<Slice>,
    pub(crate) last_used: u64,
}

impl CacheEntry {
    /// Entry for the result of a fetch over `[start, end)`.
    ///
    /// Overlapping slices are clipped so the entry stays disjoint. The window
    /// then grows to include slices straddling either edge; a disjoint
    /// sequence leaves no other slice hidden in the extension.
    pub(crate) fn from_fetch(start: i64, end: i64, mut slices: Vec<Slice>, last_used: u64) -> Self {
        let clipped = interval_index::make_disjoint(&mut slices);
        if clipped > 0 {
            warn!("Clipped {clipped} overlapping slices in fetched window [{start}, {end})");
        }
        let start = slices.first().map_or(start, |s| s.start.min(start));
        let end = slices.iter().map(|s| s.end).fold(end, i64::max);
        Self { start, end, slices, last_used }
    }

    /// True when `[start, end)` lies inside the cached window
    pub(crate) fn covers(&self, start: i64, end: i64) -> bool {
        start >= self.start && end <= self.end
    }
}
