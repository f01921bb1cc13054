//! Runtime configuration
//!
//! Plain structs with defaults; the CLI fills them from flags.

use crate::domain::AnalysisError;

/// Default margin added on each side of a missed query, in percent of its
/// duration
pub const DEFAULT_WIDEN_PERCENT: u32 = 50;

/// Default number of thread entries kept before LRU eviction
pub const DEFAULT_MAX_ENTRIES: usize = 256;

/// Default utilization bucket width: 10ms
pub const DEFAULT_BUCKET_WIDTH_NS: i64 = 10_000_000;

/// Trace data cache tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    /// A miss on `[s, e)` fetches `[s - p, e + p)` with `p = (e - s) * widen_percent / 100`
    pub widen_percent: u32,
    /// Entries kept before the least recently used is evicted (0 = unbounded)
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { widen_percent: DEFAULT_WIDEN_PERCENT, max_entries: DEFAULT_MAX_ENTRIES }
    }
}

impl CacheConfig {
    /// Widened fetch range for a query on `[start, end)`
    #[must_use]
    pub fn widen(&self, start: i64, end: i64) -> (i64, i64) {
        let duration = end.saturating_sub(start).max(0);
        let pad = duration.saturating_mul(i64::from(self.widen_percent)) / 100;
        (start.saturating_sub(pad), end.saturating_add(pad))
    }
}

/// CPU overview settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnalysisConfig {
    pub bucket_width_ns: i64,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self { bucket_width_ns: DEFAULT_BUCKET_WIDTH_NS }
    }
}

impl AnalysisConfig {
    /// # Errors
    /// Returns an error for a non-positive bucket width
    pub fn validate(&self) -> Result<(), AnalysisError> {
        if self.bucket_width_ns <= 0 {
            return Err(AnalysisError::InvalidBucketWidth(self.bucket_width_ns));
        }
        Ok(())
    }
}
