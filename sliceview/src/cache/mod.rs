//! Trace data cache: per-thread slice windows served from memory and
//! refreshed from a [`SliceSource`] in the background

mod entry;
pub mod trace_data_cache;

pub use trace_data_cache::{CacheStats, FetchFuture, SliceSource, TraceDataCache};
