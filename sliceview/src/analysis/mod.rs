//! Analysis logic for trace data
//!
//! This module contains pure, synchronous computations over already-resident
//! data, separated from the RPC and caching layers.

pub mod buckets;
pub mod interval_index;

pub use buckets::{slices_from_sched_switches, utilization, BucketAggregator, CpuSlice};
