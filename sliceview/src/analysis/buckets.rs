//! Slice reconstruction and busy-time bucketing.
//!
//! Two passes over scheduler data feed the CPU overview:
//!
//! 1. **Reconstruction** - consecutive `sched_switch` events on one CPU bound a
//!    running period: the task switched in at event *k* runs until event *k+1*.
//!    Periods of the idle task (TID 0) are not slices.
//! 2. **Bucketing** - slices are folded into fixed-width time buckets that
//!    accumulate busy nanoseconds, apportioning a slice that spans several
//!    buckets by its overlap with each.
//!
//! ```text
//! trace:    |0        100       200       300
//! buckets:  [   b0    )[   b1    )[   b2    )
//! slices:   [##)       [##)
//! busy:        50         50         0
//! ```

use crate::domain::{AnalysisError, CpuId, Tid};
use crate::trace_data::SchedSwitchEvent;

/// A running period reconstructed from two consecutive context switches
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuSlice {
    pub cpu: CpuId,
    pub start: i64,
    pub end: i64,
    /// Thread that was switched in
    pub tid: Tid,
    /// Command name of that thread
    pub comm: String,
}

impl CpuSlice {
    #[must_use]
    pub fn duration(&self) -> i64 {
        self.end.saturating_sub(self.start)
    }
}

/// Rebuild running periods from one CPU's ordered `sched_switch` stream.
///
/// Sliding-pair reduction: for each pair `(last, current)` where `last`
/// switched to a non-idle task, emit `[last.timestamp, current.timestamp)`
/// named after `last`'s next task. The final event opens a period that the
/// stream never closes, so it yields no slice.
#[must_use]
pub fn slices_from_sched_switches<I>(events: I) -> Vec<CpuSlice>
where
    I: IntoIterator<Item = SchedSwitchEvent>,
{
    let mut slices = Vec::new();
    let mut last: Option<SchedSwitchEvent> = None;

    for current in events {
        if let Some(prev) = last.take() {
            if !prev.next_pid.is_idle() {
                slices.push(CpuSlice {
                    cpu: prev.cpu,
                    start: prev.timestamp,
                    end: current.timestamp,
                    tid: prev.next_pid,
                    comm: prev.next_comm,
                });
            }
        }
        last = Some(current);
    }

    slices
}

/// Upper bound on the number of buckets in one histogram
pub const MAX_BUCKETS: usize = 1 << 20;

/// Fixed-width busy-time histogram over `[trace_start, trace_end]`
///
/// Bucket arithmetic runs in `i128`, so any `i64` bounds and width are
/// representable without overflow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketAggregator {
    trace_start: i64,
    trace_end: i64,
    bucket_width_ns: i64,
    buckets: Vec<u64>,
}

impl BucketAggregator {
    /// Create an empty histogram covering the whole trace.
    ///
    /// Holds `duration / width + 1` buckets: the final (possibly partial)
    /// bucket covers `trace_end` itself.
    ///
    /// # Errors
    /// Returns an error for a non-positive width, an inverted trace range, or
    /// a histogram of more than [`MAX_BUCKETS`] buckets
    pub fn new(trace_start: i64, trace_end: i64, bucket_width_ns: i64) -> Result<Self, AnalysisError> {
        if bucket_width_ns <= 0 {
            return Err(AnalysisError::InvalidBucketWidth(bucket_width_ns));
        }
        if trace_end < trace_start {
            return Err(AnalysisError::InvalidRange { start: trace_start, end: trace_end });
        }
        let span = i128::from(trace_end) - i128::from(trace_start);
        let count = span / i128::from(bucket_width_ns) + 1;
        let count = usize::try_from(count)
            .ok()
            .filter(|&count| count <= MAX_BUCKETS)
            .ok_or(AnalysisError::TooManyBuckets { width: bucket_width_ns, max: MAX_BUCKETS })?;

        Ok(Self { trace_start, trace_end, bucket_width_ns, buckets: vec![0; count] })
    }

    /// Fold one interval into the buckets it overlaps.
    ///
    /// The interval is clamped to the trace range first, so no busy time is
    /// attributed outside `[trace_start, trace_end]`.
    pub fn add(&mut self, start: i64, end: i64) {
        let start = i128::from(start.max(self.trace_start));
        let end = i128::from(end.min(self.trace_end));
        if end <= start {
            return;
        }

        let origin = i128::from(self.trace_start);
        let width = i128::from(self.bucket_width_ns);
        let first = (start - origin) / width;
        let last = (end - origin + width - 1) / width;

        for index in first..last {
            let bucket_start = origin + index * width;
            let bucket_end = bucket_start + width;
            let overlap = (bucket_end.min(end) - bucket_start.max(start)).max(0);
            let overlap = u64::try_from(overlap).unwrap_or(u64::MAX);
            if let Some(bucket) = usize::try_from(index).ok().and_then(|i| self.buckets.get_mut(i)) {
                *bucket = bucket.saturating_add(overlap);
            }
        }
    }

    /// Fold every slice in `slices`
    pub fn add_slices<'a, I>(&mut self, slices: I)
    where
        I: IntoIterator<Item = &'a CpuSlice>,
    {
        for slice in slices {
            self.add(slice.start, slice.end);
        }
    }

    /// Busy nanoseconds per bucket
    #[must_use]
    pub fn buckets(&self) -> &[u64] {
        &self.buckets
    }

    /// Start timestamp of bucket `index`
    #[must_use]
    pub fn bucket_start(&self, index: usize) -> i64 {
        let index = i128::try_from(index).unwrap_or(i128::MAX);
        let offset = index.saturating_mul(i128::from(self.bucket_width_ns));
        let start = i128::from(self.trace_start).saturating_add(offset);
        i64::try_from(start).unwrap_or(i64::MAX)
    }

    /// Sum of all buckets
    #[must_use]
    pub fn total_busy_ns(&self) -> u64 {
        self.buckets.iter().fold(0, |total, &busy| total.saturating_add(busy))
    }
}

/// Fraction of `cpu_count` CPUs kept busy during a bucket of `width_ns`.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn utilization(busy_ns: u64, width_ns: i64, cpu_count: u32) -> f64 {
    if width_ns <= 0 || cpu_count == 0 {
        return 0.0;
    }
    busy_ns as f64 / (width_ns as f64 * f64::from(cpu_count))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn switch(timestamp: i64, next_pid: u32, comm: &str) -> SchedSwitchEvent {
        SchedSwitchEvent {
            timestamp,
            cpu: CpuId(0),
            next_pid: Tid(next_pid),
            next_comm: comm.to_string(),
        }
    }

    #[test]
    fn test_reconstruction_skips_idle_periods() {
        let events = vec![
            switch(0, 10, "app"),
            switch(40, 0, "swapper/0"),
            switch(90, 11, "db"),
            switch(120, 10, "app"),
        ];
        let slices = slices_from_sched_switches(events);

        assert_eq!(slices.len(), 2);
        assert_eq!((slices[0].start, slices[0].end, slices[0].tid), (0, 40, Tid(10)));
        assert_eq!(slices[0].comm, "app");
        assert_eq!((slices[1].start, slices[1].end, slices[1].tid), (90, 120, Tid(11)));
    }

    #[test]
    fn test_reconstruction_of_short_streams() {
        assert!(slices_from_sched_switches(Vec::new()).is_empty());
        assert!(slices_from_sched_switches(vec![switch(5, 10, "app")]).is_empty());
    }

    #[test]
    fn test_buckets_apportion_partial_overlap() {
        let mut agg = BucketAggregator::new(0, 200, 100).unwrap();
        agg.add(0, 50);
        agg.add(100, 150);
        assert_eq!(agg.buckets(), &[50, 50, 0]);
    }

    #[test]
    fn test_slice_spanning_three_buckets() {
        let mut agg = BucketAggregator::new(0, 300, 100).unwrap();
        agg.add(50, 250);
        assert_eq!(agg.buckets(), &[50, 100, 50, 0]);
        assert_eq!(agg.total_busy_ns(), 200);
    }

    #[test]
    fn test_clamps_to_trace_range() {
        let mut agg = BucketAggregator::new(1_000, 1_200, 100).unwrap();
        agg.add(900, 1_050);
        agg.add(1_150, 5_000);
        assert_eq!(agg.buckets(), &[50, 50, 0]);
        assert_eq!(agg.bucket_start(2), 1_200);
    }

    #[test]
    fn test_non_divisible_duration_keeps_final_partial_bucket() {
        let mut agg = BucketAggregator::new(0, 250, 100).unwrap();
        agg.add(210, 250);
        assert_eq!(agg.buckets().len(), 3);
        assert_eq!(agg.buckets()[2], 40);
    }

    #[test]
    fn test_invalid_configuration_rejected() {
        assert_eq!(
            BucketAggregator::new(0, 100, 0).unwrap_err(),
            AnalysisError::InvalidBucketWidth(0)
        );
        assert!(BucketAggregator::new(100, 0, 10).is_err());
    }

    #[test]
    fn test_widest_bucket_holds_whole_trace() {
        let mut agg = BucketAggregator::new(0, 100, i64::MAX).unwrap();
        agg.add(0, 50);
        assert_eq!(agg.buckets(), &[50]);
    }

    #[test]
    fn test_extreme_bounds_do_not_overflow() {
        let mut agg = BucketAggregator::new(i64::MIN, i64::MAX, i64::MAX).unwrap();
        assert_eq!(agg.buckets().len(), 3);
        agg.add(i64::MIN, i64::MAX);
        assert_eq!(agg.total_busy_ns(), u64::MAX);
        assert_eq!(agg.bucket_start(2), i64::MAX - 1);
    }

    #[test]
    fn test_bucket_count_is_bounded() {
        assert_eq!(
            BucketAggregator::new(-10, i64::MAX, 1_000_000_000_000).unwrap_err(),
            AnalysisError::TooManyBuckets { width: 1_000_000_000_000, max: MAX_BUCKETS }
        );
        // 1000 s of trace at 1 ns
        assert!(matches!(
            BucketAggregator::new(0, 1_000_000_000_000, 1),
            Err(AnalysisError::TooManyBuckets { .. })
        ));
        let max = i64::try_from(MAX_BUCKETS).unwrap();
        assert_eq!(BucketAggregator::new(0, max - 1, 1).unwrap().buckets().len(), MAX_BUCKETS);
        assert!(BucketAggregator::new(0, max, 1).is_err());
    }

    #[test]
    fn test_conservation_over_slice_set() {
        let slices: Vec<CpuSlice> = [(-30, 10), (5, 95), (120, 121), (180, 400), (60, 60)]
            .iter()
            .map(|&(start, end)| CpuSlice { cpu: CpuId(0), start, end, tid: Tid(1), comm: String::new() })
            .collect();

        let mut agg = BucketAggregator::new(0, 250, 30).unwrap();
        agg.add_slices(&slices);

        let expected: i64 =
            slices.iter().map(|s| (s.end.min(250) - s.start.max(0)).max(0)).sum();
        assert_eq!(agg.total_busy_ns(), expected.unsigned_abs());
    }

    /// Trace bounds anywhere on the `i64` axis, widths from 1 ns to
    /// `i64::MAX`, and disjoint slices reaching one bucket past either edge
    fn histogram_case() -> impl Strategy<Value = (i64, i64, i64, Vec<(i64, i64)>)> {
        (any::<i64>(), prop_oneof![1i64..10_000, 1i64..=i64::MAX], 0i64..64)
            .prop_flat_map(|(trace_start, width, buckets)| {
                let trace_end = trace_start.saturating_add(width.saturating_mul(buckets));
                let low = trace_start.saturating_sub(width);
                let high = trace_end.saturating_add(width);
                let points = proptest::collection::vec(low..=high, 0..16);
                (Just(trace_start), Just(trace_end), Just(width), points)
            })
            .prop_map(|(trace_start, trace_end, width, mut points)| {
                points.sort_unstable();
                let slices = points.chunks_exact(2).map(|p| (p[0], p[1])).collect();
                (trace_start, trace_end, width, slices)
            })
    }

    proptest! {
        #[test]
        fn prop_bucketing_conserves_clamped_busy_time(
            (trace_start, trace_end, width, slices) in histogram_case()
        ) {
            let mut agg = BucketAggregator::new(trace_start, trace_end, width).unwrap();
            for &(start, end) in &slices {
                agg.add(start, end);
            }

            let expected: i128 = slices
                .iter()
                .map(|&(start, end)| {
                    (i128::from(end.min(trace_end)) - i128::from(start.max(trace_start))).max(0)
                })
                .sum();
            prop_assert_eq!(i128::from(agg.total_busy_ns()), expected);
        }
    }

    #[test]
    fn test_utilization_fraction() {
        assert!((utilization(50, 100, 1) - 0.5).abs() < f64::EPSILON);
        assert!((utilization(100, 100, 4) - 0.25).abs() < f64::EPSILON);
        assert!(utilization(10, 0, 1).abs() < f64::EPSILON);
    }
}
