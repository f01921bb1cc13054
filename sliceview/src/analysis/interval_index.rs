//! Range lookups over a sorted slice sequence.
//!
//! Slices handed to [`query`] are sorted by `start` and never overlap, so both
//! `start` and `end` increase along the sequence. That makes both bounds of a
//! range lookup monotonic predicates, found by binary search. Sequences built
//! from trace data go through [`make_disjoint`] first: a lost `sched_switch`
//! can leave one thread running on two CPUs at once.
//!
//! The result is a borrowed sub-slice: lazy, and restartable as often as the
//! caller likes.

use crate::trace_data::Slice;

/// Every slice intersecting `[start, end)`, in ascending start order.
///
/// Expects `slices` sorted by `start` with no two slices overlapping.
/// A slice matches when `slice.start < end && slice.end > start`; with
/// `start == end` this is a point lookup. An empty input yields nothing.
#[must_use]
pub fn query(slices: &[Slice], start: i64, end: i64) -> &[Slice] {
    debug_assert!(is_sorted_disjoint(slices), "slices must be sorted and non-overlapping");

    let begin = slices.partition_point(|s| s.end <= start);
    let finish = slices.partition_point(|s| s.start < end);
    if begin >= finish {
        return &[];
    }
    &slices[begin..finish]
}

/// Reference implementation of [`query`] using two linear scans.
///
/// Kept for equivalence testing; results are identical to [`query`].
#[must_use]
pub fn query_linear(slices: &[Slice], start: i64, end: i64) -> &[Slice] {
    let first_where = |pred: &dyn Fn(&Slice) -> bool| {
        slices.iter().position(|s| pred(s)).unwrap_or(slices.len())
    };
    let begin = first_where(&|s| start < s.end);
    let finish = first_where(&|s| end <= s.start);
    if begin >= finish {
        return &[];
    }
    &slices[begin..finish]
}

/// Sort `slices` by start (stable) and clip each slice's end to the next
/// slice's start, so the sequence satisfies [`query`]'s precondition.
///
/// A slice ending before it starts is clipped to zero length. Returns the
/// number of slices that were shortened.
pub fn make_disjoint(slices: &mut [Slice]) -> usize {
    slices.sort_by_key(|s| s.start);

    let mut clipped = 0;
    let mut next_start = i64::MAX;
    for slice in slices.iter_mut().rev() {
        let end = slice.end.clamp(slice.start, next_start.max(slice.start));
        if end != slice.end {
            slice.end = end;
            clipped += 1;
        }
        next_start = slice.start;
    }
    clipped
}

/// True when `slices` is sorted by start and no two slices overlap
#[must_use]
pub fn is_sorted_disjoint(slices: &[Slice]) -> bool {
    slices.windows(2).all(|w| w[0].start <= w[1].start && w[0].end <= w[1].start)
}
