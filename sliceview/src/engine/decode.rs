//! Columnar result decoding
//!
//! Turns the engine's [`QueryResult`] columns back into typed rows. Every
//! decoder checks the result is rectangular and that each column it reads is
//! present with the expected cell type.

use sliceview_common::{ColumnValues, QueryResult};

use crate::domain::{EngineError, Pid, SliceId, ThreadKey, Tid};
use crate::trace_data::Slice;

/// One bucket of the CPU utilization histogram
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UtilizationBucket {
    /// Bucket start timestamp (ns)
    pub start: i64,
    /// Busy nanoseconds summed over all CPUs
    pub busy_ns: u64,
}

/// A thread seen in the trace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadInfo {
    pub key: ThreadKey,
    pub name: String,
}

fn column<'a>(result: &'a QueryResult, name: &'static str) -> Result<&'a ColumnValues, EngineError> {
    result.column(name).map(|c| &c.values).ok_or(EngineError::MissingColumn(name))
}

fn longs<'a>(result: &'a QueryResult, name: &'static str) -> Result<&'a [Option<i64>], EngineError> {
    match column(result, name)? {
        ColumnValues::Long(cells) => Ok(cells),
        other => Err(EngineError::ColumnType { column: name, expected: "long", found: other.type_name() }),
    }
}

fn strings<'a>(
    result: &'a QueryResult,
    name: &'static str,
) -> Result<&'a [Option<String>], EngineError> {
    match column(result, name)? {
        ColumnValues::Str(cells) => Ok(cells),
        other => Err(EngineError::ColumnType { column: name, expected: "string", found: other.type_name() }),
    }
}

fn required<T: Clone>(cells: &[Option<T>], column: &'static str, row: usize) -> Result<T, EngineError> {
    cells.get(row).cloned().flatten().ok_or(EngineError::NullCell { column, row })
}

fn in_range<T: TryFrom<i64>>(value: i64, column: &'static str) -> Result<T, EngineError> {
    T::try_from(value).map_err(|_| EngineError::ColumnType {
        column,
        expected: "in-range integer",
        found: "out-of-range long",
    })
}

fn rectangular(result: &QueryResult) -> Result<usize, EngineError> {
    if result.is_rectangular() {
        Ok(result.row_count())
    } else {
        Err(EngineError::RaggedResult)
    }
}

/// Decode `id, ts, dur, name, color` rows. `color` may be NULL.
///
/// # Errors
/// Returns a decode error if a column is missing, mistyped or NULL where a
/// value is required, if a duration is negative, or if columns differ in
/// length
pub fn decode_slices(result: &QueryResult) -> Result<Vec<Slice>, EngineError> {
    let rows = rectangular(result)?;
    let ids = longs(result, "id")?;
    let ts = longs(result, "ts")?;
    let dur = longs(result, "dur")?;
    let names = strings(result, "name")?;
    let colors = strings(result, "color")?;

    (0..rows)
        .map(|row| {
            let start = required(ts, "ts", row)?;
            let length = required(dur, "dur", row)?;
            if length < 0 {
                return Err(EngineError::NegativeDuration { dur: length, row });
            }
            Ok(Slice {
                id: SliceId(in_range(required(ids, "id", row)?, "id")?),
                start,
                end: start.saturating_add(length),
                title: required(names, "name", row)?,
                color: colors.get(row).cloned().flatten(),
            })
        })
        .collect()
}

/// Decode `bucket_ts, busy_ns` rows
///
/// # Errors
/// Returns a decode error for a malformed result set
pub fn decode_buckets(result: &QueryResult) -> Result<Vec<UtilizationBucket>, EngineError> {
    let rows = rectangular(result)?;
    let starts = longs(result, "bucket_ts")?;
    let busy = longs(result, "busy_ns")?;

    (0..rows)
        .map(|row| {
            Ok(UtilizationBucket {
                start: required(starts, "bucket_ts", row)?,
                busy_ns: in_range(required(busy, "busy_ns", row)?, "busy_ns")?,
            })
        })
        .collect()
}

/// Decode `pid, tid, name` rows. A NULL name decodes as empty.
///
/// # Errors
/// Returns a decode error for a malformed result set
pub fn decode_threads(result: &QueryResult) -> Result<Vec<ThreadInfo>, EngineError> {
    let rows = rectangular(result)?;
    let pids = longs(result, "pid")?;
    let tids = longs(result, "tid")?;
    let names = strings(result, "name")?;

    (0..rows)
        .map(|row| {
            let process = Pid(in_range(required(pids, "pid", row)?, "pid")?);
            let thread = Tid(in_range(required(tids, "tid", row)?, "tid")?);
            Ok(ThreadInfo {
                key: ThreadKey::new(process, thread),
                name: names.get(row).cloned().flatten().unwrap_or_default(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slice_result() -> QueryResult {
        QueryResult::new()
            .with_column("id", ColumnValues::Long(vec![Some(4), Some(5)]))
            .with_column("ts", ColumnValues::Long(vec![Some(100), Some(200)]))
            .with_column("dur", ColumnValues::Long(vec![Some(10), Some(0)]))
            .with_column("name", ColumnValues::Str(vec![Some("a".into()), Some("b".into())]))
            .with_column("color", ColumnValues::Str(vec![None, Some("red".into())]))
    }

    #[test]
    fn test_decode_slices() {
        let slices = decode_slices(&slice_result()).unwrap();
        assert_eq!(slices.len(), 2);
        assert_eq!((slices[0].id, slices[0].start, slices[0].end), (SliceId(4), 100, 110));
        assert_eq!(slices[0].color, None);
        assert_eq!(slices[1].color.as_deref(), Some("red"));
        assert_eq!(slices[1].duration(), 0);
    }

    #[test]
    fn test_missing_column() {
        let result = QueryResult::new().with_column("id", ColumnValues::Long(vec![]));
        assert_eq!(decode_slices(&result), Err(EngineError::MissingColumn("ts")));
    }

    #[test]
    fn test_wrong_column_type() {
        let mut result = slice_result();
        result.columns[1].values = ColumnValues::Double(vec![Some(1.0), Some(2.0)]);
        assert_eq!(
            decode_slices(&result),
            Err(EngineError::ColumnType { column: "ts", expected: "long", found: "double" })
        );
    }

    #[test]
    fn test_null_in_required_column() {
        let mut result = slice_result();
        result.columns[3].values = ColumnValues::Str(vec![Some("a".into()), None]);
        assert_eq!(decode_slices(&result), Err(EngineError::NullCell { column: "name", row: 1 }));
    }

    #[test]
    fn test_negative_duration_rejected() {
        let mut result = slice_result();
        result.columns[2].values = ColumnValues::Long(vec![Some(10), Some(-5)]);
        assert_eq!(
            decode_slices(&result),
            Err(EngineError::NegativeDuration { dur: -5, row: 1 })
        );
    }

    #[test]
    fn test_ragged_result() {
        let mut result = slice_result();
        result.columns[0].values = ColumnValues::Long(vec![Some(1)]);
        assert_eq!(decode_slices(&result), Err(EngineError::RaggedResult));
    }

    #[test]
    fn test_negative_busy_time_rejected() {
        let result = QueryResult::new()
            .with_column("bucket_ts", ColumnValues::Long(vec![Some(0)]))
            .with_column("busy_ns", ColumnValues::Long(vec![Some(-1)]));
        assert!(matches!(
            decode_buckets(&result),
            Err(EngineError::ColumnType { column: "busy_ns", .. })
        ));
    }

    #[test]
    fn test_decode_threads() {
        let result = QueryResult::new()
            .with_column("pid", ColumnValues::Long(vec![Some(10)]))
            .with_column("tid", ColumnValues::Long(vec![Some(11)]))
            .with_column("name", ColumnValues::Str(vec![None]));
        let threads = decode_threads(&result).unwrap();
        assert_eq!(threads[0].key, ThreadKey::new(Pid(10), Tid(11)));
        assert_eq!(threads[0].name, "");
    }
}
