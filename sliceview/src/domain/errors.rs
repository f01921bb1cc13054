//! Structured error types for sliceview
//!
//! Using thiserror for automatic Display implementation and error chaining.

use crate::engine::EngineState;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TraceError {
    #[error("Failed to read trace file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to decode trace: {0}")]
    Decode(#[from] serde_json::Error),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AnalysisError {
    #[error("Bucket width must be positive, got {0}ns")]
    InvalidBucketWidth(i64),

    #[error("Invalid time range [{start}, {end})")]
    InvalidRange { start: i64, end: i64 },

    #[error("Bucket width {width}ns yields more than {max} buckets")]
    TooManyBuckets { width: i64, max: usize },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RpcError {
    #[error("RPC peer disconnected")]
    Disconnected,

    #[error("Reply for unknown request id {0}")]
    UnknownRequest(u32),

    #[error("Protocol version mismatch: expected {expected}, peer speaks {found}")]
    ProtocolMismatch { expected: u32, found: u32 },
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("Query engine is not ready (state: {0})")]
    NotReady(EngineState),

    #[error("A trace is already loaded or loading (state: {0})")]
    AlreadyLoaded(EngineState),

    #[error("Query engine reported an error: {0}")]
    Remote(String),

    #[error("Unexpected engine response: expected {expected}")]
    UnexpectedResponse { expected: &'static str },

    #[error("Result set is missing column {0:?}")]
    MissingColumn(&'static str),

    #[error("Column {column:?} has type {found}, expected {expected}")]
    ColumnType { column: &'static str, expected: &'static str, found: &'static str },

    #[error("Result set columns have different lengths")]
    RaggedResult,

    #[error("NULL cell in non-nullable column {column:?} at row {row}")]
    NullCell { column: &'static str, row: usize },

    #[error("Negative duration {dur} at row {row}")]
    NegativeDuration { dur: i64, row: usize },

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error(transparent)]
    Analysis(#[from] AnalysisError),
}
