//! # Shared Wire Schema (UI side ↔ Query Engine)
//!
//! Defines the messages exchanged over the RPC bridge between the caller side
//! (the UI/cache) and the remote query engine. Both sides depend on this crate,
//! so a schema change is a single edit and a `PROTOCOL_VERSION` bump.
//!
//! ## Message Flow
//!
//! ```text
//!   caller                                   engine
//!     │                                        │
//!     │ ◄──────────── Ready(Handshake) ─────── │  once, before any reply
//!     │ ── RpcCall { requestId, name, args } ─►│
//!     │ ◄─ RpcReply { requestId, result } ──── │  any order
//! ```
//!
//! ## Key Types
//!
//! - [`RpcCall`] / [`RpcReply`] - request/response envelopes correlated by `requestId`
//! - [`FromRemote`] - everything the engine side may post back
//! - [`EngineRequest`] / [`EngineResponse`] - the closed set of engine calls
//! - [`Query`] - typed queries understood by the engine
//! - [`QueryResult`] - columnar result set with per-column typed cells

use serde::{Deserialize, Serialize};

/// Version of the message schema in this crate.
///
/// Sent by the engine in its [`Handshake`]; the caller refuses to talk to an
/// engine that reports a different version.
pub const PROTOCOL_VERSION: u32 = 1;

// ============================================================================
// RPC Envelopes
// ============================================================================

/// A call posted by the caller side.
///
/// Serialized flat, e.g. `{"requestId":7,"name":"query","args":{...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcCall<Req> {
    /// Correlation token, unique among the caller's outstanding calls
    pub request_id: u32,

    /// Method name and arguments (adjacently tagged `name` / `args`)
    #[serde(flatten)]
    pub request: Req,
}

/// The reply to a single [`RpcCall`], carrying the same `request_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcReply<Resp> {
    pub request_id: u32,
    pub result: Resp,
}

/// Initialization acknowledgment sent by the remote side before any reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    pub protocol_version: u32,
    /// Free-form engine identification for logs
    pub engine: String,
}

/// Messages posted by the remote side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FromRemote<Resp> {
    Ready(Handshake),
    Reply(RpcReply<Resp>),
}

// ============================================================================
// Engine Calls
// ============================================================================

/// Methods of the query engine capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", content = "args", rename_all = "snake_case")]
pub enum EngineRequest {
    /// Load an encoded trace (JSON) into the engine. Valid once per engine.
    LoadTrace { trace: Vec<u8> },

    /// Run a query against the loaded trace.
    Query(Query),
}

/// Typed queries over a loaded trace.
///
/// Time bounds are nanoseconds on the trace clock; `[start, end)` ranges select
/// every slice intersecting them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Query {
    /// Scheduling slices of one thread. Columns: `id, ts, dur, name, color`.
    ThreadSlices { process: u32, thread: u32, start: i64, end: i64 },

    /// Scheduling slices of one CPU. Columns: `id, ts, dur, name, color`.
    CpuSlices { cpu: u32, start: i64, end: i64 },

    /// Busy time across all CPUs in fixed-width buckets. Columns: `bucket_ts, busy_ns`.
    CpuUtilization { bucket_width_ns: i64 },

    /// Every thread seen in the trace. Columns: `pid, tid, name`.
    Threads,
}

/// Replies of the query engine capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineResponse {
    Loaded(TraceSummary),
    Rows(QueryResult),
    /// The engine could not serve the call
    Error(String),
}

/// Overview of a loaded trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceSummary {
    /// Earliest event timestamp (ns)
    pub start: i64,
    /// Latest event timestamp (ns)
    pub end: i64,
    pub cpu_count: u32,
    pub thread_count: u32,
    pub slice_count: u64,
}

// ============================================================================
// Columnar Result Set
// ============================================================================

/// Column-oriented query result.
///
/// Every column holds the same number of cells; a `None` cell is SQL `NULL`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub columns: Vec<Column>,
}

/// A named column of typed cells.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub values: ColumnValues,
}

/// Cells of one column, all of the same type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "cells", rename_all = "snake_case")]
pub enum ColumnValues {
    Long(Vec<Option<i64>>),
    Double(Vec<Option<f64>>),
    Str(Vec<Option<String>>),
}

impl ColumnValues {
    /// Number of cells in the column
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Long(v) => v.len(),
            Self::Double(v) => v.len(),
            Self::Str(v) => v.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Human-readable cell type, used in decode errors
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Long(_) => "long",
            Self::Double(_) => "double",
            Self::Str(_) => "string",
        }
    }
}

impl QueryResult {
    /// Create an empty result set
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a column (builder style)
    #[must_use]
    pub fn with_column(mut self, name: impl Into<String>, values: ColumnValues) -> Self {
        self.columns.push(Column { name: name.into(), values });
        self
    }

    /// Look up a column by name
    #[must_use]
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Number of rows (0 for a result without columns)
    #[must_use]
    pub fn row_count(&self) -> usize {
        self.columns.first().map_or(0, |c| c.values.len())
    }

    /// True when every column holds the same number of cells
    #[must_use]
    pub fn is_rectangular(&self) -> bool {
        let rows = self.row_count();
        self.columns.iter().all(|c| c.values.len() == rows)
    }
}
