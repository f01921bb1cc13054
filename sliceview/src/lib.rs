//! # sliceview - Trace Data Access Layer
//!
//! sliceview serves scheduling slices of a `sched_switch` trace to an
//! interactive caller (a timeline UI, or the bundled CLI). The caller asks for
//! "slices of thread T within [start, end)" once per frame; the answer comes
//! synchronously from an in-memory cache that refreshes itself from a query
//! engine living in another execution context.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                  Caller (render loop / CLI)                     │
//! └───────────────┬──────────────────────────────▲──────────────────┘
//!                 │ get_data(query)              │ generation changed
//!                 ▼                              │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  TraceDataCache          per-thread windows, widen + dedup      │
//! │        │                          ▲                             │
//! │        │ fetch_slices             │ completions (crossbeam)     │
//! │        ▼                          │                             │
//! │  QueryEngineClient       UNINITIALIZED → LOADING → READY        │
//! │        │                                                        │
//! │  RpcChannel              request ids, pending resolvers         │
//! └────────┬──────────────────────────▲─────────────────────────────┘
//!          │ RpcCall {requestId,..}   │ Ready / RpcReply {requestId,..}
//!          ▼                          │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  serve(TraceProcessor)   tokio task, or `sliceview --serve`     │
//! │                          behind JSON lines on stdin/stdout      │
//! │        │                                                        │
//! │        ▼                                                        │
//! │  Analysis: sched_switch → slices → interval index / buckets     │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Structure
//!
//! - [`cache`]: [`TraceDataCache`](cache::TraceDataCache), the synchronous
//!   front door
//! - [`engine`]: the query engine capability and its client
//! - [`rpc`]: transports, the caller-side channel and the serving loop
//! - [`analysis`]: interval index and busy-time bucketing
//! - [`trace_data`]: decoded trace model, `Slice` and `TraceDataQuery`
//! - [`export`]: Chrome Trace Event Format JSON (Perfetto, `chrome://tracing`)
//! - [`domain`]: newtype ids and error types
//! - [`cli`] / [`config`]: command-line arguments and settings
//!
//! The wire schema shared by both sides of the bridge lives in the
//! `sliceview-common` crate.

pub mod analysis;
pub mod cache;
pub mod cli;
pub mod config;
pub mod domain;
pub mod engine;
pub mod export;
pub mod rpc;
pub mod trace_data;
