//! Caller-side facade over the query engine
//!
//! Tracks the engine lifecycle and refuses queries until a trace is loaded:
//!
//! ```text
//!   UNINITIALIZED ──load()──► LOADING ──Loaded──► READY
//!                                │
//!                                └──error──► FAILED
//! ```

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{error, info};
use sliceview_common::{
    EngineRequest, EngineResponse, FromRemote, Query, QueryResult, RpcCall, TraceSummary,
};

use super::decode::{self, ThreadInfo, UtilizationBucket};
use crate::cache::{FetchFuture, SliceSource};
use crate::domain::{AnalysisError, CpuId, EngineError, ThreadKey};
use crate::rpc::{Endpoint, RpcChannel};
use crate::trace_data::Slice;

/// RPC channel speaking the engine protocol
pub type EngineChannel = RpcChannel<EngineRequest, EngineResponse>;

/// Lifecycle of the remote engine as seen by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Uninitialized,
    Loading,
    Ready,
    Failed,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Uninitialized => "UNINITIALIZED",
            Self::Loading => "LOADING",
            Self::Ready => "READY",
            Self::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
struct ClientState {
    state: EngineState,
    summary: Option<TraceSummary>,
}

/// Handle to a remote query engine.
///
/// Clones share the channel and the lifecycle state.
#[derive(Clone)]
pub struct QueryEngineClient {
    channel: EngineChannel,
    inner: Arc<Mutex<ClientState>>,
}

impl QueryEngineClient {
    /// Client over an existing channel
    #[must_use]
    pub fn new(channel: EngineChannel) -> Self {
        Self {
            channel,
            inner: Arc::new(Mutex::new(ClientState {
                state: EngineState::Uninitialized,
                summary: None,
            })),
        }
    }

    /// Client over `endpoint`, spawning the channel's receive loop
    ///
    /// # Panics
    /// Panics if called outside a tokio runtime
    #[must_use]
    pub fn connect(endpoint: Endpoint<RpcCall<EngineRequest>, FromRemote<EngineResponse>>) -> Self {
        Self::new(RpcChannel::connect(endpoint))
    }

    fn lock(&self) -> MutexGuard<'_, ClientState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn state(&self) -> EngineState {
        self.lock().state
    }

    /// Summary of the loaded trace, once READY
    #[must_use]
    pub fn summary(&self) -> Option<TraceSummary> {
        self.lock().summary
    }

    #[must_use]
    pub fn channel(&self) -> &EngineChannel {
        &self.channel
    }

    /// Wait for the engine handshake, then load `trace` into it.
    ///
    /// # Errors
    /// - `EngineError::AlreadyLoaded` while loading or once loaded
    /// - `EngineError::Rpc` on disconnect or protocol version mismatch
    /// - `EngineError::Remote` if the engine rejects the trace
    pub async fn load(&self, trace: Vec<u8>) -> Result<TraceSummary, EngineError> {
        {
            let mut inner = self.lock();
            // A failed load may be retried
            if !matches!(inner.state, EngineState::Uninitialized | EngineState::Failed) {
                return Err(EngineError::AlreadyLoaded(inner.state));
            }
            inner.state = EngineState::Loading;
        }

        info!("Loading trace ({} bytes)", trace.len());
        let outcome = self.load_remote(trace).await;

        let mut inner = self.lock();
        match &outcome {
            Ok(summary) => {
                inner.state = EngineState::Ready;
                inner.summary = Some(*summary);
            }
            Err(e) => {
                error!("Trace load failed: {e}");
                inner.state = EngineState::Failed;
            }
        }
        outcome
    }

    async fn load_remote(&self, trace: Vec<u8>) -> Result<TraceSummary, EngineError> {
        let handshake = self.channel.ready().await?;
        info!("Engine ready: {}", handshake.engine);

        match self.channel.request(EngineRequest::LoadTrace { trace }).await? {
            EngineResponse::Loaded(summary) => Ok(summary),
            EngineResponse::Error(message) => Err(EngineError::Remote(message)),
            EngineResponse::Rows(_) => Err(EngineError::UnexpectedResponse { expected: "loaded" }),
        }
    }

    /// Run one query against the loaded trace.
    ///
    /// # Errors
    /// - `EngineError::NotReady` unless the engine is READY
    /// - `EngineError::Remote` if the engine fails the query
    /// - `EngineError::Rpc` if the link drops
    pub async fn query(&self, query: Query) -> Result<QueryResult, EngineError> {
        let state = self.state();
        if state != EngineState::Ready {
            error!("Query issued while engine is {state}: {query:?}");
            return Err(EngineError::NotReady(state));
        }

        match self.channel.request(EngineRequest::Query(query)).await? {
            EngineResponse::Rows(rows) => Ok(rows),
            EngineResponse::Error(message) => Err(EngineError::Remote(message)),
            EngineResponse::Loaded(_) => Err(EngineError::UnexpectedResponse { expected: "rows" }),
        }
    }

    /// Slices of one thread intersecting `[start, end)`
    ///
    /// # Errors
    /// Returns an error if the query fails or its result cannot be decoded
    pub async fn thread_slices(
        &self,
        key: ThreadKey,
        start: i64,
        end: i64,
    ) -> Result<Vec<Slice>, EngineError> {
        let result = self
            .query(Query::ThreadSlices { process: key.process.0, thread: key.thread.0, start, end })
            .await?;
        decode::decode_slices(&result)
    }

    /// Slices of one CPU intersecting `[start, end)`
    ///
    /// # Errors
    /// Returns an error if the query fails or its result cannot be decoded
    pub async fn cpu_slices(
        &self,
        cpu: CpuId,
        start: i64,
        end: i64,
    ) -> Result<Vec<Slice>, EngineError> {
        let result = self.query(Query::CpuSlices { cpu: cpu.0, start, end }).await?;
        decode::decode_slices(&result)
    }

    /// Busy-time histogram over the whole trace
    ///
    /// # Errors
    /// Returns `EngineError::Analysis` for a non-positive width without
    /// contacting the engine, or an error if the query fails or its result
    /// cannot be decoded
    pub async fn cpu_utilization(
        &self,
        bucket_width_ns: i64,
    ) -> Result<Vec<UtilizationBucket>, EngineError> {
        if bucket_width_ns <= 0 {
            return Err(AnalysisError::InvalidBucketWidth(bucket_width_ns).into());
        }
        let result = self.query(Query::CpuUtilization { bucket_width_ns }).await?;
        decode::decode_buckets(&result)
    }

    /// Every thread with at least one slice
    ///
    /// # Errors
    /// Returns an error if the query fails or its result cannot be decoded
    pub async fn threads(&self) -> Result<Vec<ThreadInfo>, EngineError> {
        let result = self.query(Query::Threads).await?;
        decode::decode_threads(&result)
    }
}

impl SliceSource for QueryEngineClient {
    fn fetch_slices(&self, key: ThreadKey, start: i64, end: i64) -> FetchFuture {
        let client = self.clone();
        Box::pin(async move { client.thread_slices(key, start, end).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Pid, Tid};
    use crate::engine::TraceProcessor;
    use crate::rpc::spawn_in_memory;

    const TRACE: &str = r#"{"packets": [{"ftraceEvents": {"cpu": 0, "event": [
        {"timestamp": 0,  "schedSwitch": {"nextPid": 5, "nextComm": "task"}},
        {"timestamp": 40, "schedSwitch": {"nextPid": 0, "nextComm": "swapper/0"}}
    ]}}]}"#;

    fn client() -> QueryEngineClient {
        QueryEngineClient::connect(spawn_in_memory(TraceProcessor::new()))
    }

    #[test]
    fn test_state_display() {
        assert_eq!(EngineState::Uninitialized.to_string(), "UNINITIALIZED");
        assert_eq!(EngineState::Ready.to_string(), "READY");
        assert_eq!(EngineState::Failed.to_string(), "FAILED");
    }

    #[tokio::test]
    async fn test_query_before_load_rejected_locally() {
        let client = client();
        let err = client.query(Query::Threads).await.unwrap_err();
        assert_eq!(err, EngineError::NotReady(EngineState::Uninitialized));
        assert_eq!(client.channel().pending_count(), 0);
    }

    #[tokio::test]
    async fn test_load_then_query() {
        let client = client();
        let summary = client.load(TRACE.as_bytes().to_vec()).await.unwrap();
        assert_eq!(summary.slice_count, 1);
        assert_eq!(client.state(), EngineState::Ready);
        assert_eq!(client.summary(), Some(summary));

        let key = ThreadKey::new(Pid(5), Tid(5));
        let slices = client.thread_slices(key, 0, 100).await.unwrap();
        assert_eq!(slices.len(), 1);
        assert_eq!((slices[0].start, slices[0].end), (0, 40));
        assert_eq!(slices[0].title, "task");
    }

    #[tokio::test]
    async fn test_invalid_bucket_width_rejected_locally() {
        let client = client();
        client.load(TRACE.as_bytes().to_vec()).await.unwrap();

        let err = client.cpu_utilization(0).await.unwrap_err();
        assert_eq!(err, EngineError::Analysis(AnalysisError::InvalidBucketWidth(0)));
        assert_eq!(client.channel().pending_count(), 0);

        let buckets = client.cpu_utilization(i64::MAX).await.unwrap();
        assert_eq!(buckets.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_load_blocks_queries() {
        let client = client();
        let err = client.load(b"garbage".to_vec()).await.unwrap_err();
        assert!(matches!(err, EngineError::Remote(_)));
        assert_eq!(client.state(), EngineState::Failed);
        assert_eq!(
            client.query(Query::Threads).await.unwrap_err(),
            EngineError::NotReady(EngineState::Failed)
        );

        client.load(TRACE.as_bytes().to_vec()).await.unwrap();
        assert_eq!(client.state(), EngineState::Ready);
    }

    #[tokio::test]
    async fn test_second_load_rejected_locally() {
        let client = client();
        client.load(TRACE.as_bytes().to_vec()).await.unwrap();
        assert_eq!(
            client.load(TRACE.as_bytes().to_vec()).await.unwrap_err(),
            EngineError::AlreadyLoaded(EngineState::Ready)
        );
    }
}
