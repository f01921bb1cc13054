//! The query engine capability
//!
//! [`TraceProcessor`] owns a decoded trace and answers [`Query`] calls with
//! columnar results. It is served over the RPC bridge and is never called
//! directly by the cache.
//!
//! Loading rebuilds scheduling slices from each CPU's `sched_switch` stream
//! and indexes them twice, per thread and per CPU. Both indexes are sorted by
//! start and made disjoint so range queries use the binary-search interval
//! index. A thread seen running on two CPUs at once (a lost switch event)
//! has its earlier slice clipped at the later one's start; the CPU index is
//! rebuilt from the clipped slices so both views agree.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;

use log::{debug, info, warn};
use sliceview_common::{
    ColumnValues, EngineRequest, EngineResponse, Handshake, Query, QueryResult, TraceSummary,
    PROTOCOL_VERSION,
};

use crate::analysis::{interval_index, slices_from_sched_switches, BucketAggregator};
use crate::domain::{CpuId, Pid, SliceId, ThreadKey, Tid};
use crate::rpc::Capability;
use crate::trace_data::{Slice, Trace};

/// Engine identification reported in the handshake
pub const ENGINE_NAME: &str = concat!("sliceview-engine/", env!("CARGO_PKG_VERSION"));

/// Query engine over a single loaded trace
#[derive(Debug, Default)]
pub struct TraceProcessor {
    loaded: Option<LoadedTrace>,
}

#[derive(Debug)]
struct LoadedTrace {
    summary: TraceSummary,
    by_thread: HashMap<ThreadKey, Vec<Slice>>,
    by_cpu: BTreeMap<CpuId, Vec<Slice>>,
    thread_names: BTreeMap<ThreadKey, String>,
}

impl TraceProcessor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Summary of the loaded trace, if any
    #[must_use]
    pub fn summary(&self) -> Option<TraceSummary> {
        self.loaded.as_ref().map(|t| t.summary)
    }

    /// Answer one request synchronously
    pub fn dispatch(&mut self, request: EngineRequest) -> EngineResponse {
        match request {
            EngineRequest::LoadTrace { trace } => self.load(&trace),
            EngineRequest::Query(query) => match &self.loaded {
                Some(loaded) => loaded.run(&query),
                None => {
                    warn!("Query before any trace was loaded: {query:?}");
                    EngineResponse::Error("no trace loaded".to_string())
                }
            },
        }
    }

    fn load(&mut self, bytes: &[u8]) -> EngineResponse {
        if self.loaded.is_some() {
            return EngineResponse::Error("a trace is already loaded".to_string());
        }
        let trace = match Trace::from_slice(bytes) {
            Ok(trace) => trace,
            Err(e) => {
                warn!("Rejected trace: {e}");
                return EngineResponse::Error(e.to_string());
            }
        };

        let loaded = LoadedTrace::build(&trace);
        info!(
            "Loaded trace: {} slices on {} CPUs, {} threads",
            loaded.summary.slice_count, loaded.summary.cpu_count, loaded.summary.thread_count
        );
        let summary = loaded.summary;
        self.loaded = Some(loaded);
        EngineResponse::Loaded(summary)
    }
}

impl Capability for TraceProcessor {
    type Request = EngineRequest;
    type Response = EngineResponse;

    fn handshake(&self) -> Handshake {
        Handshake { protocol_version: PROTOCOL_VERSION, engine: ENGINE_NAME.to_string() }
    }

    fn handle(&mut self, request: EngineRequest) -> impl Future<Output = EngineResponse> + Send {
        std::future::ready(self.dispatch(request))
    }
}

/// Deterministic per-process color so a process reads the same everywhere
#[must_use]
pub fn process_color(pid: Pid) -> String {
    let hue = (u64::from(pid.0).wrapping_mul(2_654_435_761)) % 360;
    format!("hsl({hue}, 50%, 60%)")
}

impl LoadedTrace {
    fn build(trace: &Trace) -> Self {
        let owners = trace.thread_owners();
        let mut by_thread: HashMap<ThreadKey, Vec<Slice>> = HashMap::new();
        let mut slice_cpu: HashMap<SliceId, CpuId> = HashMap::new();
        let mut thread_names = BTreeMap::new();
        let mut next_id = 0u64;

        let cpus = trace.cpus();
        for &cpu in &cpus {
            let cpu_slices = slices_from_sched_switches(trace.sched_switches(cpu));
            debug!("{cpu}: {} slices", cpu_slices.len());

            let mut slices = Vec::with_capacity(cpu_slices.len());
            let mut keys = HashMap::with_capacity(cpu_slices.len());
            for cpu_slice in cpu_slices {
                let process = owners.get(&cpu_slice.tid).copied().unwrap_or(Pid(cpu_slice.tid.0));
                let key = ThreadKey::new(process, cpu_slice.tid);
                let id = SliceId(next_id);
                next_id += 1;

                thread_names.entry(key).or_insert_with(|| cpu_slice.comm.clone());
                keys.insert(id, key);
                slices.push(Slice {
                    id,
                    start: cpu_slice.start,
                    end: cpu_slice.end,
                    title: cpu_slice.comm,
                    color: Some(process_color(process)),
                });
            }

            // Out-of-order timestamps within one CPU stream
            let clipped = interval_index::make_disjoint(&mut slices);
            if clipped > 0 {
                warn!("{cpu}: clipped {clipped} slices overlapping later switches");
            }
            for slice in slices {
                slice_cpu.insert(slice.id, cpu);
                if let Some(&key) = keys.get(&slice.id) {
                    by_thread.entry(key).or_default().push(slice);
                }
            }
        }

        let mut by_cpu: BTreeMap<CpuId, Vec<Slice>> = BTreeMap::new();
        for (key, slices) in &mut by_thread {
            let clipped = interval_index::make_disjoint(slices);
            if clipped > 0 {
                warn!("{key}: clipped {clipped} slices running on two CPUs at once");
            }
            for slice in slices.iter() {
                if let Some(&cpu) = slice_cpu.get(&slice.id) {
                    by_cpu.entry(cpu).or_default().push(slice.clone());
                }
            }
        }
        for slices in by_cpu.values_mut() {
            slices.sort_by_key(|s| s.start);
        }

        let (start, end) = trace.bounds().unwrap_or((0, 0));
        let summary = TraceSummary {
            start,
            end,
            cpu_count: u32::try_from(cpus.len()).unwrap_or(u32::MAX),
            thread_count: u32::try_from(by_thread.len()).unwrap_or(u32::MAX),
            slice_count: next_id,
        };

        Self { summary, by_thread, by_cpu, thread_names }
    }

    fn run(&self, query: &Query) -> EngineResponse {
        match *query {
            Query::ThreadSlices { process, thread, start, end } => {
                let key = ThreadKey::new(Pid(process), Tid(thread));
                let slices = self.by_thread.get(&key).map_or(&[][..], Vec::as_slice);
                EngineResponse::Rows(slice_rows(interval_index::query(slices, start, end)))
            }
            Query::CpuSlices { cpu, start, end } => {
                let slices = self.by_cpu.get(&CpuId(cpu)).map_or(&[][..], Vec::as_slice);
                EngineResponse::Rows(slice_rows(interval_index::query(slices, start, end)))
            }
            Query::CpuUtilization { bucket_width_ns } => self.utilization(bucket_width_ns),
            Query::Threads => EngineResponse::Rows(self.thread_rows()),
        }
    }

    fn utilization(&self, bucket_width_ns: i64) -> EngineResponse {
        let TraceSummary { start, end, .. } = self.summary;
        let mut aggregator = match BucketAggregator::new(start, end, bucket_width_ns) {
            Ok(aggregator) => aggregator,
            Err(e) => {
                warn!("Rejected utilization query: {e}");
                return EngineResponse::Error(e.to_string());
            }
        };
        for slice in self.by_cpu.values().flatten() {
            aggregator.add(slice.start, slice.end);
        }

        let starts = (0..aggregator.buckets().len()).map(|i| Some(aggregator.bucket_start(i))).collect();
        let busy = aggregator
            .buckets()
            .iter()
            .map(|&ns| Some(i64::try_from(ns).unwrap_or(i64::MAX)))
            .collect();

        EngineResponse::Rows(
            QueryResult::new()
                .with_column("bucket_ts", ColumnValues::Long(starts))
                .with_column("busy_ns", ColumnValues::Long(busy)),
        )
    }

    fn thread_rows(&self) -> QueryResult {
        let mut pids = Vec::with_capacity(self.thread_names.len());
        let mut tids = Vec::with_capacity(self.thread_names.len());
        let mut names = Vec::with_capacity(self.thread_names.len());
        for (key, name) in &self.thread_names {
            pids.push(Some(i64::from(key.process.0)));
            tids.push(Some(i64::from(key.thread.0)));
            names.push(Some(name.clone()));
        }
        QueryResult::new()
            .with_column("pid", ColumnValues::Long(pids))
            .with_column("tid", ColumnValues::Long(tids))
            .with_column("name", ColumnValues::Str(names))
    }
}

/// Slices as `id, ts, dur, name, color` columns
fn slice_rows(slices: &[Slice]) -> QueryResult {
    let mut ids = Vec::with_capacity(slices.len());
    let mut ts = Vec::with_capacity(slices.len());
    let mut dur = Vec::with_capacity(slices.len());
    let mut names = Vec::with_capacity(slices.len());
    let mut colors = Vec::with_capacity(slices.len());
    for slice in slices {
        ids.push(Some(i64::try_from(slice.id.0).unwrap_or(i64::MAX)));
        ts.push(Some(slice.start));
        dur.push(Some(slice.duration()));
        names.push(Some(slice.title.clone()));
        colors.push(slice.color.clone());
    }
    QueryResult::new()
        .with_column("id", ColumnValues::Long(ids))
        .with_column("ts", ColumnValues::Long(ts))
        .with_column("dur", ColumnValues::Long(dur))
        .with_column("name", ColumnValues::Str(names))
        .with_column("color", ColumnValues::Str(colors))
}
