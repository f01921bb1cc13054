//! Trace data models
//!
//! This module contains the decoded trace (packets of per-CPU `sched_switch`
//! bundles plus the process tree) and the slice/query types served to the UI.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use crate::domain::{CpuId, Pid, SliceId, ThreadKey, Tid, TraceError};

// =============================================================================
// SLICES AND QUERIES
// =============================================================================

/// A named half-open interval `[start, end)` on the trace clock (ns)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slice {
    pub id: SliceId,
    pub start: i64,
    pub end: i64,
    pub title: String,
    /// Styling hint (CSS color string)
    pub color: Option<String>,
}

impl Slice {
    /// Length of the slice in nanoseconds
    #[must_use]
    pub fn duration(&self) -> i64 {
        self.end.saturating_sub(self.start)
    }

    /// True when the slice intersects `[start, end)`
    #[must_use]
    pub fn intersects(&self, start: i64, end: i64) -> bool {
        self.start < end && self.end > start
    }
}

/// Range request from the UI: slices of one thread within `[start, end)`.
///
/// Both `process` and `thread` are required; a query missing either yields
/// nothing. Equality is exact on all four fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TraceDataQuery {
    pub start: i64,
    pub end: i64,
    pub process: Option<Pid>,
    pub thread: Option<Tid>,
}

impl TraceDataQuery {
    /// Query for one thread
    #[must_use]
    pub fn for_thread(key: ThreadKey, start: i64, end: i64) -> Self {
        Self { start, end, process: Some(key.process), thread: Some(key.thread) }
    }

    /// The cache key, if the query names both process and thread
    #[must_use]
    pub fn key(&self) -> Option<ThreadKey> {
        match (self.process, self.thread) {
            (Some(process), Some(thread)) => Some(ThreadKey::new(process, thread)),
            _ => None,
        }
    }

    #[must_use]
    pub fn duration(&self) -> i64 {
        self.end.saturating_sub(self.start)
    }
}

// =============================================================================
// DECODED TRACE
// =============================================================================

/// A decoded trace: an ordered sequence of packets
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Trace {
    #[serde(default)]
    pub packets: Vec<TracePacket>,
}

/// One trace packet. Packets we do not understand decode to an empty packet.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TracePacket {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ftrace_events: Option<FtraceEventBundle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_tree: Option<ProcessTree>,
}

/// Ftrace events recorded on a single CPU
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FtraceEventBundle {
    pub cpu: u32,
    #[serde(default, alias = "event")]
    pub events: Vec<FtraceEvent>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FtraceEvent {
    pub timestamp: i64,
    #[serde(default)]
    pub pid: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sched_switch: Option<SchedSwitch>,
}

/// `sched_switch` tracepoint payload
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedSwitch {
    #[serde(default)]
    pub prev_pid: u32,
    #[serde(default)]
    pub prev_comm: String,
    pub next_pid: u32,
    #[serde(default)]
    pub next_comm: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessTree {
    #[serde(default)]
    pub processes: Vec<ProcessInfo>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub pid: u32,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub threads: Vec<u32>,
}

/// Flattened context-switch event for one CPU
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedSwitchEvent {
    pub timestamp: i64,
    pub cpu: CpuId,
    pub next_pid: Tid,
    pub next_comm: String,
}

impl Trace {
    /// Parse a JSON-encoded trace file
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or is not a valid trace
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, TraceError> {
        let content = std::fs::read(path)?;
        Self::from_slice(&content)
    }

    /// Decode a JSON-encoded trace from memory
    ///
    /// # Errors
    /// Returns an error if the bytes are not a valid trace
    pub fn from_slice(bytes: &[u8]) -> Result<Self, TraceError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn packets(&self) -> impl Iterator<Item = &TracePacket> {
        self.packets.iter()
    }

    /// CPUs that recorded at least one ftrace bundle, ascending
    #[must_use]
    pub fn cpus(&self) -> Vec<CpuId> {
        let cpus: BTreeSet<u32> =
            self.packets().filter_map(|p| p.ftrace_events.as_ref()).map(|b| b.cpu).collect();
        cpus.into_iter().map(CpuId).collect()
    }

    /// Context switches recorded on `cpu`, ordered by timestamp
    ///
    /// Bundles for the same CPU are concatenated in packet order and then
    /// stably sorted, so equal timestamps keep their recording order.
    #[must_use]
    pub fn sched_switches(&self, cpu: CpuId) -> Vec<SchedSwitchEvent> {
        let mut events: Vec<SchedSwitchEvent> = self
            .packets()
            .filter_map(|p| p.ftrace_events.as_ref())
            .filter(|bundle| bundle.cpu == cpu.0)
            .flat_map(|bundle| bundle.events.iter())
            .filter_map(|event| {
                let switch = event.sched_switch.as_ref()?;
                Some(SchedSwitchEvent {
                    timestamp: event.timestamp,
                    cpu,
                    next_pid: Tid(switch.next_pid),
                    next_comm: switch.next_comm.clone(),
                })
            })
            .collect();
        events.sort_by_key(|e| e.timestamp);
        events
    }

    /// Earliest and latest ftrace timestamps, if any event exists
    #[must_use]
    pub fn bounds(&self) -> Option<(i64, i64)> {
        self.packets()
            .filter_map(|p| p.ftrace_events.as_ref())
            .flat_map(|bundle| bundle.events.iter())
            .fold(None, |acc, event| match acc {
                None => Some((event.timestamp, event.timestamp)),
                Some((lo, hi)) => Some((lo.min(event.timestamp), hi.max(event.timestamp))),
            })
    }

    /// Owning process of every thread listed in the process tree
    #[must_use]
    pub fn thread_owners(&self) -> HashMap<Tid, Pid> {
        let mut owners = HashMap::new();
        for process in self.packets().filter_map(|p| p.process_tree.as_ref()) {
            for info in &process.processes {
                // A process's main thread shares its id
                owners.insert(Tid(info.pid), Pid(info.pid));
                for &tid in &info.threads {
                    owners.insert(Tid(tid), Pid(info.pid));
                }
            }
        }
        owners
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_trace() -> Trace {
        let json = r#"{
            "packets": [
                {"processTree": {"processes": [{"pid": 10, "name": "app", "threads": [11]}]}},
                {"ftraceEvents": {"cpu": 1, "event": [
                    {"timestamp": 300, "schedSwitch": {"nextPid": 0, "nextComm": "swapper/1"}},
                    {"timestamp": 100, "schedSwitch": {"nextPid": 11, "nextComm": "worker"}}
                ]}},
                {"ftraceEvents": {"cpu": 0, "events": [
                    {"timestamp": 50, "pid": 3}
                ]}}
            ]
        }"#;
        Trace::from_slice(json.as_bytes()).unwrap()
    }

    #[test]
    fn test_query_key_requires_process_and_thread() {
        let q = TraceDataQuery { start: 0, end: 10, process: Some(Pid(1)), thread: None };
        assert!(q.key().is_none());

        let q = TraceDataQuery::for_thread(ThreadKey::new(Pid(1), Tid(2)), 0, 10);
        assert_eq!(q.key(), Some(ThreadKey::new(Pid(1), Tid(2))));
        assert_eq!(q.duration(), 10);
    }

    #[test]
    fn test_slice_intersection_is_half_open() {
        let slice =
            Slice { id: SliceId(0), start: 10, end: 20, title: String::new(), color: None };
        assert!(slice.intersects(0, 11));
        assert!(!slice.intersects(0, 10));
        assert!(!slice.intersects(20, 30));
        assert!(slice.intersects(19, 30));
        assert_eq!(slice.duration(), 10);
    }

    #[test]
    fn test_sched_switches_sorted_per_cpu() {
        let trace = sample_trace();
        let events = trace.sched_switches(CpuId(1));

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].timestamp, 100);
        assert_eq!(events[0].next_pid, Tid(11));
        assert_eq!(events[1].next_comm, "swapper/1");
        assert!(trace.sched_switches(CpuId(0)).is_empty());
    }

    #[test]
    fn test_cpus_and_bounds() {
        let trace = sample_trace();
        assert_eq!(trace.cpus(), vec![CpuId(0), CpuId(1)]);
        assert_eq!(trace.bounds(), Some((50, 300)));
        assert_eq!(Trace::default().bounds(), None);
    }

    #[test]
    fn test_thread_owners_from_process_tree() {
        let owners = sample_trace().thread_owners();
        assert_eq!(owners.get(&Tid(11)), Some(&Pid(10)));
        assert_eq!(owners.get(&Tid(10)), Some(&Pid(10)));
        assert_eq!(owners.get(&Tid(99)), None);
    }

    #[test]
    fn test_unknown_packets_are_ignored() {
        let trace = Trace::from_slice(br#"{"packets": [{"clockSnapshot": {}}]}"#).unwrap();
        assert_eq!(trace.packets().count(), 1);
        assert!(trace.cpus().is_empty());
    }
}
