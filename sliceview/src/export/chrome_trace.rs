use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, HashMap};
use std::io::Write;

use crate::domain::ThreadKey;
use crate::trace_data::Slice;

/// Chrome Trace Event format
/// Format reference: https://docs.google.com/document/d/1CvAClvFfyA5R-PhYUmn5OOQtYMH4h6I0nSsKchNAySU/preview
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChromeTraceEvent {
    /// Event name (thread command for scheduling slices)
    name: String,
    /// Category for filtering/coloring
    cat: String,
    /// Phase: "X" = complete, "M" = metadata
    ph: String,
    /// Timestamp in microseconds
    ts: f64,
    /// Duration in microseconds ("X" events only)
    #[serde(skip_serializing_if = "Option::is_none")]
    dur: Option<f64>,
    pid: u32,
    tid: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    args: Option<HashMap<String, JsonValue>>,
}

/// Chrome Trace Format container
#[derive(Debug, Serialize)]
struct ChromeTrace {
    #[serde(rename = "traceEvents")]
    trace_events: Vec<ChromeTraceEvent>,
    #[serde(rename = "displayTimeUnit")]
    display_time_unit: String,
}

#[allow(clippy::cast_precision_loss)]
fn ns_to_us(ns: i64) -> f64 {
    ns as f64 / 1000.0
}

/// Chrome trace exporter for viewing slices in Perfetto or `chrome://tracing`
#[derive(Debug, Default)]
pub struct ChromeTraceExporter {
    events: Vec<ChromeTraceEvent>,
    thread_names: BTreeMap<ThreadKey, String>,
    /// Timestamps are written relative to this (ns)
    origin_ns: Option<i64>,
}

impl ChromeTraceExporter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Write timestamps relative to `origin_ns` instead of the first slice
    #[must_use]
    pub fn with_origin(mut self, origin_ns: i64) -> Self {
        self.origin_ns = Some(origin_ns);
        self
    }

    /// Label a thread's track
    pub fn set_thread_name(&mut self, key: ThreadKey, name: impl Into<String>) {
        self.thread_names.insert(key, name.into());
    }

    /// Add one thread's slices as complete events
    pub fn add_slices(&mut self, key: ThreadKey, slices: &[Slice]) {
        for slice in slices {
            let origin = *self.origin_ns.get_or_insert(slice.start);

            let mut args = HashMap::new();
            args.insert("slice_id".to_string(), serde_json::json!(slice.id.0));
            if let Some(color) = &slice.color {
                args.insert("color".to_string(), serde_json::json!(color));
            }

            self.events.push(ChromeTraceEvent {
                name: slice.title.clone(),
                cat: "sched".to_string(),
                ph: "X".to_string(),
                ts: ns_to_us((slice.start - origin).max(0)),
                dur: Some(ns_to_us(slice.duration())),
                pid: key.process.0,
                tid: key.thread.0,
                args: Some(args),
            });
        }
    }

    /// Export the trace to any writer (file, stdout, buffer, etc.)
    ///
    /// # Errors
    /// Returns an error if the JSON cannot be written
    pub fn export<W: Write>(&self, writer: W) -> Result<()> {
        let mut all_events = self.events.clone();

        for (key, name) in &self.thread_names {
            let mut args = HashMap::new();
            args.insert("name".to_string(), serde_json::json!(name));

            all_events.push(ChromeTraceEvent {
                name: "thread_name".to_string(),
                cat: String::new(),
                ph: "M".to_string(),
                ts: 0.0,
                dur: None,
                pid: key.process.0,
                tid: key.thread.0,
                args: Some(args),
            });
        }

        let trace = ChromeTrace { trace_events: all_events, display_time_unit: "ms".to_string() };

        serde_json::to_writer_pretty(writer, &trace).context("Failed to write trace JSON")?;

        Ok(())
    }

    /// Get the number of slice events collected
    #[must_use]
    pub fn event_count(&self) -> usize {
        self.events.len()
    }
}
