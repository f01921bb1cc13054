//! CLI argument definitions

use clap::Parser;
use std::path::PathBuf;

use crate::config::{
    AnalysisConfig, CacheConfig, DEFAULT_BUCKET_WIDTH_NS, DEFAULT_MAX_ENTRIES,
    DEFAULT_WIDEN_PERCENT,
};

#[derive(Parser, Debug)]
#[command(
    name = "sliceview",
    about = "Explore scheduling slices of a sched_switch trace",
    after_help = "\
EXAMPLES:
    sliceview --trace trace.json                          Summary and CPU utilization
    sliceview --trace trace.json --pid 10 --tid 11        Slices of one thread
    sliceview --trace trace.json --pid 10 --tid 11 \\
              --start 0 --end 5000000 --export out.json   Export a range for Perfetto
    sliceview --serve                                     Query engine on stdin/stdout"
)]
pub struct Args {
    /// Trace file (JSON packets with ftrace sched_switch bundles)
    #[arg(short, long, value_name = "FILE", required_unless_present = "serve")]
    pub trace: Option<PathBuf>,

    /// Process ID of the thread to show
    #[arg(short, long, requires = "tid")]
    pub pid: Option<u32>,

    /// Thread ID to show
    #[arg(long, requires = "pid")]
    pub tid: Option<u32>,

    /// Range start in ns (defaults to trace start)
    #[arg(long, allow_negative_numbers = true)]
    pub start: Option<i64>,

    /// Range end in ns (defaults to trace end)
    #[arg(long, allow_negative_numbers = true)]
    pub end: Option<i64>,

    /// Utilization bucket width in ns
    #[arg(long, value_name = "NS", default_value_t = DEFAULT_BUCKET_WIDTH_NS)]
    pub bucket_width: i64,

    /// Padding fetched on each side of a cache miss, in percent of its duration
    #[arg(long, default_value_t = DEFAULT_WIDEN_PERCENT)]
    pub widen_percent: u32,

    /// Threads kept in the slice cache (0 = unbounded)
    #[arg(long, default_value_t = DEFAULT_MAX_ENTRIES)]
    pub max_entries: usize,

    /// Export the thread's slices as Chrome trace JSON
    #[arg(long, value_name = "FILE", requires = "pid")]
    pub export: Option<PathBuf>,

    /// Give up waiting for slice data after N milliseconds
    #[arg(long, default_value = "5000")]
    pub timeout_ms: u64,

    /// Run the query engine over stdin/stdout (JSON lines)
    #[arg(long, conflicts_with_all = ["trace", "pid", "export"])]
    pub serve: bool,

    /// Suppress non-essential output
    #[arg(short, long)]
    pub quiet: bool,
}

impl Args {
    #[must_use]
    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig { widen_percent: self.widen_percent, max_entries: self.max_entries }
    }

    #[must_use]
    pub fn analysis_config(&self) -> AnalysisConfig {
        AnalysisConfig { bucket_width_ns: self.bucket_width }
    }
}
