//! # sliceview - Main Entry Point
//!
//! Supports two operational modes:
//! - **Explore** (`--trace <FILE>`): load the trace into an in-process query
//!   engine, print the summary and CPU utilization, and with `--pid/--tid`
//!   serve that thread's slices through the trace data cache
//! - **Serve** (`--serve`): run the query engine over stdin/stdout JSON lines
//!   for a caller in another process

// Display code converts ns to floating point
#![allow(clippy::cast_precision_loss)]

use anyhow::{Context, Result};
use clap::Parser;
use log::{debug, info};
use std::fs::File;
use std::io::BufWriter;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;

use sliceview::cache::{SliceSource, TraceDataCache};
use sliceview::cli::Args;
use sliceview::config::CacheConfig;
use sliceview::domain::{AnalysisError, EngineError, Pid, ThreadKey, Tid};
use sliceview::engine::{QueryEngineClient, TraceProcessor, UtilizationBucket};
use sliceview::export::ChromeTraceExporter;
use sliceview::rpc::{json_lines, serve, spawn_in_memory};
use sliceview::trace_data::{Slice, TraceDataQuery};

// Exit codes
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_USAGE: i32 = 2;

/// Width of the utilization bars in characters
const BAR_WIDTH: usize = 40;

fn main() {
    env_logger::init();
    std::process::exit(match run() {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            let code = exit_code_for(&e);
            eprintln!("error: {e:#}");
            code
        }
    });
}

/// Bad bucket widths and ranges are usage errors, wherever they surface
fn exit_code_for(err: &anyhow::Error) -> i32 {
    let usage = err.chain().any(|cause| {
        cause.is::<AnalysisError>()
            || matches!(cause.downcast_ref::<EngineError>(), Some(EngineError::Analysis(_)))
    });
    if usage {
        EXIT_USAGE
    } else {
        EXIT_ERROR
    }
}

#[tokio::main]
async fn run() -> Result<()> {
    let args = Args::parse();

    if args.serve {
        return serve_stdio().await;
    }

    args.analysis_config().validate()?;
    let trace_path = args.trace.as_ref().context("--trace is required unless --serve is given")?;
    let quiet = args.quiet;

    let bytes = tokio::fs::read(trace_path)
        .await
        .with_context(|| format!("Failed to read trace file: {}", trace_path.display()))?;

    let client = QueryEngineClient::connect(spawn_in_memory(TraceProcessor::new()));
    let summary = client.load(bytes).await.context("Failed to load trace")?;

    if !quiet {
        println!("sliceview v{}", env!("CARGO_PKG_VERSION"));
        println!("trace: {}", trace_path.display());
        println!(
            "span: {} .. {} ns ({:.3} ms)",
            summary.start,
            summary.end,
            summary.end.saturating_sub(summary.start) as f64 / 1e6
        );
        println!("cpus: {}", summary.cpu_count);
        println!("threads: {}", summary.thread_count);
        println!("slices: {}", summary.slice_count);
    }

    let width = args.bucket_width;
    let buckets = client.cpu_utilization(width).await.context("CPU utilization query failed")?;
    if !quiet {
        print_utilization(&buckets, width, summary.cpu_count);
    }

    let (Some(pid), Some(tid)) = (args.pid, args.tid) else {
        return Ok(());
    };
    let key = ThreadKey::new(Pid(pid), Tid(tid));
    let start = args.start.unwrap_or(summary.start);
    let end = args.end.unwrap_or(summary.end);
    if end < start {
        return Err(AnalysisError::InvalidRange { start, end }).context("--end is before --start");
    }

    let slices = fetch_through_cache(
        &client,
        TraceDataQuery::for_thread(key, start, end),
        args.cache_config(),
        Duration::from_millis(args.timeout_ms),
    )
    .await?;

    println!("\n{key} [{start}, {end}): {} slices", slices.len());
    for slice in &slices {
        println!(
            "  {:>8}  {:>14}  {:>10.3} us  {}",
            slice.id.to_string(),
            slice.start,
            slice.duration() as f64 / 1e3,
            slice.title
        );
    }

    if let Some(export_path) = &args.export {
        let mut exporter = ChromeTraceExporter::new().with_origin(summary.start);
        if let Some(first) = slices.first() {
            exporter.set_thread_name(key, first.title.clone());
        }
        exporter.add_slices(key, &slices);

        let file = File::create(export_path).context("Failed to create trace output file")?;
        exporter.export(BufWriter::new(file)).context("Failed to export trace")?;

        if !quiet {
            println!("saved: {}", export_path.display());
        }
    }

    Ok(())
}

/// Serve one thread's range through the cache the way a render loop would:
/// query, and re-query whenever the cache reports new data, until the range
/// is covered.
async fn fetch_through_cache(
    client: &QueryEngineClient,
    query: TraceDataQuery,
    config: CacheConfig,
    timeout: Duration,
) -> Result<Vec<Slice>> {
    let source: Arc<dyn SliceSource> = Arc::new(client.clone());
    let mut cache = TraceDataCache::new(source, Handle::current(), config);
    let mut changes = cache.subscribe();
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        let slices = cache.get_data(&query).to_vec();
        if cache.is_covered(&query) {
            debug!("Cache stats: {:?}", cache.stats());
            return Ok(slices);
        }
        if let Some(key) = query.key() {
            if let Some(err) = cache.fetch_error(key) {
                anyhow::bail!("Fetching slices for {key} failed: {err}");
            }
        }

        match tokio::time::timeout_at(deadline, changes.changed()).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => anyhow::bail!("Cache change notifier closed"),
            Err(_) => anyhow::bail!("Timed out after {}ms waiting for slice data", timeout.as_millis()),
        }
    }
}

fn print_utilization(buckets: &[UtilizationBucket], width_ns: i64, cpu_count: u32) {
    println!("\nCPU utilization ({:.3} ms buckets):", width_ns as f64 / 1e6);
    for bucket in buckets {
        let fraction =
            sliceview::analysis::utilization(bucket.busy_ns, width_ns, cpu_count).clamp(0.0, 1.0);
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let filled = (fraction * BAR_WIDTH as f64).round() as usize;
        println!(
            "  {:>14}  {:<width$}  {:>5.1}%",
            bucket.start,
            "#".repeat(filled),
            fraction * 100.0,
            width = BAR_WIDTH
        );
    }
}

/// Run the query engine over stdin/stdout until stdin closes
async fn serve_stdio() -> Result<()> {
    info!("Serving query engine on stdin/stdout");
    let (endpoint, flushed) = json_lines(tokio::io::stdin(), tokio::io::stdout());
    serve(TraceProcessor::new(), endpoint).await.context("Query engine server failed")?;
    flushed.await.context("Failed to flush replies")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_for_analysis_errors() {
        let err = anyhow::Error::from(AnalysisError::InvalidBucketWidth(0));
        assert_eq!(exit_code_for(&err), EXIT_USAGE);

        let err = anyhow::Error::from(AnalysisError::InvalidRange { start: 10, end: 0 })
            .context("--end is before --start");
        assert_eq!(exit_code_for(&err), EXIT_USAGE);

        let err = anyhow::Error::from(EngineError::from(AnalysisError::InvalidBucketWidth(-1)))
            .context("CPU utilization query failed");
        assert_eq!(exit_code_for(&err), EXIT_USAGE);
    }

    #[test]
    fn test_exit_code_for_other_errors() {
        let err = anyhow::Error::from(EngineError::Remote("boom".to_string()));
        assert_eq!(exit_code_for(&err), EXIT_ERROR);
        assert_eq!(exit_code_for(&anyhow::anyhow!("invalid range")), EXIT_ERROR);
    }
}
