//! eBPF TCP Flow Probe - Userspace Program
//!
//! Loads the eBPF flow tracker with the offsets of the running kernel,
//! attaches its kprobes, backfills existing connections, then periodically
//! snapshots the flow tables and drains close events until it exits and
//! writes a report.
//!
//! ## Usage
//!
//! ```bash
//! # Run for 60 seconds and export to JSON
//! sudo ./tcpflow-probe --duration 60 --output flows.json
//!
//! # Supply the offsets past the sock_common head
//! sudo ./tcpflow-probe --offsets offsets.json
//!
//! # Use external eBPF object file
//! sudo ./tcpflow-probe --ebpf-object path/to/tcpflow-probe
//!
//! # Export to Prometheus format
//! sudo ./tcpflow-probe --duration 60 --format prometheus --output flows.prom
//! ```

use anyhow::Result;
use clap::Parser;
use log::{info, warn};
use std::{path::PathBuf, sync::Arc, time::Duration};
use tcpflow_probe_userspace::{
    collector::FlowCollector,
    config::resolve_probe_config,
    enumerate::trigger_enumeration,
    events::EventProcessor,
    exporter::{ExporterType, JsonExporter, MetricsExporter, PrometheusExporter},
    loader::ProbeLoader,
    snapshot::read_snapshot,
    types::FlowReport,
};
use tokio::{
    signal,
    sync::Mutex,
    time::{interval, sleep, Instant},
};

/// TCP connection tracker using eBPF
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Duration to run the probe (in seconds, 0 = infinite)
    #[clap(short, long, default_value_t = 60)]
    duration: u64,

    /// Output file for the flow report
    #[clap(short, long, default_value = "tcp-flows.json")]
    output: PathBuf,

    /// Output format (json, prometheus)
    #[clap(short, long, default_value = "json")]
    format: String,

    /// Verbose logging
    #[clap(short, long)]
    verbose: bool,

    /// Path to eBPF object file (if not embedded)
    #[clap(long)]
    ebpf_object: Option<PathBuf>,

    /// JSON file with kernel struct offsets
    #[clap(long)]
    offsets: Option<PathBuf>,

    /// Kernel release to derive features from instead of the running kernel
    #[clap(long)]
    kernel_release: Option<String>,

    /// Interval between flow table snapshots in seconds
    #[clap(long, default_value_t = 5)]
    poll_interval: u64,

    /// Progress reporting interval in seconds
    #[clap(long, default_value_t = 10)]
    progress_interval: u64,

    /// Do not backfill connections that existed before startup
    #[clap(long)]
    skip_enumeration: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    env_logger::Builder::from_default_env()
        .filter_level(if args.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .init();

    print_banner();

    info!("Starting eBPF TCP flow probe...");
    info!(
        "   Duration: {} seconds",
        if args.duration == 0 {
            "infinite".to_string()
        } else {
            args.duration.to_string()
        }
    );
    info!("   Output: {:?}", args.output);
    info!("   Format: {}", args.format);
    info!("   Poll interval: {} seconds", args.poll_interval);

    if args.poll_interval == 0 || args.progress_interval == 0 {
        anyhow::bail!("Poll and progress intervals must be >= 1");
    }

    let export_format = ExporterType::parse(&args.format)?;

    // Resolve kernel layout and load eBPF program
    let config = resolve_probe_config(args.offsets.as_deref(), args.kernel_release.as_deref())?;
    let mut loader = ProbeLoader::load(args.ebpf_object.clone(), &config)?;

    // Attach kprobes
    loader.attach_kprobes()?;

    // Close events
    let perf_array = loader.take_close_events()?;

    let collector = Arc::new(Mutex::new(FlowCollector::new()));
    let processor = EventProcessor::new(Arc::clone(&collector), args.verbose);
    processor.spawn_cpu_readers(perf_array)?;
    processor.spawn_progress_reporter(args.progress_interval);

    // Backfill connections opened before the probes were attached
    if args.skip_enumeration {
        info!("Skipping passive enumeration");
    } else {
        tokio::task::spawn_blocking(trigger_enumeration).await?;
    }

    info!("Collecting flows...");

    // Run for specified duration or until interrupted
    let start_time = Instant::now();
    let deadline = async {
        match args.duration {
            0 => std::future::pending::<()>().await,
            secs => sleep(Duration::from_secs(secs)).await,
        }
    };
    tokio::pin!(deadline);
    let ctrl_c = signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut poll = interval(Duration::from_secs(args.poll_interval));

    loop {
        tokio::select! {
            _ = poll.tick() => {
                match read_snapshot(loader.ebpf()) {
                    Ok(snapshot) => collector.lock().await.apply_snapshot(&snapshot),
                    Err(e) => warn!("Failed to snapshot flow tables: {:#}", e),
                }
            }
            _ = &mut deadline => {
                info!("Duration reached, shutting down...");
                break;
            }
            res = &mut ctrl_c => {
                res?;
                info!("Interrupted, shutting down...");
                break;
            }
        }
    }

    let elapsed = start_time.elapsed().as_secs();

    info!("Generating flow report...");

    // Final snapshot so the report reflects the tables at exit
    let snapshot = read_snapshot(loader.ebpf())?;
    let mut collector = collector.lock().await;
    collector.apply_snapshot(&snapshot);
    let report = collector.generate_report(elapsed);

    // Export report based on format
    match export_format {
        ExporterType::Json => {
            let exporter = JsonExporter::new(args.output.clone(), true);
            exporter.export(&report)?;
        }
        ExporterType::Prometheus => {
            let exporter = PrometheusExporter::new(args.output.clone());
            exporter.export(&report)?;
        }
    }

    info!("Flow report written to {:?}", args.output);

    print_summary(&report);

    Ok(())
}

fn print_banner() {
    println!(
        r#"
╔═══════════════════════════════════════════════════╗
║          eBPF TCP Flow Probe                      ║
║     connection tracking and accounting            ║
╚═══════════════════════════════════════════════════╝
    "#
    );
}

fn print_summary(report: &FlowReport) {
    info!("");
    info!("============================================");
    info!("             Summary Report");
    info!("============================================");
    info!("");
    info!("  Live flows:         {}", report.live_flows.len());
    info!(
        "  Closed flows:       {} ({} retained)",
        report.closed_total,
        report.closed_flows.len()
    );
    info!("  Duration:           {} seconds", report.duration_seconds);
    info!("");
    info!("  Traffic:");
    info!("    sent:        {:>12} B", report.totals.sent_bytes);
    info!("    received:    {:>12} B", report.totals.recv_bytes);
    info!("    retransmits: {:>12}", report.totals.retransmits);
    info!("");
    info!("  Flows by direction:");
    info!("    incoming:    {:>8}", report.directions.incoming.flows);
    info!("    outgoing:    {:>8}", report.directions.outgoing.flows);
    info!("    unknown:     {:>8}", report.directions.unknown.flows);
    info!("");
    info!("  RTT Percentiles (μs):");
    info!("    p50:  {:>10.2}", report.rtt_percentiles.p50);
    info!("    p90:  {:>10.2}", report.rtt_percentiles.p90);
    info!("    p99:  {:>10.2}", report.rtt_percentiles.p99);
    info!("");
    info!("  Probe counters:");
    for (name, value) in report.probe_stats.entries() {
        info!("    {:<20} {:>10}", name, value);
    }
    info!("");
    info!("============================================");
}
