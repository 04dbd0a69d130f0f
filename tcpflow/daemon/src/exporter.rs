//! Report exporters
//!
//! Provides different exporters for flow reports (JSON, Prometheus)

use crate::types::FlowReport;
use anyhow::{Context, Result};
use std::{
    fmt::Write as _,
    fs::File,
    io::Write,
    path::{Path, PathBuf},
};

/// Trait for report exporters
pub trait MetricsExporter {
    /// Export a report
    ///
    /// # Arguments
    ///
    /// * `report` - Aggregated flow report to export
    fn export(&self, report: &FlowReport) -> Result<()>;
}

/// Export format type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExporterType {
    /// JSON format
    Json,
    /// Prometheus text exposition format
    Prometheus,
}

impl ExporterType {
    /// Parse a `--format` value
    pub fn parse(format: &str) -> Result<Self> {
        match format.to_lowercase().as_str() {
            "json" => Ok(ExporterType::Json),
            "prometheus" | "prom" => Ok(ExporterType::Prometheus),
            _ => anyhow::bail!("Unsupported format: {}. Use json or prometheus", format),
        }
    }
}

fn write_file(path: &Path, contents: &str) -> Result<()> {
    let mut file = File::create(path)
        .with_context(|| format!("Failed to create output file: {:?}", path))?;

    file.write_all(contents.as_bytes())
        .with_context(|| format!("Failed to write to output file: {:?}", path))?;

    Ok(())
}

/// JSON exporter
pub struct JsonExporter {
    output_path: PathBuf,
    pretty: bool,
}

impl JsonExporter {
    /// Create a new JSON exporter
    ///
    /// # Arguments
    ///
    /// * `output_path` - Path to output file
    /// * `pretty` - Enable pretty-printing
    pub fn new(output_path: PathBuf, pretty: bool) -> Self {
        Self {
            output_path,
            pretty,
        }
    }
}

impl MetricsExporter for JsonExporter {
    fn export(&self, report: &FlowReport) -> Result<()> {
        let json = if self.pretty {
            serde_json::to_string_pretty(report)?
        } else {
            serde_json::to_string(report)?
        };

        write_file(&self.output_path, &json)
    }
}

/// Prometheus exporter
pub struct PrometheusExporter {
    output_path: PathBuf,
}

impl PrometheusExporter {
    /// Create a new Prometheus exporter
    ///
    /// # Arguments
    ///
    /// * `output_path` - Path to output file
    pub fn new(output_path: PathBuf) -> Self {
        Self { output_path }
    }

    fn header(output: &mut String, name: &str, kind: &str, help: &str) {
        let _ = writeln!(output, "# HELP {} {}", name, help);
        let _ = writeln!(output, "# TYPE {} {}", name, kind);
    }

    /// Convert a report to Prometheus format
    fn to_prometheus_format(report: &FlowReport) -> String {
        let mut output = String::new();

        // Flow counts
        Self::header(&mut output, "tcpflow_flows", "gauge", "Tracked TCP flows");
        let _ = writeln!(output, "tcpflow_flows{{state=\"live\"}} {}", report.live_flows.len());
        let _ = writeln!(output, "tcpflow_flows{{state=\"closed\"}} {}", report.closed_total);
        output.push('\n');

        // Duration
        Self::header(
            &mut output,
            "tcpflow_duration_seconds",
            "gauge",
            "Duration of collection period",
        );
        let _ = writeln!(output, "tcpflow_duration_seconds {}", report.duration_seconds);
        output.push('\n');

        // Bytes by direction
        Self::header(
            &mut output,
            "tcpflow_bytes_total",
            "counter",
            "Bytes transferred by connection direction",
        );
        for (direction, totals) in [
            ("incoming", &report.directions.incoming),
            ("outgoing", &report.directions.outgoing),
            ("unknown", &report.directions.unknown),
        ] {
            let _ = writeln!(
                output,
                "tcpflow_bytes_total{{direction=\"{}\",kind=\"sent\"}} {}",
                direction, totals.sent_bytes
            );
            let _ = writeln!(
                output,
                "tcpflow_bytes_total{{direction=\"{}\",kind=\"recv\"}} {}",
                direction, totals.recv_bytes
            );
        }
        output.push('\n');

        // Retransmits
        Self::header(
            &mut output,
            "tcpflow_retransmits_total",
            "counter",
            "Retransmitted segments across all flows",
        );
        let _ = writeln!(output, "tcpflow_retransmits_total {}", report.totals.retransmits);
        output.push('\n');

        // RTT percentiles
        Self::header(
            &mut output,
            "tcpflow_rtt_microseconds",
            "gauge",
            "Smoothed RTT percentiles in microseconds",
        );
        let p = &report.rtt_percentiles;
        for (quantile, value) in [
            ("0.50", p.p50),
            ("0.75", p.p75),
            ("0.90", p.p90),
            ("0.95", p.p95),
            ("0.99", p.p99),
            ("0.999", p.p999),
        ] {
            let _ = writeln!(
                output,
                "tcpflow_rtt_microseconds{{percentile=\"{}\"}} {}",
                quantile, value
            );
        }
        output.push('\n');

        // RTT histogram
        Self::header(
            &mut output,
            "tcpflow_rtt_histogram_bucket",
            "gauge",
            "Smoothed RTT histogram buckets",
        );
        let h = &report.rtt_histogram;
        for (le, count) in [
            ("100", h.bucket_0_100us),
            ("1000", h.bucket_100us_1ms),
            ("10000", h.bucket_1_10ms),
            ("100000", h.bucket_10_100ms),
            ("+Inf", h.bucket_100ms_plus),
        ] {
            let _ = writeln!(output, "tcpflow_rtt_histogram_bucket{{le=\"{}\"}} {}", le, count);
        }
        output.push('\n');

        // Per-flow bytes
        Self::header(
            &mut output,
            "tcpflow_flow_bytes",
            "gauge",
            "Bytes transferred per flow",
        );
        for record in report.live_flows.iter().chain(report.closed_flows.iter()) {
            let labels = format!(
                "source=\"{}\",destination=\"{}\",direction=\"{}\",pid=\"{}\"",
                record.source, record.destination, record.direction, record.pid
            );
            let _ = writeln!(output, "tcpflow_flow_bytes{{{},kind=\"sent\"}} {}", labels, record.sent_bytes);
            let _ = writeln!(output, "tcpflow_flow_bytes{{{},kind=\"recv\"}} {}", labels, record.recv_bytes);
        }
        output.push('\n');

        // Probe health
        Self::header(
            &mut output,
            "tcpflow_probe_counter",
            "counter",
            "eBPF probe health counters",
        );
        for (name, value) in report.probe_stats.entries() {
            let _ = writeln!(output, "tcpflow_probe_counter{{counter=\"{}\"}} {}", name, value);
        }
        output.push('\n');

        output
    }
}

impl MetricsExporter for PrometheusExporter {
    fn export(&self, report: &FlowReport) -> Result<()> {
        write_file(&self.output_path, &Self::to_prometheus_format(report))
    }
}
