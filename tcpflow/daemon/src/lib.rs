//! TCP Flow Probe Userspace Library
//!
//! Provides reusable components for loading the eBPF flow tracker, draining
//! its tables and exporting flow reports.

pub mod collector;
pub mod config;
pub mod enumerate;
pub mod events;
pub mod exporter;
pub mod loader;
pub mod snapshot;
pub mod types;

pub use collector::FlowCollector;
pub use events::EventProcessor;
pub use exporter::{ExporterType, JsonExporter, MetricsExporter, PrometheusExporter};
pub use loader::ProbeLoader;
pub use snapshot::FlowSnapshot;
pub use types::*;
