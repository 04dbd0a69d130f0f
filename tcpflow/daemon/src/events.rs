//! Event processing from eBPF perf buffers
//!
//! Reads closed-flow events from per-CPU perf buffers and feeds them to the
//! collector asynchronously.

use crate::{
    collector::FlowCollector,
    types::{tuple_endpoints, TcpCloseEvent},
};
use anyhow::Result;
use aya::{
    maps::{perf::AsyncPerfEventArray, MapData},
    util::online_cpus,
};
use bytes::BytesMut;
use log::{debug, info, warn};
use std::{sync::Arc, time::Duration};
use tokio::{sync::Mutex, time::interval};

/// Decode one perf record into a close event
///
/// Returns `None` for a record shorter than the event.
pub fn parse_close_event(buf: &[u8]) -> Option<TcpCloseEvent> {
    if buf.len() < std::mem::size_of::<TcpCloseEvent>() {
        return None;
    }
    let ptr = buf.as_ptr() as *const TcpCloseEvent;
    // SAFETY: length checked above and TcpCloseEvent is plain data
    Some(unsafe { ptr.read_unaligned() })
}

/// Event processor that reads from perf buffers
pub struct EventProcessor {
    collector: Arc<Mutex<FlowCollector>>,
    verbose: bool,
}

impl EventProcessor {
    /// Create a new event processor
    ///
    /// # Arguments
    ///
    /// * `collector` - Shared flow collector
    /// * `verbose` - Log every closed flow
    pub fn new(collector: Arc<Mutex<FlowCollector>>, verbose: bool) -> Self {
        Self { collector, verbose }
    }

    /// Spawn per-CPU event readers
    ///
    /// Creates a task for each CPU to read events from its perf buffer.
    ///
    /// # Arguments
    ///
    /// * `perf_array` - `TCP_CLOSE_EVENTS` perf event array
    pub fn spawn_cpu_readers(&self, mut perf_array: AsyncPerfEventArray<MapData>) -> Result<()> {
        let cpus = online_cpus()?;
        info!("Spawning close event readers for {} CPUs", cpus.len());

        for cpu_id in cpus {
            let mut buf = perf_array.open(cpu_id, None)?;
            let collector_clone = Arc::clone(&self.collector);
            let verbose = self.verbose;

            tokio::spawn(async move {
                // Pre-allocate buffers for reading events
                let mut buffers = (0..10)
                    .map(|_| BytesMut::with_capacity(std::mem::size_of::<TcpCloseEvent>()))
                    .collect::<Vec<_>>();

                loop {
                    let events = match buf.read_events(&mut buffers).await {
                        Ok(events) => events,
                        Err(e) => {
                            warn!("Error reading events from CPU {}: {}", cpu_id, e);
                            continue;
                        }
                    };

                    if events.lost > 0 {
                        warn!("Lost {} close events on CPU {}", events.lost, cpu_id);
                    }

                    for buf in buffers.iter_mut().take(events.read) {
                        let Some(event) = parse_close_event(buf) else {
                            warn!("Short close event ({} bytes) on CPU {}", buf.len(), cpu_id);
                            continue;
                        };

                        if verbose {
                            let (source, destination) = tuple_endpoints(&event.flow.tup);
                            debug!(
                                "Closed: {} -> {}, sent {} B, recv {} B, rtt {}us",
                                source,
                                destination,
                                event.flow.stats.sent_bytes,
                                event.flow.stats.recv_bytes,
                                event.flow.tcpstats.rtt
                            );
                        }

                        let mut collector = collector_clone.lock().await;
                        collector.add_close_event(&event);
                    }
                }
            });
        }

        Ok(())
    }

    /// Spawn progress reporter
    ///
    /// Creates a task that periodically reports collection progress.
    ///
    /// # Arguments
    ///
    /// * `interval_secs` - Reporting interval in seconds
    pub fn spawn_progress_reporter(&self, interval_secs: u64) {
        let collector_clone = Arc::clone(&self.collector);

        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(interval_secs));

            loop {
                ticker.tick().await;

                let collector = collector_clone.lock().await;
                let stats = collector.probe_stats();
                info!(
                    "📈 Progress: {} live flows, {} closed, {} probe events, {} dropped inserts",
                    collector.live_count(),
                    collector.event_count(),
                    stats.total_events,
                    stats.inserts_dropped
                );
            }
        });
    }
}
