//! Flow collection and aggregation
//!
//! Holds the latest snapshot of live flows and a bounded window of recently
//! closed flows. Totals for closed flows are folded in as their events
//! arrive, so a long run keeps constant memory.

use crate::{snapshot::FlowSnapshot, types::*};
use std::collections::{HashMap, HashSet, VecDeque};

/// Closed flow records kept for the report
pub const MAX_CLOSED_RECORDS: usize = 4096;

/// Collector for live and closed flows
#[derive(Default)]
pub struct FlowCollector {
    /// Live flows from the most recent snapshot, keyed by record id
    live: HashMap<String, FlowRecord>,
    /// Most recent closed flows, oldest first
    closed: VecDeque<FlowRecord>,
    /// Newest `last_update_ns` seen in a close event, per record id.
    /// Pruned to ids still present in the kernel at each snapshot.
    closed_ids: HashMap<String, u64>,
    /// Running totals over every close event
    closed_totals: TrafficTotals,
    closed_directions: DirectionBreakdown,
    closed_histogram: RttHistogram,
    /// Health counters from the most recent snapshot
    stats: ProbeStats,
    /// Close events processed
    close_events: u64,
    /// Snapshots applied
    snapshots: u64,
}

impl FlowCollector {
    /// Create a new flow collector
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the live view with a fresh snapshot
    ///
    /// A flow that already arrived as a close event stays closed even if the
    /// snapshot was taken before its eviction.
    pub fn apply_snapshot(&mut self, snapshot: &FlowSnapshot) {
        let records = snapshot.records();

        // Snapshots are taken in order, so an id missing from this one can
        // only come back with a newer last_update.
        let present: HashSet<&str> = records.iter().map(|r| r.id.as_str()).collect();
        self.closed_ids.retain(|id, _| present.contains(id.as_str()));

        let closed_ids = &self.closed_ids;
        self.live = records
            .into_iter()
            .filter(|record| {
                closed_ids
                    .get(&record.id)
                    .map_or(true, |&closed_at| record.last_update_ns > closed_at)
            })
            .map(|record| (record.id.clone(), record))
            .collect();
        self.stats = snapshot.stats.clone();
        self.snapshots += 1;
    }

    /// Record a flow that closed in the kernel
    ///
    /// # Arguments
    ///
    /// * `event` - Close event from the eBPF program
    pub fn add_close_event(&mut self, event: &TcpCloseEvent) {
        let record = FlowRecord::from_close_event(event);
        self.live.remove(&record.id);

        let closed_at = self.closed_ids.entry(record.id.clone()).or_insert(0);
        *closed_at = (*closed_at).max(record.last_update_ns);

        self.closed_totals.add(&record);
        self.closed_directions.add(&record);
        if record.rtt_us > 0 {
            self.closed_histogram.add_sample(record.rtt_us as f64);
        }

        if self.closed.len() == MAX_CLOSED_RECORDS {
            self.closed.pop_front();
        }
        self.closed.push_back(record);
        self.close_events += 1;
    }

    /// Generate the final report
    ///
    /// Totals, direction split and histogram cover every flow seen. RTT
    /// percentiles are taken over live flows and the retained closed window.
    ///
    /// # Arguments
    ///
    /// * `elapsed_secs` - Duration of collection period in seconds
    pub fn generate_report(&self, elapsed_secs: u64) -> FlowReport {
        let mut live_flows: Vec<FlowRecord> = self.live.values().cloned().collect();
        live_flows.sort_by(|a, b| a.id.cmp(&b.id));

        let mut totals = self.closed_totals.clone();
        let mut directions = self.closed_directions.clone();
        let mut rtt_histogram = self.closed_histogram.clone();
        for record in &live_flows {
            totals.add(record);
            directions.add(record);
            if record.rtt_us > 0 {
                rtt_histogram.add_sample(record.rtt_us as f64);
            }
        }

        let rtt_samples = live_flows
            .iter()
            .chain(self.closed.iter())
            .filter(|record| record.rtt_us > 0)
            .map(|record| record.rtt_us as f64)
            .collect();

        FlowReport {
            timestamp: chrono::Utc::now().to_rfc3339(),
            duration_seconds: elapsed_secs,
            live_flows,
            closed_flows: self.closed.iter().cloned().collect(),
            closed_total: self.close_events,
            totals,
            directions,
            rtt_percentiles: calculate_percentiles(rtt_samples),
            rtt_histogram,
            probe_stats: self.stats.clone(),
        }
    }

    /// Number of live flows in the last snapshot
    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    /// Number of closed flow records retained
    pub fn closed_count(&self) -> usize {
        self.closed.len()
    }

    /// Get current close event count
    pub fn event_count(&self) -> u64 {
        self.close_events
    }

    pub fn snapshot_count(&self) -> u64 {
        self.snapshots
    }

    /// Get probe statistics reference
    pub fn probe_stats(&self) -> &ProbeStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use probe_common::constants::*;

    fn flow(sent: u64, recv: u64, rtt: u32, last_update: u64) -> TcpFlow {
        let mut flow = TcpFlow::default();
        flow.tup.family = AF_INET as u8;
        flow.tup.sport = 40000;
        flow.tup.dport = 80;
        flow.tup.saddr[..4].copy_from_slice(&[127, 0, 0, 1]);
        flow.tup.daddr[..4].copy_from_slice(&[127, 0, 0, 1]);
        flow.stats.sent_bytes = sent;
        flow.stats.recv_bytes = recv;
        flow.stats.last_update = last_update;
        flow.tcpstats.rtt = rtt;
        flow
    }

    fn info(direction: Direction) -> SocketInfo {
        SocketInfo {
            created_ns: 1,
            direction: direction as u8,
            ..Default::default()
        }
    }

    #[test]
    fn test_collector_basic() {
        let mut collector = FlowCollector::new();

        let mut snapshot = FlowSnapshot::default();
        snapshot.flows.push((FlowId(0x10), flow(100, 200, 50, 10)));
        snapshot.flows.push((FlowId(0x20), flow(1, 2, 0, 10)));
        snapshot.sockets.insert(FlowId(0x10), info(Direction::Outgoing));
        snapshot.stats.flows_created = 2;
        collector.apply_snapshot(&snapshot);

        assert_eq!(collector.live_count(), 2);
        assert_eq!(collector.snapshot_count(), 1);
        assert_eq!(collector.probe_stats().flows_created, 2);

        let report = collector.generate_report(30);
        assert_eq!(report.totals.flows, 2);
        assert_eq!(report.totals.sent_bytes, 101);
        assert_eq!(report.directions.outgoing.flows, 1);
        assert_eq!(report.directions.unknown.flows, 1);
        // the zero RTT flow has no measurement
        assert_eq!(report.rtt_histogram.total_count(), 1);
    }

    #[test]
    fn test_close_event_moves_flow() {
        let mut collector = FlowCollector::new();

        let mut snapshot = FlowSnapshot::default();
        snapshot.flows.push((FlowId(0x10), flow(100, 200, 50, 10)));
        collector.apply_snapshot(&snapshot);

        collector.add_close_event(&TcpCloseEvent {
            skp: FlowId(0x10),
            flow: flow(150, 250, 50, 20),
            skinfo: info(Direction::Incoming),
        });

        assert_eq!(collector.live_count(), 0);
        assert_eq!(collector.closed_count(), 1);
        assert_eq!(collector.event_count(), 1);

        // a snapshot taken before the eviction must not resurrect the flow
        collector.apply_snapshot(&snapshot);
        assert_eq!(collector.live_count(), 0);

        let report = collector.generate_report(1);
        assert_eq!(report.closed_flows[0].sent_bytes, 150);
        assert_eq!(report.closed_total, 1);
        assert_eq!(report.directions.incoming.recv_bytes, 250);
    }

    #[test]
    fn test_reused_address_is_live_again() {
        let mut collector = FlowCollector::new();

        collector.add_close_event(&TcpCloseEvent {
            skp: FlowId(0x10),
            flow: flow(1, 1, 0, 20),
            skinfo: SocketInfo::default(),
        });

        let mut snapshot = FlowSnapshot::default();
        snapshot.flows.push((FlowId(0x10), flow(5, 5, 0, 90)));
        collector.apply_snapshot(&snapshot);

        assert_eq!(collector.live_count(), 1);
        assert_eq!(collector.closed_count(), 1);
    }

    #[test]
    fn test_closed_flows_are_bounded() {
        let mut collector = FlowCollector::new();

        let closes = 20_000u64;
        for i in 0..closes {
            collector.add_close_event(&TcpCloseEvent {
                skp: FlowId(0x1000 + i),
                flow: flow(10, 20, 500, 5),
                skinfo: info(Direction::Outgoing),
            });
        }
        assert_eq!(collector.closed_count(), MAX_CLOSED_RECORDS);
        assert_eq!(collector.event_count(), closes);

        // the first 1024 ids show up again in a snapshot taken before their close
        let mut snapshot = FlowSnapshot::default();
        for i in 0..1024u64 {
            snapshot.flows.push((FlowId(0x1000 + i), flow(1, 1, 0, 4)));
        }
        snapshot.flows.push((FlowId(0x10), flow(7, 0, 0, 4)));
        collector.apply_snapshot(&snapshot);

        assert_eq!(collector.live_count(), 1);
        assert_eq!(collector.closed_ids.len(), 1024);

        let report = collector.generate_report(60);
        assert_eq!(report.closed_flows.len(), MAX_CLOSED_RECORDS);
        assert_eq!(report.closed_flows.last().unwrap().id, format!("{:#x}", 0x1000 + closes - 1));
        assert_eq!(report.closed_total, closes);
        assert_eq!(report.totals.flows, closes + 1);
        assert_eq!(report.totals.sent_bytes, closes * 10 + 7);
        assert_eq!(report.directions.outgoing.recv_bytes, closes * 20);
        assert_eq!(report.rtt_histogram.bucket_100us_1ms, closes);

        // nothing in the next snapshot, so no id can be resurrected any more
        collector.apply_snapshot(&FlowSnapshot::default());
        assert!(collector.closed_ids.is_empty());
    }

    #[test]
    fn test_histogram() {
        let mut collector = FlowCollector::new();

        // in microseconds
        let rtts = [50, 500, 5000, 50000, 150000];
        let mut snapshot = FlowSnapshot::default();
        for (i, &rtt) in rtts.iter().enumerate() {
            snapshot.flows.push((FlowId(i as u64 + 1), flow(0, 0, rtt, 1)));
        }
        collector.apply_snapshot(&snapshot);

        let histogram = collector.generate_report(1).rtt_histogram;
        assert_eq!(histogram.bucket_0_100us, 1);
        assert_eq!(histogram.bucket_100us_1ms, 1);
        assert_eq!(histogram.bucket_1_10ms, 1);
        assert_eq!(histogram.bucket_10_100ms, 1);
        assert_eq!(histogram.bucket_100ms_plus, 1);
    }
}
