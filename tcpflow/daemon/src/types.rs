//! Userspace type definitions
//!
//! Defines the data structures used by the userspace program for
//! flow aggregation and export.
//!
//! ## Organization
//!
//! This module separates kernel and userspace types:
//! - **Kernel Types**: Types shared with eBPF programs (from probe_common)
//! - **Userspace Types**: Types used only in userspace for aggregation and export

use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, Ipv6Addr};

// ============================================================================
// Kernel Types (from eBPF programs)
// ============================================================================

pub mod kernel {
    //! Types shared between kernel eBPF programs and userspace
    //!
    //! These are re-exported from the probe-common crate and must
    //! maintain binary compatibility with the eBPF programs.

    pub use probe_common::constants;
    pub use probe_common::types::{
        Direction, FlowId, SocketInfo, TcpCloseEvent, TcpFlow, TcpStats, Tuple,
    };
}

pub use kernel::{Direction, FlowId, SocketInfo, TcpCloseEvent, TcpFlow, Tuple};
use probe_common::constants::*;

/// Full report written at the end of a run
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct FlowReport {
    /// ISO 8601 timestamp when the report was generated
    pub timestamp: String,
    /// Duration of collection period in seconds
    pub duration_seconds: u64,
    /// Flows still open at the last snapshot
    pub live_flows: Vec<FlowRecord>,
    /// Most recent flows reported through close events
    pub closed_flows: Vec<FlowRecord>,
    /// Close events received over the whole run
    pub closed_total: u64,
    /// Byte and retransmit totals across every flow
    pub totals: TrafficTotals,
    /// Totals split by connection direction
    pub directions: DirectionBreakdown,
    /// Smoothed RTT percentiles across flows with a measured RTT
    pub rtt_percentiles: Percentiles,
    /// Smoothed RTT histogram
    pub rtt_histogram: RttHistogram,
    /// Probe health counters
    pub probe_stats: ProbeStats,
}

/// One flow as exported
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FlowRecord {
    /// Kernel socket address, hex
    pub id: String,
    /// Source address:port
    pub source: String,
    /// Destination address:port
    pub destination: String,
    /// "ipv4" or "ipv6"
    pub family: String,
    /// Owning process id
    pub pid: u32,
    /// Network namespace inode
    pub netns: u32,
    /// "incoming", "outgoing" or "unknown"
    pub direction: String,
    pub sent_bytes: u64,
    pub recv_bytes: u64,
    pub retransmits: u32,
    pub rtt_us: u32,
    pub rtt_var_us: u32,
    /// Every TCP state the connection has been seen in
    pub states: Vec<String>,
    /// Monotonic timestamp of the last counter update (nanoseconds)
    pub last_update_ns: u64,
    pub closed: bool,
}

impl FlowRecord {
    /// Build a record from a flow and its socket entry, if any
    pub fn from_flow(id: FlowId, flow: &TcpFlow, info: Option<&SocketInfo>, closed: bool) -> Self {
        let (source, destination) = tuple_endpoints(&flow.tup);

        Self {
            id: format!("{:#x}", id.0),
            source,
            destination,
            family: family_name(flow.tup.family as u16).to_string(),
            pid: flow.tup.tgid,
            netns: info.map(|i| i.netns).unwrap_or(0),
            direction: direction_name(info.map(|i| i.direction()).unwrap_or(Direction::Unknown))
                .to_string(),
            sent_bytes: flow.stats.sent_bytes,
            recv_bytes: flow.stats.recv_bytes,
            retransmits: flow.tcpstats.retransmits,
            rtt_us: flow.tcpstats.rtt,
            rtt_var_us: flow.tcpstats.rtt_var,
            states: decode_states(flow.tcpstats.state_transitions),
            last_update_ns: flow.stats.last_update,
            closed,
        }
    }

    /// Build a record from a close event
    pub fn from_close_event(event: &TcpCloseEvent) -> Self {
        // a zeroed socket entry means the registry never saw the socket
        let info = (event.skinfo.created_ns != 0).then_some(&event.skinfo);
        Self::from_flow(event.skp, &event.flow, info, true)
    }
}

/// Aggregate byte counters
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct TrafficTotals {
    pub flows: u64,
    pub sent_bytes: u64,
    pub recv_bytes: u64,
    pub retransmits: u64,
}

impl TrafficTotals {
    pub fn add(&mut self, record: &FlowRecord) {
        self.flows += 1;
        self.sent_bytes += record.sent_bytes;
        self.recv_bytes += record.recv_bytes;
        self.retransmits += record.retransmits as u64;
    }
}

/// Totals per direction
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct DirectionBreakdown {
    pub incoming: TrafficTotals,
    pub outgoing: TrafficTotals,
    pub unknown: TrafficTotals,
}

impl DirectionBreakdown {
    pub fn add(&mut self, record: &FlowRecord) {
        match record.direction.as_str() {
            "incoming" => self.incoming.add(record),
            "outgoing" => self.outgoing.add(record),
            _ => self.unknown.add(record),
        }
    }
}

/// Smoothed RTT histogram buckets
#[derive(Serialize, Deserialize, Debug, Default, Clone)]
pub struct RttHistogram {
    /// 0-100us bucket
    #[serde(rename = "0-100us")]
    pub bucket_0_100us: u64,
    /// 100us-1ms bucket
    #[serde(rename = "100us-1ms")]
    pub bucket_100us_1ms: u64,
    /// 1-10ms bucket
    #[serde(rename = "1-10ms")]
    pub bucket_1_10ms: u64,
    /// 10-100ms bucket
    #[serde(rename = "10-100ms")]
    pub bucket_10_100ms: u64,
    /// 100ms+ bucket
    #[serde(rename = "100ms+")]
    pub bucket_100ms_plus: u64,
}

impl RttHistogram {
    /// Add a sample to the appropriate bucket
    ///
    /// # Arguments
    ///
    /// * `rtt_us` - Smoothed RTT in microseconds
    pub fn add_sample(&mut self, rtt_us: f64) {
        match rtt_us {
            r if r < 100.0 => self.bucket_0_100us += 1,
            r if r < 1000.0 => self.bucket_100us_1ms += 1,
            r if r < 10000.0 => self.bucket_1_10ms += 1,
            r if r < 100000.0 => self.bucket_10_100ms += 1,
            _ => self.bucket_100ms_plus += 1,
        }
    }

    /// Get total count across all buckets
    pub fn total_count(&self) -> u64 {
        self.bucket_0_100us
            + self.bucket_100us_1ms
            + self.bucket_1_10ms
            + self.bucket_10_100ms
            + self.bucket_100ms_plus
    }
}

/// RTT percentiles
#[derive(Serialize, Deserialize, Debug, Default, Clone)]
pub struct Percentiles {
    /// 50th percentile (median)
    pub p50: f64,
    /// 75th percentile
    pub p75: f64,
    /// 90th percentile
    pub p90: f64,
    /// 95th percentile
    pub p95: f64,
    /// 99th percentile
    pub p99: f64,
    /// 99.9th percentile
    pub p999: f64,
}

/// Probe health counters read from the `STATS` map
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct ProbeStats {
    pub total_events: u64,
    pub sockets_registered: u64,
    pub flows_created: u64,
    pub inserts_dropped: u64,
    pub correlation_misses: u64,
    pub unsupported_family: u64,
    pub enumerated_flows: u64,
    pub flows_closed: u64,
}

impl ProbeStats {
    /// Build from `(index, value)` pairs; unknown indices are ignored
    pub fn from_counters(counters: impl IntoIterator<Item = (u32, u64)>) -> Self {
        let mut stats = Self::default();
        for (index, value) in counters {
            let slot = match index {
                STAT_TOTAL_EVENTS => &mut stats.total_events,
                STAT_SOCKETS_REGISTERED => &mut stats.sockets_registered,
                STAT_FLOWS_CREATED => &mut stats.flows_created,
                STAT_INSERTS_DROPPED => &mut stats.inserts_dropped,
                STAT_CORRELATION_MISSES => &mut stats.correlation_misses,
                STAT_UNSUPPORTED_FAMILY => &mut stats.unsupported_family,
                STAT_ENUMERATED_FLOWS => &mut stats.enumerated_flows,
                STAT_FLOWS_CLOSED => &mut stats.flows_closed,
                _ => continue,
            };
            *slot = value;
        }
        stats
    }

    /// `(name, value)` pairs in index order
    pub fn entries(&self) -> [(&'static str, u64); 8] {
        [
            ("total_events", self.total_events),
            ("sockets_registered", self.sockets_registered),
            ("flows_created", self.flows_created),
            ("inserts_dropped", self.inserts_dropped),
            ("correlation_misses", self.correlation_misses),
            ("unsupported_family", self.unsupported_family),
            ("enumerated_flows", self.enumerated_flows),
            ("flows_closed", self.flows_closed),
        ]
    }
}

/// Calculate percentiles from a vector of samples
///
/// # Arguments
///
/// * `samples` - Vector of values (will be sorted in place)
///
/// # Returns
///
/// Percentiles structure with p50, p75, p90, p95, p99, p999
pub fn calculate_percentiles(mut samples: Vec<f64>) -> Percentiles {
    if samples.is_empty() {
        return Percentiles::default();
    }

    samples.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let len = samples.len();

    let percentile = |per_mille: usize| {
        let index = std::cmp::min((len * per_mille / 1000).saturating_sub(1), len - 1);
        samples[index]
    };

    Percentiles {
        p50: percentile(500),
        p75: percentile(750),
        p90: percentile(900),
        p95: percentile(950),
        p99: percentile(990),
        p999: percentile(999),
    }
}

/// Render one endpoint, bracketing IPv6 addresses
pub fn format_endpoint(family: u16, addr: &[u8; 16], port: u16) -> String {
    match family {
        AF_INET6 => format!("[{}]:{}", Ipv6Addr::from(*addr), port),
        _ => format!(
            "{}:{}",
            Ipv4Addr::new(addr[0], addr[1], addr[2], addr[3]),
            port
        ),
    }
}

/// Source and destination strings of a tuple
pub fn tuple_endpoints(tup: &Tuple) -> (String, String) {
    let family = tup.family as u16;
    (
        format_endpoint(family, &tup.saddr, tup.sport),
        format_endpoint(family, &tup.daddr, tup.dport),
    )
}

pub fn family_name(family: u16) -> &'static str {
    match family {
        AF_INET => "ipv4",
        AF_INET6 => "ipv6",
        _ => "unknown",
    }
}

pub fn direction_name(direction: Direction) -> &'static str {
    match direction {
        Direction::Incoming => "incoming",
        Direction::Outgoing => "outgoing",
        Direction::Unknown => "unknown",
    }
}

/// Kernel name of a TCP state
pub fn state_name(state: u8) -> &'static str {
    match state {
        TCP_ESTABLISHED => "ESTABLISHED",
        TCP_SYN_SENT => "SYN_SENT",
        TCP_SYN_RECV => "SYN_RECV",
        TCP_FIN_WAIT1 => "FIN_WAIT1",
        TCP_FIN_WAIT2 => "FIN_WAIT2",
        TCP_TIME_WAIT => "TIME_WAIT",
        TCP_CLOSE => "CLOSE",
        TCP_CLOSE_WAIT => "CLOSE_WAIT",
        TCP_LAST_ACK => "LAST_ACK",
        TCP_LISTEN => "LISTEN",
        TCP_CLOSING => "CLOSING",
        TCP_NEW_SYN_RECV => "NEW_SYN_RECV",
        _ => "UNKNOWN",
    }
}

/// Names of every state bit set in a state-transition mask
pub fn decode_states(mask: u16) -> Vec<String> {
    (0..STATE_MASK_BITS)
        .filter(|bit| mask & (1u16 << bit) != 0)
        .map(|bit| state_name(bit).to_string())
        .collect()
}
