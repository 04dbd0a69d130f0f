//! Live table snapshots
//!
//! Reads the `FLOWS`, `OPEN_SOCKS` and `STATS` maps from the loaded object.
//! The kernel keeps writing while we iterate, so an entry that vanishes
//! mid-walk is skipped rather than failing the snapshot.

use crate::types::{FlowId, FlowRecord, ProbeStats, SocketInfo, TcpFlow};
use anyhow::{Context, Result};
use aya::{maps::HashMap, Bpf};
use log::debug;
use std::collections::HashMap as StdHashMap;

/// Point-in-time copy of the kernel tables
#[derive(Debug, Default, Clone)]
pub struct FlowSnapshot {
    pub flows: Vec<(FlowId, TcpFlow)>,
    pub sockets: StdHashMap<FlowId, SocketInfo>,
    pub stats: ProbeStats,
}

impl FlowSnapshot {
    /// Join every flow with its socket entry
    pub fn records(&self) -> Vec<FlowRecord> {
        self.flows
            .iter()
            .map(|(id, flow)| FlowRecord::from_flow(*id, flow, self.sockets.get(id), false))
            .collect()
    }
}

/// Read the flow tables and health counters
///
/// # Arguments
///
/// * `ebpf` - Loaded eBPF object
pub fn read_snapshot(ebpf: &Bpf) -> Result<FlowSnapshot> {
    let flows_map: HashMap<_, FlowId, TcpFlow> = HashMap::try_from(
        ebpf.map("FLOWS")
            .context("FLOWS map not found in eBPF object")?,
    )
    .context("Failed to open FLOWS as HashMap")?;

    let sockets_map: HashMap<_, FlowId, SocketInfo> = HashMap::try_from(
        ebpf.map("OPEN_SOCKS")
            .context("OPEN_SOCKS map not found in eBPF object")?,
    )
    .context("Failed to open OPEN_SOCKS as HashMap")?;

    let stats_map: HashMap<_, u32, u64> = HashMap::try_from(
        ebpf.map("STATS")
            .context("STATS map not found in eBPF object")?,
    )
    .context("Failed to open STATS as HashMap")?;

    let mut snapshot = FlowSnapshot::default();

    for entry in flows_map.iter() {
        match entry {
            Ok(flow) => snapshot.flows.push(flow),
            Err(e) => debug!("Skipping flow entry: {}", e),
        }
    }

    for entry in sockets_map.iter() {
        match entry {
            Ok((id, info)) => {
                snapshot.sockets.insert(id, info);
            }
            Err(e) => debug!("Skipping socket entry: {}", e),
        }
    }

    snapshot.stats = ProbeStats::from_counters(stats_map.iter().filter_map(|entry| entry.ok()));

    debug!(
        "Snapshot: {} flows, {} sockets",
        snapshot.flows.len(),
        snapshot.sockets.len()
    );

    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Direction;
    use probe_common::constants::*;

    #[test]
    fn test_records_join_socket_entries() {
        let mut flow = TcpFlow::default();
        flow.tup.family = AF_INET as u8;
        flow.stats.sent_bytes = 42;

        let mut snapshot = FlowSnapshot::default();
        snapshot.flows.push((FlowId(1), flow));
        snapshot.flows.push((FlowId(2), flow));
        snapshot.sockets.insert(
            FlowId(1),
            SocketInfo {
                created_ns: 1,
                direction: Direction::Incoming as u8,
                ..Default::default()
            },
        );

        let records = snapshot.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].direction, "incoming");
        assert_eq!(records[1].direction, "unknown");
        assert!(records.iter().all(|r| r.sent_bytes == 42 && !r.closed));
    }
}
