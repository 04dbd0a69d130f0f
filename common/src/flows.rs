//! Flow table: tuple and running statistics per TCP connection
//!
//! Counters are only ever touched with atomic adds since any CPU may be
//! updating the same flow. `last_update` and the RTT fields are plain
//! overwrites and reflect whichever writer landed last.

use crate::{
    constants::*,
    kernel::Kernel,
    table::{atomic_add_u32, atomic_add_u64, atomic_store_u32, atomic_store_u64, Insert, InsertMode, Table},
    types::{FlowId, TcpFlow},
};
use core::ptr::addr_of_mut;

pub struct FlowTable<'a, K, T> {
    kernel: &'a K,
    table: &'a T,
}

impl<'a, K, T> FlowTable<'a, K, T>
where
    K: Kernel,
    T: Table<FlowId, TcpFlow>,
{
    pub fn new(kernel: &'a K, table: &'a T) -> Self {
        Self { kernel, table }
    }

    /// Look up the flow for `sk`, creating it first if absent
    ///
    /// Creation is a compare-and-insert, so racing creators end up sharing
    /// one entry and the tuple of the first winner. Returns `None` only when
    /// the table is full.
    #[inline(always)]
    pub fn get_or_create(&self, sk: FlowId, family: u16) -> Option<*mut TcpFlow> {
        if let Some(flow) = self.table.lookup(&sk) {
            return Some(flow);
        }

        let mut flow = TcpFlow::default();
        flow.tup = self.kernel.tuple(sk, family);
        flow.tup.family = family as u8;
        flow.tup.protocol = IPPROTO_TCP;
        flow.tup.tgid = self.kernel.tgid();
        if let Some((rtt, rtt_var)) = self.kernel.rtt(sk).descale() {
            flow.tcpstats.rtt = rtt;
            flow.tcpstats.rtt_var = rtt_var;
        }

        match self.table.insert(&sk, &flow, InsertMode::NoExist) {
            Insert::Inserted => self.kernel.count(STAT_FLOWS_CREATED),
            Insert::Dropped => self.kernel.count(STAT_INSERTS_DROPPED),
            Insert::Exists => {}
        }
        self.table.lookup(&sk)
    }

    /// Account bytes handed to the stack by a send and refresh the RTT
    #[inline(always)]
    pub fn record_sent(&self, sk: FlowId, bytes: i64) -> bool {
        if bytes <= 0 {
            return false;
        }
        let Some(flow) = self.table.lookup(&sk) else {
            return false;
        };

        // SAFETY: entry is live for the duration of the probe, fields are aligned
        unsafe {
            atomic_store_u64(addr_of_mut!((*flow).stats.last_update), self.kernel.ktime_ns());
            atomic_add_u64(addr_of_mut!((*flow).stats.sent_bytes), bytes as u64);
        }
        self.refresh_rtt(flow, sk);
        true
    }

    /// Account bytes consumed by the reader
    #[inline(always)]
    pub fn record_received(&self, sk: FlowId, bytes: i64) -> bool {
        if bytes <= 0 {
            return false;
        }
        let Some(flow) = self.table.lookup(&sk) else {
            return false;
        };

        unsafe {
            atomic_store_u64(addr_of_mut!((*flow).stats.last_update), self.kernel.ktime_ns());
            atomic_add_u64(addr_of_mut!((*flow).stats.recv_bytes), bytes as u64);
        }
        true
    }

    #[inline(always)]
    pub fn record_retransmit(&self, sk: FlowId, segments: i64) -> bool {
        if segments <= 0 {
            return false;
        }
        let Some(flow) = self.table.lookup(&sk) else {
            return false;
        };

        unsafe { atomic_add_u32(addr_of_mut!((*flow).tcpstats.retransmits), segments as u32) };
        true
    }

    /// Set the bit for `state` in the transition mask
    #[inline(always)]
    pub fn mark_state(&self, sk: FlowId, state: u8) -> bool {
        if state >= STATE_MASK_BITS {
            return false;
        }
        let Some(flow) = self.table.lookup(&sk) else {
            return false;
        };

        // Plain read-modify-write: the mask is only written from
        // tcp_set_state, which the kernel calls with the socket lock held.
        // Counter updates from other CPUs touch different fields.
        unsafe { (*flow).tcpstats.state_transitions |= 1u16 << state };
        true
    }

    /// Copy the kernel's current RTT estimate into the flow
    #[inline(always)]
    pub fn update_rtt(&self, sk: FlowId) -> bool {
        match self.table.lookup(&sk) {
            Some(flow) => {
                self.refresh_rtt(flow, sk);
                true
            }
            None => false,
        }
    }

    #[inline(always)]
    fn refresh_rtt(&self, flow: *mut TcpFlow, sk: FlowId) {
        // A zero srtt means no sample yet and must not clobber a good estimate
        let Some((rtt, rtt_var)) = self.kernel.rtt(sk).descale() else {
            return;
        };
        unsafe {
            atomic_store_u32(addr_of_mut!((*flow).tcpstats.rtt), rtt);
            atomic_store_u32(addr_of_mut!((*flow).tcpstats.rtt_var), rtt_var);
        }
    }

    #[inline(always)]
    pub fn contains(&self, sk: FlowId) -> bool {
        self.table.contains(&sk)
    }

    #[inline(always)]
    pub fn snapshot(&self, sk: FlowId) -> Option<TcpFlow> {
        self.table.lookup(&sk).map(|flow| unsafe { core::ptr::read(flow) })
    }

    /// Remove and return the flow
    #[inline(always)]
    pub fn evict(&self, sk: FlowId) -> Option<TcpFlow> {
        let flow = self.snapshot(sk)?;
        self.table.remove(&sk);
        Some(flow)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeKernel, FakeSock, MemTable};
    use std::{sync::Arc, thread, vec::Vec};

    const SK: FlowId = FlowId(0xffff_8880_0000_1000);

    fn kernel() -> FakeKernel {
        let kernel = FakeKernel::new();
        kernel.add_socket(
            SK,
            FakeSock::ipv4([192, 168, 1, 10], 51000, [93, 184, 216, 34], 80).with_rtt(16_000, 2_000),
        );
        kernel
    }

    fn table() -> MemTable<FlowId, TcpFlow> {
        MemTable::new(64)
    }

    #[test]
    fn test_get_or_create_captures_tuple_and_rtt() {
        let kernel = kernel();
        let table = table();
        let flows = FlowTable::new(&kernel, &table);

        assert!(flows.get_or_create(SK, AF_INET).is_some());

        let flow = flows.snapshot(SK).unwrap();
        assert_eq!(flow.tup.family, AF_INET as u8);
        assert_eq!(flow.tup.protocol, IPPROTO_TCP);
        assert_eq!(flow.tup.sport, 51000);
        assert_eq!(flow.tup.dport, 80);
        assert_eq!(&flow.tup.saddr[..4], &[192, 168, 1, 10]);
        assert_eq!(&flow.tup.daddr[..4], &[93, 184, 216, 34]);
        assert_eq!(flow.tup.tgid, 4242);
        assert_eq!(flow.tcpstats.rtt, 2_000);
        assert_eq!(flow.tcpstats.rtt_var, 500);
        assert_eq!(flow.stats.sent_bytes, 0);
        assert_eq!(flow.stats.recv_bytes, 0);
        assert_eq!(kernel.counter(STAT_FLOWS_CREATED), 1);
    }

    #[test]
    fn test_get_or_create_keeps_first_tuple() {
        let kernel = kernel();
        let table = table();
        let flows = FlowTable::new(&kernel, &table);

        let first = flows.get_or_create(SK, AF_INET).unwrap();
        kernel.add_socket(SK, FakeSock::ipv4([1, 1, 1, 1], 1, [2, 2, 2, 2], 2));
        let second = flows.get_or_create(SK, AF_INET).unwrap();

        assert_eq!(first, second);
        assert_eq!(table.len(), 1);
        assert_eq!(flows.snapshot(SK).unwrap().tup.sport, 51000);
    }

    #[test]
    fn test_get_or_create_when_full() {
        let kernel = kernel();
        let table: MemTable<FlowId, TcpFlow> = MemTable::new(0);
        let flows = FlowTable::new(&kernel, &table);

        assert!(flows.get_or_create(SK, AF_INET).is_none());
        assert_eq!(kernel.counter(STAT_INSERTS_DROPPED), 1);
    }

    #[test]
    fn test_record_sent_and_received() {
        let kernel = kernel();
        let table = table();
        let flows = FlowTable::new(&kernel, &table);
        flows.get_or_create(SK, AF_INET);
        let before = flows.snapshot(SK).unwrap().stats.last_update;

        assert!(flows.record_sent(SK, 150));
        assert!(flows.record_received(SK, 40));

        let flow = flows.snapshot(SK).unwrap();
        assert_eq!(flow.stats.sent_bytes, 150);
        assert_eq!(flow.stats.recv_bytes, 40);
        assert!(flow.stats.last_update > before);
    }

    #[test]
    fn test_non_positive_counts_are_discarded() {
        let kernel = kernel();
        let table = table();
        let flows = FlowTable::new(&kernel, &table);
        flows.get_or_create(SK, AF_INET);
        let before = flows.snapshot(SK).unwrap();

        assert!(!flows.record_sent(SK, 0));
        assert!(!flows.record_sent(SK, -32));
        assert!(!flows.record_received(SK, -1));
        assert!(!flows.record_retransmit(SK, 0));

        assert_eq!(flows.snapshot(SK).unwrap(), before);
    }

    #[test]
    fn test_untracked_updates_are_noops() {
        let kernel = kernel();
        let table = table();
        let flows = FlowTable::new(&kernel, &table);

        assert!(!flows.record_sent(SK, 10));
        assert!(!flows.record_received(SK, 10));
        assert!(!flows.record_retransmit(SK, 1));
        assert!(!flows.mark_state(SK, TCP_ESTABLISHED));
        assert!(!flows.update_rtt(SK));
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn test_retransmits_accumulate() {
        let kernel = kernel();
        let table = table();
        let flows = FlowTable::new(&kernel, &table);
        flows.get_or_create(SK, AF_INET);

        flows.record_retransmit(SK, 1);
        flows.record_retransmit(SK, 3);
        assert_eq!(flows.snapshot(SK).unwrap().tcpstats.retransmits, 4);
    }

    #[test]
    fn test_zero_rtt_sample_keeps_estimate() {
        let kernel = kernel();
        let table = table();
        let flows = FlowTable::new(&kernel, &table);
        flows.get_or_create(SK, AF_INET);

        kernel.set_rtt(SK, 0, 9_999);
        assert!(flows.update_rtt(SK));

        let stats = flows.snapshot(SK).unwrap().tcpstats;
        assert_eq!(stats.rtt, 2_000);
        assert_eq!(stats.rtt_var, 500);

        kernel.set_rtt(SK, 800, 40);
        flows.update_rtt(SK);
        let stats = flows.snapshot(SK).unwrap().tcpstats;
        assert_eq!(stats.rtt, 100);
        assert_eq!(stats.rtt_var, 10);
    }

    #[test]
    fn test_mark_state_is_idempotent() {
        let kernel = kernel();
        let table = table();
        let flows = FlowTable::new(&kernel, &table);
        flows.get_or_create(SK, AF_INET);

        flows.mark_state(SK, TCP_ESTABLISHED);
        let once = flows.snapshot(SK).unwrap().tcpstats.state_transitions;
        flows.mark_state(SK, TCP_ESTABLISHED);
        let twice = flows.snapshot(SK).unwrap().tcpstats.state_transitions;

        assert_eq!(once, 1 << TCP_ESTABLISHED);
        assert_eq!(once, twice);
        assert!(!flows.mark_state(SK, 16));
    }

    #[test]
    fn test_mark_state_accumulates_teardown_states() {
        let kernel = kernel();
        let table = table();
        let flows = FlowTable::new(&kernel, &table);
        flows.get_or_create(SK, AF_INET);

        flows.mark_state(SK, TCP_ESTABLISHED);
        flows.record_sent(SK, 10);
        flows.mark_state(SK, TCP_FIN_WAIT1);
        flows.record_retransmit(SK, 2);
        flows.mark_state(SK, TCP_FIN_WAIT2);
        flows.mark_state(SK, TCP_CLOSE);

        let flow = flows.snapshot(SK).unwrap();
        assert_eq!(
            flow.tcpstats.state_transitions,
            (1 << TCP_ESTABLISHED) | (1 << TCP_FIN_WAIT1) | (1 << TCP_FIN_WAIT2) | (1 << TCP_CLOSE)
        );
        assert_eq!(flow.stats.sent_bytes, 10);
        assert_eq!(flow.tcpstats.retransmits, 2);
    }

    #[test]
    fn test_concurrent_sends_lose_no_updates() {
        let kernel = Arc::new(kernel());
        let table = Arc::new(table());
        FlowTable::new(&*kernel, &*table).get_or_create(SK, AF_INET);

        let handles: Vec<_> = (0..8u64)
            .map(|worker| {
                let kernel = Arc::clone(&kernel);
                let table = Arc::clone(&table);
                thread::spawn(move || {
                    let flows = FlowTable::new(&*kernel, &*table);
                    for i in 0..1000u64 {
                        flows.record_sent(SK, ((worker + i) % 7 + 1) as i64);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let expected: u64 = (0..8u64)
            .flat_map(|worker| (0..1000u64).map(move |i| (worker + i) % 7 + 1))
            .sum();
        let flows = FlowTable::new(&*kernel, &*table);
        assert_eq!(flows.snapshot(SK).unwrap().stats.sent_bytes, expected);
    }
}
