//! BPF map definitions for TCP flow tracking
//!
//! Defines the shared tables read by userspace, the per-thread correlation
//! tables bridging kprobes to their kretprobes, and the close-event channel.

use aya_ebpf::{
    bindings::{BPF_ANY, BPF_NOEXIST},
    cty::c_long,
    macros::map,
    maps::{HashMap, PerfEventArray},
};
use probe_common::{
    constants::*,
    table::{Insert, InsertMode, Table},
    types::*,
};

/// Socket registry
///
/// Key: FlowId (struct sock address)
/// Value: SocketInfo
#[map]
pub static OPEN_SOCKS: HashMap<FlowId, SocketInfo> =
    HashMap::with_max_entries(MAX_OPEN_SOCKETS, 0);

/// Flow table
///
/// Key: FlowId (struct sock address)
/// Value: TcpFlow (tuple + running statistics)
#[map]
pub static FLOWS: HashMap<FlowId, TcpFlow> =
    HashMap::with_max_entries(MAX_FLOWS, 0);

/// Pending inet_csk_listen_start calls, keyed by pid_tgid
#[map]
pub static LISTEN_START_ARGS: HashMap<u64, FlowId> =
    HashMap::with_max_entries(MAX_PENDING_CALLS, 0);

/// Pending inet_csk_accept calls, keyed by pid_tgid
#[map]
pub static ACCEPT_ARGS: HashMap<u64, FlowId> =
    HashMap::with_max_entries(MAX_PENDING_CALLS, 0);

/// Pending tcp_sendmsg calls, keyed by pid_tgid
#[map]
pub static SENDMSG_ARGS: HashMap<u64, FlowId> =
    HashMap::with_max_entries(MAX_PENDING_CALLS, 0);

/// Perf event array carrying final flow snapshots to userspace
#[map]
pub static TCP_CLOSE_EVENTS: PerfEventArray<TcpCloseEvent> =
    PerfEventArray::new(0);

/// Statistics counter map
///
/// Tracks probe health for the daemon's report.
/// Key: stat_id (see STAT_* constants)
/// Value: u64 counter
#[map]
pub static STATS: HashMap<u32, u64> =
    HashMap::with_max_entries(MAX_STATS, 0);

const EEXIST: c_long = -17;

/// `Table` view of a BPF hash map
pub struct BpfTable<K: 'static, V: 'static>(pub &'static HashMap<K, V>);

impl<K, V> Table<K, V> for BpfTable<K, V> {
    #[inline(always)]
    fn lookup(&self, key: &K) -> Option<*mut V> {
        self.0.get_ptr_mut(key)
    }

    #[inline(always)]
    fn insert(&self, key: &K, value: &V, mode: InsertMode) -> Insert {
        let flags = match mode {
            InsertMode::Any => BPF_ANY as u64,
            InsertMode::NoExist => BPF_NOEXIST as u64,
        };
        match self.0.insert(key, value, flags) {
            Ok(()) => Insert::Inserted,
            Err(EEXIST) => Insert::Exists,
            Err(_) => Insert::Dropped,
        }
    }

    #[inline(always)]
    fn remove(&self, key: &K) {
        let _ = self.0.remove(key);
    }
}
