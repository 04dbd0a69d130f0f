//! In-memory tables and a scripted kernel for host tests

use crate::{
    constants::*,
    kernel::Kernel,
    lifecycle::Tracker,
    table::{Insert, InsertMode, Table},
    types::*,
};
use std::{
    boxed::Box,
    collections::HashMap,
    hash::Hash,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
};

/// Bounded map with address-stable values, standing in for a BPF hash map
pub struct MemTable<K, V> {
    entries: Mutex<HashMap<K, Box<V>>>,
    capacity: usize,
}

impl<K: Eq + Hash + Copy, V: Copy> MemTable<K, V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.entries.lock().unwrap().get(key).map(|v| **v)
    }
}

impl<K: Eq + Hash + Copy, V: Copy> Table<K, V> for MemTable<K, V> {
    fn lookup(&self, key: &K) -> Option<*mut V> {
        let mut entries = self.entries.lock().unwrap();
        entries.get_mut(key).map(|v| &mut **v as *mut V)
    }

    fn insert(&self, key: &K, value: &V, mode: InsertMode) -> Insert {
        let mut entries = self.entries.lock().unwrap();
        if let Some(existing) = entries.get_mut(key) {
            return match mode {
                InsertMode::NoExist => Insert::Exists,
                InsertMode::Any => {
                    **existing = *value;
                    Insert::Inserted
                }
            };
        }
        if entries.len() >= self.capacity {
            return Insert::Dropped;
        }
        entries.insert(*key, Box::new(*value));
        Insert::Inserted
    }

    fn remove(&self, key: &K) {
        self.entries.lock().unwrap().remove(key);
    }
}

/// Kernel-side view of one fake socket
#[derive(Clone, Copy, Debug, Default)]
pub struct FakeSock {
    pub family: u16,
    pub state: u8,
    pub protocol: u8,
    pub netns: u32,
    pub rtt: RttSample,
    pub sport: u16,
    pub dport: u16,
    pub saddr: [u8; 16],
    pub daddr: [u8; 16],
}

impl FakeSock {
    pub fn ipv4(saddr: [u8; 4], sport: u16, daddr: [u8; 4], dport: u16) -> Self {
        let mut sock = FakeSock {
            family: AF_INET,
            state: TCP_ESTABLISHED,
            protocol: IPPROTO_TCP,
            netns: 4026531840,
            sport,
            dport,
            ..Default::default()
        };
        sock.saddr[..4].copy_from_slice(&saddr);
        sock.daddr[..4].copy_from_slice(&daddr);
        sock
    }

    pub fn ipv6(saddr: [u8; 16], sport: u16, daddr: [u8; 16], dport: u16) -> Self {
        FakeSock {
            family: AF_INET6,
            state: TCP_ESTABLISHED,
            protocol: IPPROTO_TCP,
            netns: 4026531840,
            sport,
            dport,
            saddr,
            daddr,
            ..Default::default()
        }
    }

    pub fn with_state(mut self, state: u8) -> Self {
        self.state = state;
        self
    }

    pub fn with_rtt(mut self, srtt_us: u32, mdev_us: u32) -> Self {
        self.rtt = RttSample { srtt_us, mdev_us };
        self
    }
}

/// Scripted kernel: a ticking clock, a switchable current thread and a
/// registry of fake sockets. Unknown sockets read as all zeroes.
pub struct FakeKernel {
    clock: AtomicU64,
    pid_tgid: AtomicU64,
    sockets: Mutex<HashMap<FlowId, FakeSock>>,
    counters: Mutex<HashMap<u32, u64>>,
}

impl FakeKernel {
    pub const DEFAULT_PID_TGID: u64 = (4242 << 32) | 4242;

    pub fn new() -> Self {
        Self {
            clock: AtomicU64::new(1_000_000),
            pid_tgid: AtomicU64::new(Self::DEFAULT_PID_TGID),
            sockets: Mutex::new(HashMap::new()),
            counters: Mutex::new(HashMap::new()),
        }
    }

    pub fn add_socket(&self, sk: FlowId, sock: FakeSock) {
        self.sockets.lock().unwrap().insert(sk, sock);
    }

    pub fn set_rtt(&self, sk: FlowId, srtt_us: u32, mdev_us: u32) {
        if let Some(sock) = self.sockets.lock().unwrap().get_mut(&sk) {
            sock.rtt = RttSample { srtt_us, mdev_us };
        }
    }

    pub fn set_current(&self, pid_tgid: u64) {
        self.pid_tgid.store(pid_tgid, Ordering::SeqCst);
    }

    pub fn now(&self) -> u64 {
        self.clock.load(Ordering::SeqCst)
    }

    pub fn counter(&self, stat: u32) -> u64 {
        self.counters.lock().unwrap().get(&stat).copied().unwrap_or(0)
    }

    fn sock(&self, sk: FlowId) -> FakeSock {
        self.sockets.lock().unwrap().get(&sk).copied().unwrap_or_default()
    }
}

impl Kernel for FakeKernel {
    fn ktime_ns(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn pid_tgid(&self) -> u64 {
        self.pid_tgid.load(Ordering::SeqCst)
    }

    fn netns(&self, sk: FlowId) -> u32 {
        self.sock(sk).netns
    }

    fn family(&self, sk: FlowId) -> u16 {
        self.sock(sk).family
    }

    fn state(&self, sk: FlowId) -> u8 {
        self.sock(sk).state
    }

    fn protocol(&self, sk: FlowId) -> u8 {
        self.sock(sk).protocol
    }

    fn rtt(&self, sk: FlowId) -> RttSample {
        self.sock(sk).rtt
    }

    fn tuple(&self, sk: FlowId, _family: u16) -> Tuple {
        let sock = self.sock(sk);
        Tuple {
            sport: sock.sport,
            dport: sock.dport,
            saddr: sock.saddr,
            daddr: sock.daddr,
            ..Default::default()
        }
    }

    fn count(&self, stat: u32) {
        *self.counters.lock().unwrap().entry(stat).or_insert(0) += 1;
    }
}

pub type ArgsTable = MemTable<u64, FlowId>;

/// A full set of tables plus kernel, wired the way the eBPF object wires them
pub struct Fixture {
    pub kernel: FakeKernel,
    pub sockets: MemTable<FlowId, SocketInfo>,
    pub flows: MemTable<FlowId, TcpFlow>,
    pub listen_args: ArgsTable,
    pub accept_args: ArgsTable,
    pub sendmsg_args: ArgsTable,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_capacity(MAX_FLOWS as usize)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            kernel: FakeKernel::new(),
            sockets: MemTable::new(capacity),
            flows: MemTable::new(capacity),
            listen_args: MemTable::new(capacity),
            accept_args: MemTable::new(capacity),
            sendmsg_args: MemTable::new(capacity),
        }
    }

    pub fn tracker(
        &self,
    ) -> Tracker<'_, FakeKernel, MemTable<FlowId, SocketInfo>, MemTable<FlowId, TcpFlow>, ArgsTable>
    {
        Tracker::new(
            &self.kernel,
            &self.sockets,
            &self.flows,
            &self.listen_args,
            &self.accept_args,
            &self.sendmsg_args,
        )
    }
}
