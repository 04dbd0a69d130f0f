//! Socket registry
//!
//! One `SocketInfo` per tracked socket, created the first time any probe
//! sees the socket. Removal belongs to the close path.

use crate::{
    constants::*,
    kernel::Kernel,
    table::{Insert, InsertMode, Table},
    types::{Direction, FlowId, SocketInfo},
};

pub struct SocketRegistry<'a, K, T> {
    kernel: &'a K,
    table: &'a T,
}

impl<'a, K, T> SocketRegistry<'a, K, T>
where
    K: Kernel,
    T: Table<FlowId, SocketInfo>,
{
    pub fn new(kernel: &'a K, table: &'a T) -> Self {
        Self { kernel, table }
    }

    /// Insert a fresh `SocketInfo` unless one already exists
    #[inline(always)]
    pub fn register(&self, sk: FlowId, direction: Direction) -> Insert {
        let info = SocketInfo {
            created_ns: self.kernel.ktime_ns(),
            tgid: self.kernel.tgid(),
            netns: self.kernel.netns(sk),
            direction: direction as u8,
            family: self.kernel.family(sk) as u8,
            protocol: IPPROTO_TCP,
            _padding: [0; 5],
        };

        let outcome = self.table.insert(&sk, &info, InsertMode::NoExist);
        match outcome {
            Insert::Inserted => self.kernel.count(STAT_SOCKETS_REGISTERED),
            Insert::Dropped => self.kernel.count(STAT_INSERTS_DROPPED),
            Insert::Exists => {}
        }
        outcome
    }

    /// Set the direction of a registered socket in place
    ///
    /// Returns false if the socket is untracked. `Direction::Unknown` is
    /// never written, so a known direction cannot regress.
    #[inline(always)]
    pub fn set_direction(&self, sk: FlowId, direction: Direction) -> bool {
        if direction == Direction::Unknown {
            return false;
        }
        match self.table.lookup(&sk) {
            Some(info) => {
                // SAFETY: entry is live for the duration of the probe
                unsafe { (*info).direction = direction as u8 };
                true
            }
            None => false,
        }
    }

    /// Like `set_direction`, but only while the direction is still unknown
    #[inline(always)]
    pub fn promote(&self, sk: FlowId, direction: Direction) -> bool {
        match self.table.lookup(&sk) {
            Some(info) if unsafe { (*info).direction } == Direction::Unknown as u8 => {
                self.set_direction(sk, direction)
            }
            _ => false,
        }
    }

    #[inline(always)]
    pub fn contains(&self, sk: FlowId) -> bool {
        self.table.contains(&sk)
    }

    #[inline(always)]
    pub fn get(&self, sk: FlowId) -> Option<SocketInfo> {
        self.table.lookup(&sk).map(|info| unsafe { core::ptr::read(info) })
    }

    /// Remove and return the entry
    #[inline(always)]
    pub fn evict(&self, sk: FlowId) -> Option<SocketInfo> {
        let info = self.get(sk)?;
        self.table.remove(&sk);
        Some(info)
    }
}
