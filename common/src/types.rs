//! Shared data structures between kernel and userspace
//!
//! These structures must be repr(C) to ensure consistent memory layout
//! between eBPF programs and userspace code. Padding is always explicit
//! so map values never carry uninitialised bytes.

use crate::constants::*;

/// Identity of one in-kernel connection object
///
/// Wraps the address of the kernel `struct sock`. The address is stable for
/// the lifetime of the socket but may be handed out again once the socket is
/// freed, so a stale entry can alias a new socket. Tables evict on close to
/// bound that window.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FlowId(pub u64);

impl FlowId {
    pub const NULL: FlowId = FlowId(0);

    #[inline(always)]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// Traffic direction of a socket
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Unknown = 0,
    Incoming = 1,
    Outgoing = 2,
}

impl Direction {
    /// Decode a direction byte read from a map
    ///
    /// Any value outside the known set decodes as `Unknown`.
    #[inline(always)]
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Direction::Incoming,
            2 => Direction::Outgoing,
            _ => Direction::Unknown,
        }
    }
}

/// Per-socket bookkeeping held in the socket registry
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SocketInfo {
    /// Monotonic creation timestamp (nanoseconds)
    pub created_ns: u64,
    /// Owning process (thread group) id
    pub tgid: u32,
    /// Network namespace inode number (0 if unreadable)
    pub netns: u32,
    /// Raw `Direction`
    pub direction: u8,
    /// Address family, when known at registration
    pub family: u8,
    /// Transport protocol
    pub protocol: u8,
    pub _padding: [u8; 5],
}

impl SocketInfo {
    #[inline(always)]
    pub fn direction(&self) -> Direction {
        Direction::from_raw(self.direction)
    }
}

/// Connection tuple
///
/// Ports are in host byte order. Addresses are in network byte order; an
/// IPv4 address occupies the first 4 bytes and the rest stay zero.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Tuple {
    pub family: u8,
    pub protocol: u8,
    pub sport: u16,
    pub dport: u16,
    pub _padding: [u8; 2],
    /// Process that owned the flow when the tuple was captured
    pub tgid: u32,
    pub saddr: [u8; 16],
    pub daddr: [u8; 16],
    pub _reserved: u32,
}

/// Running byte counters of a flow
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FlowStats {
    /// Timestamp of the most recently written update (nanoseconds)
    pub last_update: u64,
    pub sent_bytes: u64,
    pub recv_bytes: u64,
}

/// TCP-specific statistics of a flow
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TcpStats {
    pub retransmits: u32,
    /// Smoothed RTT (microseconds)
    pub rtt: u32,
    /// RTT mean deviation (microseconds)
    pub rtt_var: u32,
    /// Bit `i` is set once the connection has entered TCP state `i`
    pub state_transitions: u16,
    pub _padding: [u8; 2],
}

impl TcpStats {
    #[inline(always)]
    pub fn has_state(&self, state: u8) -> bool {
        state < STATE_MASK_BITS && self.state_transitions & (1u16 << state) != 0
    }
}

/// One tracked TCP connection
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TcpFlow {
    pub tup: Tuple,
    pub stats: FlowStats,
    pub tcpstats: TcpStats,
}

/// Raw RTT state as kept by the kernel's smoothing code
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RttSample {
    /// `tcp_sock::srtt_us`, scaled by 8
    pub srtt_us: u32,
    /// `tcp_sock::mdev_us`, scaled by 4
    pub mdev_us: u32,
}

impl RttSample {
    /// Descaled `(rtt, rtt_var)`, or `None` if no RTT has been measured yet
    #[inline(always)]
    pub fn descale(&self) -> Option<(u32, u32)> {
        if self.srtt_us == 0 {
            return None;
        }
        Some((self.srtt_us >> SRTT_SHIFT, self.mdev_us >> MDEV_SHIFT))
    }
}

/// Final snapshot of a TCP flow, emitted when the socket closes
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct TcpCloseEvent {
    pub skp: FlowId,
    pub flow: TcpFlow,
    pub skinfo: SocketInfo,
}

/// Final snapshot of a UDP socket
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct UdpCloseEvent {
    pub skp: FlowId,
    pub skinfo: SocketInfo,
}

// Compile-time layout checks
// These will fail to compile if a size or alignment drifts
const _: () = {
    assert!(core::mem::size_of::<FlowId>() == 8);
    assert!(core::mem::size_of::<SocketInfo>() == 24);
    assert!(core::mem::size_of::<Tuple>() == 48);
    assert!(core::mem::size_of::<FlowStats>() == 24);
    assert!(core::mem::size_of::<TcpStats>() == 16);
    assert!(core::mem::size_of::<TcpFlow>() == 88);
    assert!(core::mem::size_of::<TcpCloseEvent>() == 120);
    assert!(core::mem::size_of::<UdpCloseEvent>() == 32);
    assert!(core::mem::size_of::<TcpFlow>() % core::mem::align_of::<TcpFlow>() == 0);
    assert!(core::mem::size_of::<TcpCloseEvent>() % core::mem::align_of::<TcpCloseEvent>() == 0);
};

// Implement Aya's Pod trait for userspace usage
#[cfg(feature = "userspace")]
mod userspace_impls {
    use super::*;

    // Pod trait implementations for reading maps and perf buffers in userspace
    unsafe impl aya::Pod for FlowId {}
    unsafe impl aya::Pod for SocketInfo {}
    unsafe impl aya::Pod for Tuple {}
    unsafe impl aya::Pod for TcpFlow {}
    unsafe impl aya::Pod for TcpCloseEvent {}
    unsafe impl aya::Pod for UdpCloseEvent {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rtt_descale() {
        let sample = RttSample { srtt_us: 8_000, mdev_us: 400 };
        assert_eq!(sample.descale(), Some((1_000, 100)));
    }

    #[test]
    fn test_rtt_zero_sample_is_unmeasured() {
        let sample = RttSample { srtt_us: 0, mdev_us: 400 };
        assert_eq!(sample.descale(), None);
    }

    #[test]
    fn test_direction_from_raw() {
        assert_eq!(Direction::from_raw(0), Direction::Unknown);
        assert_eq!(Direction::from_raw(1), Direction::Incoming);
        assert_eq!(Direction::from_raw(2), Direction::Outgoing);
        assert_eq!(Direction::from_raw(9), Direction::Unknown);
    }

    #[test]
    fn test_has_state() {
        let stats = TcpStats {
            state_transitions: 1 << TCP_ESTABLISHED,
            ..Default::default()
        };
        assert!(stats.has_state(TCP_ESTABLISHED));
        assert!(!stats.has_state(TCP_CLOSE));
        assert!(!stats.has_state(20));
    }
}
