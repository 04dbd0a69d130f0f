//! Shared constants for the TCP flow probes
//!
//! These constants are used by both kernel and userspace programs
//! to ensure consistency in behavior and limits.

// ============================================================================
// BPF Map Sizes
// ============================================================================

/// Maximum number of sockets tracked in the socket registry
pub const MAX_OPEN_SOCKETS: u32 = 1024;

/// Maximum number of TCP flows tracked in the flow table
pub const MAX_FLOWS: u32 = 1024;

/// Maximum number of pending entry/return correlations per hook pair
pub const MAX_PENDING_CALLS: u32 = 1024;

// ============================================================================
// Address Families (from linux/socket.h)
// ============================================================================

/// IPv4 address family
pub const AF_INET: u16 = 2;

/// IPv6 address family
pub const AF_INET6: u16 = 10;

// ============================================================================
// Protocol Numbers (from linux/in.h)
// ============================================================================

/// TCP protocol number
pub const IPPROTO_TCP: u8 = 6;

/// UDP protocol number
pub const IPPROTO_UDP: u8 = 17;

// ============================================================================
// TCP States (from include/net/tcp_states.h)
// ============================================================================

pub const TCP_ESTABLISHED: u8 = 1;
pub const TCP_SYN_SENT: u8 = 2;
pub const TCP_SYN_RECV: u8 = 3;
pub const TCP_FIN_WAIT1: u8 = 4;
pub const TCP_FIN_WAIT2: u8 = 5;
pub const TCP_TIME_WAIT: u8 = 6;
pub const TCP_CLOSE: u8 = 7;
pub const TCP_CLOSE_WAIT: u8 = 8;
pub const TCP_LAST_ACK: u8 = 9;
pub const TCP_LISTEN: u8 = 10;
pub const TCP_CLOSING: u8 = 11;
pub const TCP_NEW_SYN_RECV: u8 = 12;

/// Number of states representable in `TcpStats::state_transitions`
pub const STATE_MASK_BITS: u8 = 16;

// ============================================================================
// Passive Enumeration
// ============================================================================

/// `SEQ_START_TOKEN` as passed to `tcp{4,6}_seq_show` for the header line
pub const SEQ_START_TOKEN: u64 = 1;

// ============================================================================
// RTT Descaling (see tcp_get_info in net/ipv4/tcp.c)
// ============================================================================

/// `srtt_us` is stored left-shifted by 3
pub const SRTT_SHIFT: u32 = 3;

/// `mdev_us` is stored left-shifted by 2
pub const MDEV_SHIFT: u32 = 2;

// ============================================================================
// Kernel Feature Bits (for ProbeConfig.features)
// ============================================================================

/// `tcp_retransmit_skb` takes a segment count as its third argument (>= 4.7)
pub const FEATURE_RETRANSMIT_SEGS_ARG: u32 = 1 << 0;

/// `sk_protocol` is an 8-bit bitfield in the flags word (< 5.6)
pub const FEATURE_SK_PROTOCOL_BITFIELD: u32 = 1 << 1;

/// Offset value meaning "field not available on this kernel"
pub const OFFSET_UNKNOWN: u16 = u16::MAX;

// ============================================================================
// Statistics Counter Indices (for STATS map)
// ============================================================================

/// Total number of probe invocations that reached the tracker
pub const STAT_TOTAL_EVENTS: u32 = 0;

/// Sockets inserted into the registry
pub const STAT_SOCKETS_REGISTERED: u32 = 1;

/// Flows inserted into the flow table
pub const STAT_FLOWS_CREATED: u32 = 2;

/// Inserts refused because a table was full
pub const STAT_INSERTS_DROPPED: u32 = 3;

/// Return probes that found no pending entry
pub const STAT_CORRELATION_MISSES: u32 = 4;

/// Events skipped for an address family other than IPv4/IPv6
pub const STAT_UNSUPPORTED_FAMILY: u32 = 5;

/// Flows created by passive enumeration
pub const STAT_ENUMERATED_FLOWS: u32 = 6;

/// Close events emitted
pub const STAT_FLOWS_CLOSED: u32 = 7;

/// Total number of statistics counters
pub const MAX_STATS: u32 = 8;
