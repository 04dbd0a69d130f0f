//! Startup configuration pushed into the eBPF object
//!
//! The daemon resolves the kernel layout once and writes it into the
//! read-only `PROBE_CONFIG` global before the object is loaded. Probes only
//! ever read it.

use crate::constants::*;

/// Byte offsets of the kernel fields the probes read
///
/// `sock_common` fields are relative to `struct sock`, `srtt_us`/`mdev_us`
/// to `struct tcp_sock` (which starts with `struct sock`), and `ns_inum` to
/// `struct net`. `OFFSET_UNKNOWN` disables a read.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SockOffsets {
    pub skc_daddr: u16,
    pub skc_rcv_saddr: u16,
    pub skc_dport: u16,
    pub skc_num: u16,
    pub skc_family: u16,
    pub skc_state: u16,
    pub skc_net: u16,
    pub skc_v6_daddr: u16,
    pub skc_v6_rcv_saddr: u16,
    pub sk_protocol: u16,
    pub srtt_us: u16,
    pub mdev_us: u16,
    pub ns_inum: u16,
    pub _padding: u16,
}

impl SockOffsets {
    /// The `sock_common` head, unchanged on 64-bit kernels since 4.x.
    /// Everything past it depends on the build and must be supplied.
    pub const DEFAULT: SockOffsets = SockOffsets {
        skc_daddr: 0,
        skc_rcv_saddr: 4,
        skc_dport: 12,
        skc_num: 14,
        skc_family: 16,
        skc_state: 18,
        skc_net: 48,
        skc_v6_daddr: 56,
        skc_v6_rcv_saddr: 72,
        sk_protocol: OFFSET_UNKNOWN,
        srtt_us: OFFSET_UNKNOWN,
        mdev_us: OFFSET_UNKNOWN,
        ns_inum: OFFSET_UNKNOWN,
        _padding: 0,
    };
}

impl Default for SockOffsets {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Kernel capability flags
#[repr(transparent)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct KernelFeatures(pub u32);

impl KernelFeatures {
    /// Derive the feature set from a kernel version
    pub fn for_version(major: u32, minor: u32) -> Self {
        let mut bits = 0;
        if (major, minor) >= (4, 7) {
            bits |= FEATURE_RETRANSMIT_SEGS_ARG;
        }
        if (major, minor) < (5, 6) {
            bits |= FEATURE_SK_PROTOCOL_BITFIELD;
        }
        KernelFeatures(bits)
    }

    #[inline(always)]
    pub fn retransmit_segs_arg(self) -> bool {
        self.0 & FEATURE_RETRANSMIT_SEGS_ARG != 0
    }

    #[inline(always)]
    pub fn sk_protocol_bitfield(self) -> bool {
        self.0 & FEATURE_SK_PROTOCOL_BITFIELD != 0
    }
}

/// Configuration global shared with the eBPF object
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProbeConfig {
    pub offsets: SockOffsets,
    pub features: KernelFeatures,
}

impl ProbeConfig {
    /// Value compiled into the object before the daemon overrides it
    pub const UNCONFIGURED: ProbeConfig = ProbeConfig {
        offsets: SockOffsets::DEFAULT,
        features: KernelFeatures(0),
    };
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self::UNCONFIGURED
    }
}

const _: () = {
    assert!(core::mem::size_of::<SockOffsets>() == 28);
    assert!(core::mem::size_of::<ProbeConfig>() == 32);
};

#[cfg(feature = "userspace")]
unsafe impl aya::Pod for ProbeConfig {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_features_old_kernel() {
        let features = KernelFeatures::for_version(4, 4);
        assert!(!features.retransmit_segs_arg());
        assert!(features.sk_protocol_bitfield());
    }

    #[test]
    fn test_features_boundaries() {
        assert!(KernelFeatures::for_version(4, 7).retransmit_segs_arg());
        assert!(KernelFeatures::for_version(5, 5).sk_protocol_bitfield());
        assert!(!KernelFeatures::for_version(5, 6).sk_protocol_bitfield());
    }

    #[test]
    fn test_features_modern_kernel() {
        let features = KernelFeatures::for_version(6, 1);
        assert!(features.retransmit_segs_arg());
        assert!(!features.sk_protocol_bitfield());
    }
}
