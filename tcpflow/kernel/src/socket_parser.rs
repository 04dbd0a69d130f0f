//! Socket structure parsing utilities
//!
//! Reads fields of the kernel `struct sock` at offsets supplied by the
//! loader. A field whose offset is unknown, or whose read faults, comes back
//! as zero.

use aya_ebpf::{helpers::bpf_probe_read_kernel, programs::ProbeContext};
use probe_common::{
    config::{KernelFeatures, SockOffsets},
    constants::*,
    types::{FlowId, RttSample, Tuple},
};

/// Extract the socket pointer from argument `n` of a kprobe context
#[inline(always)]
pub fn get_sock_from_context(ctx: &ProbeContext, n: usize) -> Result<FlowId, i64> {
    ctx.arg::<u64>(n).map(FlowId).ok_or(-1)
}

/// Read a `T` at `base + offset` in kernel memory
#[inline(always)]
fn read_at<T: Default>(base: u64, offset: u16) -> T {
    if base == 0 || offset == OFFSET_UNKNOWN {
        return T::default();
    }
    let ptr = (base + offset as u64) as *const T;
    unsafe { bpf_probe_read_kernel(ptr) }.unwrap_or_default()
}

#[inline(always)]
pub fn read_family(sk: FlowId, offsets: &SockOffsets) -> u16 {
    read_at(sk.0, offsets.skc_family)
}

#[inline(always)]
pub fn read_state(sk: FlowId, offsets: &SockOffsets) -> u8 {
    read_at(sk.0, offsets.skc_state)
}

/// Read `sk_protocol`, which is a bitfield on kernels before 5.6
#[inline(always)]
pub fn read_protocol(sk: FlowId, offsets: &SockOffsets, features: KernelFeatures) -> u8 {
    if features.sk_protocol_bitfield() {
        let flags: u32 = read_at(sk.0, offsets.sk_protocol);
        ((flags >> 8) & 0xff) as u8
    } else {
        let protocol: u16 = read_at(sk.0, offsets.sk_protocol);
        protocol as u8
    }
}

#[inline(always)]
pub fn read_rtt(sk: FlowId, offsets: &SockOffsets) -> RttSample {
    RttSample {
        srtt_us: read_at(sk.0, offsets.srtt_us),
        mdev_us: read_at(sk.0, offsets.mdev_us),
    }
}

/// Inode number of the socket's network namespace
#[inline(always)]
pub fn read_netns(sk: FlowId, offsets: &SockOffsets) -> u32 {
    let net: u64 = read_at(sk.0, offsets.skc_net);
    read_at(net, offsets.ns_inum)
}

/// Ports and addresses of the socket
///
/// `skc_num` is already host order, `skc_dport` is network order.
#[inline(always)]
pub fn read_tuple(sk: FlowId, family: u16, offsets: &SockOffsets) -> Tuple {
    let mut tup = Tuple::default();
    tup.sport = read_at(sk.0, offsets.skc_num);
    tup.dport = u16::from_be(read_at(sk.0, offsets.skc_dport));

    if family == AF_INET6 {
        tup.saddr = read_at(sk.0, offsets.skc_v6_rcv_saddr);
        tup.daddr = read_at(sk.0, offsets.skc_v6_daddr);
    } else {
        tup.saddr = widen_v4(read_at(sk.0, offsets.skc_rcv_saddr));
        tup.daddr = widen_v4(read_at(sk.0, offsets.skc_daddr));
    }
    tup
}

#[inline(always)]
fn widen_v4(addr: [u8; 4]) -> [u8; 16] {
    let mut out = [0u8; 16];
    out[0] = addr[0];
    out[1] = addr[1];
    out[2] = addr[2];
    out[3] = addr[3];
    out
}
