//! Environment reads available to a probe
//!
//! Implemented over BPF helpers in the eBPF object and by scripted fakes in
//! tests. Reads never fail: anything that cannot be read comes back as zero,
//! and callers treat zero as "unknown".

use crate::types::{FlowId, RttSample, Tuple};

pub trait Kernel {
    /// Monotonic clock in nanoseconds
    fn ktime_ns(&self) -> u64;

    /// `tgid << 32 | pid` of the current task
    fn pid_tgid(&self) -> u64;

    #[inline(always)]
    fn tgid(&self) -> u32 {
        (self.pid_tgid() >> 32) as u32
    }

    /// Network namespace inode of the socket
    fn netns(&self, sk: FlowId) -> u32;

    /// `skc_family`
    fn family(&self, sk: FlowId) -> u16;

    /// `skc_state`
    fn state(&self, sk: FlowId) -> u8;

    /// `sk_protocol`
    fn protocol(&self, sk: FlowId) -> u8;

    /// Raw smoothed RTT and mean deviation
    fn rtt(&self, sk: FlowId) -> RttSample;

    /// Ports and addresses for the given family. `protocol` and `tgid` are
    /// filled in by the caller.
    fn tuple(&self, sk: FlowId, family: u16) -> Tuple;

    /// Bump a probe-health counter (see `STAT_*`)
    #[inline(always)]
    fn count(&self, _stat: u32) {}
}
