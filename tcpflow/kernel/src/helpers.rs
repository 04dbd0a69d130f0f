//! Helper functions for eBPF programs
//!
//! Provides the `Kernel` environment over BPF helpers, the startup
//! configuration global and the health counters.

use aya_ebpf::{
    bindings::BPF_NOEXIST,
    helpers::{bpf_get_current_pid_tgid, bpf_ktime_get_ns},
};
use probe_common::{
    config::ProbeConfig,
    kernel::Kernel,
    table::atomic_add_u64,
    types::{FlowId, RttSample, Tuple},
};

use crate::socket_parser::*;

/// Kernel layout and feature flags, written by the loader before load
#[no_mangle]
static PROBE_CONFIG: ProbeConfig = ProbeConfig::UNCONFIGURED;

/// Get current timestamp in nanoseconds
#[inline(always)]
pub fn get_timestamp() -> u64 {
    unsafe { bpf_ktime_get_ns() }
}

/// Get the current pid_tgid
#[inline(always)]
pub fn get_pid_tgid() -> u64 {
    unsafe { bpf_get_current_pid_tgid() }
}

/// Increment a statistics counter
///
/// The very first increment of a counter may race with another CPU's and
/// lose one count; every later one is an atomic add.
#[inline(always)]
pub fn increment_stat(stat_id: u32) {
    use crate::maps::STATS;

    match STATS.get_ptr_mut(&stat_id) {
        Some(count) => unsafe { atomic_add_u64(count, 1) },
        None => {
            let _ = STATS.insert(&stat_id, &1u64, BPF_NOEXIST as u64);
        }
    }
}

/// Normalises `RetProbeContext::ret`, which returns `Option<T>` in
/// aya-ebpf 0.1.0 and `T` in later releases
pub trait RetVal<T> {
    fn into_ret(self) -> Option<T>;
}

impl<T> RetVal<T> for Option<T> {
    #[inline(always)]
    fn into_ret(self) -> Option<T> {
        self
    }
}

impl RetVal<i32> for i32 {
    #[inline(always)]
    fn into_ret(self) -> Option<i32> {
        Some(self)
    }
}

impl RetVal<u64> for u64 {
    #[inline(always)]
    fn into_ret(self) -> Option<u64> {
        Some(self)
    }
}

/// Environment seen by the tracker inside a probe
pub struct KernelEnv {
    config: ProbeConfig,
}

impl KernelEnv {
    #[inline(always)]
    pub fn load() -> Self {
        // volatile so the verifier sees the value patched in by the loader
        let config = unsafe { core::ptr::read_volatile(&PROBE_CONFIG) };
        Self { config }
    }

    #[inline(always)]
    pub fn config(&self) -> &ProbeConfig {
        &self.config
    }
}

impl Kernel for KernelEnv {
    #[inline(always)]
    fn ktime_ns(&self) -> u64 {
        get_timestamp()
    }

    #[inline(always)]
    fn pid_tgid(&self) -> u64 {
        get_pid_tgid()
    }

    #[inline(always)]
    fn netns(&self, sk: FlowId) -> u32 {
        read_netns(sk, &self.config.offsets)
    }

    #[inline(always)]
    fn family(&self, sk: FlowId) -> u16 {
        read_family(sk, &self.config.offsets)
    }

    #[inline(always)]
    fn state(&self, sk: FlowId) -> u8 {
        read_state(sk, &self.config.offsets)
    }

    #[inline(always)]
    fn protocol(&self, sk: FlowId) -> u8 {
        read_protocol(sk, &self.config.offsets, self.config.features)
    }

    #[inline(always)]
    fn rtt(&self, sk: FlowId) -> RttSample {
        read_rtt(sk, &self.config.offsets)
    }

    #[inline(always)]
    fn tuple(&self, sk: FlowId, family: u16) -> Tuple {
        read_tuple(sk, family, &self.config.offsets)
    }

    #[inline(always)]
    fn count(&self, stat: u32) {
        increment_stat(stat);
    }
}
