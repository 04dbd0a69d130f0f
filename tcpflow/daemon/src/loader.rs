//! eBPF program loader
//!
//! Handles loading the eBPF object with its startup configuration and
//! attaching the TCP lifecycle kprobes.

use anyhow::{Context, Result};
use aya::{
    maps::{perf::AsyncPerfEventArray, MapData},
    programs::KProbe,
    Bpf, BpfLoader,
};
use log::{info, warn};
use probe_common::config::ProbeConfig;
use std::path::PathBuf;

/// Name of the configuration global inside the eBPF object
const CONFIG_GLOBAL: &str = "PROBE_CONFIG";

/// Result of attaching one program
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachResult {
    /// Program successfully attached
    Attached,
    /// Optional program not found or not attachable on this kernel
    Skipped,
}

/// One kprobe or kretprobe and the kernel function it hooks
#[derive(Debug, Clone, Copy)]
pub struct ProbeSpec {
    pub program: &'static str,
    pub function: &'static str,
    pub required: bool,
}

const fn required(program: &'static str, function: &'static str) -> ProbeSpec {
    ProbeSpec { program, function, required: true }
}

const fn optional(program: &'static str, function: &'static str) -> ProbeSpec {
    ProbeSpec { program, function, required: false }
}

/// Every probe in the object, in attach order
///
/// Return probes are attached before their entry halves so an entry never
/// parks a socket that no return probe will claim.
pub const PROBES: &[ProbeSpec] = &[
    required("tcp_init_sock", "tcp_init_sock"),
    required("tcp_connect", "tcp_connect"),
    required("inet_csk_listen_start_ret", "inet_csk_listen_start"),
    required("inet_csk_listen_start", "inet_csk_listen_start"),
    required("inet_csk_accept_ret", "inet_csk_accept"),
    required("inet_csk_accept", "inet_csk_accept"),
    required("tcp_sendmsg_ret", "tcp_sendmsg"),
    required("tcp_sendmsg", "tcp_sendmsg"),
    required("tcp_cleanup_rbuf", "tcp_cleanup_rbuf"),
    required("tcp_retransmit_skb", "tcp_retransmit_skb"),
    required("tcp_set_state", "tcp_set_state"),
    required("tcp_close", "tcp_close"),
    required("tcp4_seq_show", "tcp4_seq_show"),
    // lives in the ipv6 module, which may not be loaded
    optional("tcp6_seq_show", "tcp6_seq_show"),
];

/// eBPF program loader and manager
pub struct ProbeLoader {
    ebpf: Bpf,
}

impl ProbeLoader {
    /// Load eBPF program from file or embedded bytecode
    ///
    /// # Arguments
    ///
    /// * `path` - Optional path to eBPF object file. If None, uses embedded bytecode.
    /// * `config` - Offsets and feature bits written into the object before load
    ///
    /// # Returns
    ///
    /// ProbeLoader instance with loaded eBPF program
    pub fn load(path: Option<PathBuf>, config: &ProbeConfig) -> Result<Self> {
        info!("Loading eBPF program...");

        let mut loader = BpfLoader::new();
        loader.set_global(CONFIG_GLOBAL, config, true);

        let ebpf = if let Some(obj_path) = path {
            info!("Loading eBPF object from: {:?}", obj_path);
            let data = std::fs::read(&obj_path)
                .with_context(|| format!("Failed to read eBPF object file: {:?}", obj_path))?;
            loader.load(&data).context("Failed to load eBPF program")?
        } else {
            #[cfg(feature = "embedded")]
            {
                info!("Loading embedded eBPF program...");
                let data = include_bytes!(concat!(
                    env!("CARGO_MANIFEST_DIR"),
                    "/../../target/bpfel-unknown-none/release/tcpflow-probe"
                ));
                loader
                    .load(data)
                    .context("Failed to load embedded eBPF program")?
            }
            #[cfg(not(feature = "embedded"))]
            {
                anyhow::bail!(
                    "No eBPF object file provided. Use --ebpf-object or compile with 'embedded' feature"
                );
            }
        };

        info!("eBPF program loaded successfully");

        Ok(Self { ebpf })
    }

    /// Attach one program to its kernel function
    fn attach(&mut self, spec: &ProbeSpec) -> Result<AttachResult> {
        let prog = match self.ebpf.program_mut(spec.program) {
            Some(prog) => prog,
            None if spec.required => {
                anyhow::bail!("{} program not found in eBPF object", spec.program)
            }
            None => {
                warn!("  ⚠ {} program not found (optional)", spec.program);
                return Ok(AttachResult::Skipped);
            }
        };

        let program: &mut KProbe = prog
            .try_into()
            .with_context(|| format!("Failed to get {} as KProbe", spec.program))?;
        program
            .load()
            .with_context(|| format!("Failed to load {}", spec.program))?;

        match program.attach(spec.function, 0) {
            Ok(_) => {
                info!("  ✓ Attached {} to {}", spec.program, spec.function);
                Ok(AttachResult::Attached)
            }
            Err(e) if !spec.required => {
                warn!(
                    "  ⚠ Failed to attach {} (not available on this kernel): {}",
                    spec.function, e
                );
                Ok(AttachResult::Skipped)
            }
            Err(e) => Err(e)
                .with_context(|| format!("Failed to attach {} to {}", spec.program, spec.function)),
        }
    }

    /// Attach every probe in `PROBES`
    ///
    /// # Returns
    ///
    /// Number of programs attached
    pub fn attach_kprobes(&mut self) -> Result<usize> {
        info!("Attaching kprobes for TCP flow tracking...");

        let mut attached = 0;
        for spec in PROBES {
            if self.attach(spec)? == AttachResult::Attached {
                attached += 1;
            }
        }

        info!("{} of {} probes attached", attached, PROBES.len());
        Ok(attached)
    }

    /// Get the perf event array carrying closed-flow events
    ///
    /// # Returns
    ///
    /// AsyncPerfEventArray for reading `TcpCloseEvent`s from the kernel
    pub fn take_close_events(&mut self) -> Result<AsyncPerfEventArray<MapData>> {
        let map = self
            .ebpf
            .take_map("TCP_CLOSE_EVENTS")
            .context("TCP_CLOSE_EVENTS map not found in eBPF object")?;

        AsyncPerfEventArray::try_from(map)
            .context("Failed to create AsyncPerfEventArray from TCP_CLOSE_EVENTS map")
    }

    /// Get reference to the eBPF object
    ///
    /// Used by the snapshot reader to access the flow tables.
    pub fn ebpf(&self) -> &Bpf {
        &self.ebpf
    }
}
