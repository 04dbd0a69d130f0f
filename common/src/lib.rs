//! Shared types and probe semantics for the TCP flow tracker
//!
//! This crate provides the data structures, constants and table logic
//! shared between the eBPF kernel program and the userspace loader. The
//! probe logic is written against the [`table::Table`] and
//! [`kernel::Kernel`] seams so it runs unchanged in the eBPF object and in
//! host tests.

#![cfg_attr(not(test), no_std)]

pub mod config;
pub mod constants;
pub mod correlation;
pub mod flows;
pub mod kernel;
pub mod lifecycle;
pub mod registry;
pub mod table;
pub mod types;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use config::{KernelFeatures, ProbeConfig, SockOffsets};
pub use constants::*;
pub use lifecycle::Tracker;
pub use types::{Direction, FlowId, SocketInfo, TcpCloseEvent, TcpFlow, TcpStats, Tuple};
