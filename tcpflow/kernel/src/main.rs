//! eBPF TCP Flow Probe - Kernel Space Program
//!
//! This eBPF program follows the TCP connection lifecycle inside the kernel
//! and keeps per-connection statistics in shared maps that the userspace
//! daemon reads. It never alters socket behavior.
//!
//! ## Architecture
//!
//! ```text
//! tcp_init_sock / tcp_connect / listen / accept -> OPEN_SOCKS (direction)
//!                  |
//!                  v
//! tcp_set_state(ESTABLISHED), tcp{4,6}_seq_show -> FLOWS (tuple, RTT)
//!                  |
//!                  v
//! tcp_sendmsg / tcp_cleanup_rbuf / retransmit   -> FLOWS (counters)
//!                  |
//!                  v
//! tcp_set_state(CLOSE) -> TCP_CLOSE_EVENTS -> userspace
//! ```
//!
//! ## Usage
//!
//! This program must be compiled for the bpfel-unknown-none target:
//!
//! ```bash
//! cargo build --release --target=bpfel-unknown-none
//! ```
//!
//! The compiled bytecode is then loaded by the userspace program.

#![no_std]
#![no_main]

mod handlers;
mod helpers;
mod maps;
mod socket_parser;

// Re-export probe functions so they're visible to the loader
pub use handlers::{
    inet_csk_accept, inet_csk_accept_ret, inet_csk_listen_start, inet_csk_listen_start_ret,
    tcp4_seq_show, tcp6_seq_show, tcp_cleanup_rbuf, tcp_close, tcp_connect, tcp_init_sock,
    tcp_retransmit_skb, tcp_sendmsg, tcp_sendmsg_ret, tcp_set_state,
};

// Re-export maps for verification
pub use maps::{
    ACCEPT_ARGS, FLOWS, LISTEN_START_ARGS, OPEN_SOCKS, SENDMSG_ARGS, STATS, TCP_CLOSE_EVENTS,
};

#[cfg(not(test))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    // eBPF programs cannot panic - this should never be reached
    // The verifier should catch any potential panics
    loop {}
}
