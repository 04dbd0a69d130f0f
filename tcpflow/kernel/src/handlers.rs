//! Kprobe handlers for TCP flow tracking
//!
//! Each handler decodes its arguments from the probe context and hands them
//! to the shared `Tracker`. Handlers only fail when an argument cannot be
//! read; every other outcome returns 0.

use aya_ebpf::{
    macros::{kprobe, kretprobe},
    programs::{ProbeContext, RetProbeContext},
};
use probe_common::{
    constants::*,
    lifecycle::Tracker,
    types::{FlowId, SocketInfo, TcpFlow},
};

use crate::{
    helpers::*,
    maps::*,
    socket_parser::*,
};

type Probes<'a> = Tracker<
    'a,
    KernelEnv,
    BpfTable<FlowId, SocketInfo>,
    BpfTable<FlowId, TcpFlow>,
    BpfTable<u64, FlowId>,
>;

/// Build a tracker over the shared maps and run `f` against it
#[inline(always)]
fn with_tracker<R>(f: impl FnOnce(&Probes<'_>) -> R) -> R {
    increment_stat(STAT_TOTAL_EVENTS);

    let env = KernelEnv::load();
    let sockets = BpfTable(&OPEN_SOCKS);
    let flows = BpfTable(&FLOWS);
    let listen_args = BpfTable(&LISTEN_START_ARGS);
    let accept_args = BpfTable(&ACCEPT_ARGS);
    let sendmsg_args = BpfTable(&SENDMSG_ARGS);

    let tracker = Tracker::new(&env, &sockets, &flows, &listen_args, &accept_args, &sendmsg_args);
    f(&tracker)
}

// socket OPEN

/// Attached to: tcp_init_sock
#[kprobe]
pub fn tcp_init_sock(ctx: ProbeContext) -> u32 {
    match try_tcp_init_sock(&ctx) {
        Ok(ret) => ret,
        Err(_) => 1,
    }
}

fn try_tcp_init_sock(ctx: &ProbeContext) -> Result<u32, i64> {
    let sk = get_sock_from_context(ctx, 0)?;
    with_tracker(|t| t.on_init_sock(sk));
    Ok(0)
}

// socket CONNECT

/// Attached to: tcp_connect
#[kprobe]
pub fn tcp_connect(ctx: ProbeContext) -> u32 {
    match try_tcp_connect(&ctx) {
        Ok(ret) => ret,
        Err(_) => 1,
    }
}

fn try_tcp_connect(ctx: &ProbeContext) -> Result<u32, i64> {
    let sk = get_sock_from_context(ctx, 0)?;
    with_tracker(|t| t.on_connect(sk));
    Ok(0)
}

// socket LISTEN

/// Attached to: inet_csk_listen_start
#[kprobe]
pub fn inet_csk_listen_start(ctx: ProbeContext) -> u32 {
    match try_inet_csk_listen_start(&ctx) {
        Ok(ret) => ret,
        Err(_) => 1,
    }
}

fn try_inet_csk_listen_start(ctx: &ProbeContext) -> Result<u32, i64> {
    let sk = get_sock_from_context(ctx, 0)?;
    with_tracker(|t| t.on_listen_start(sk));
    Ok(0)
}

/// Attached to: inet_csk_listen_start (return)
#[kretprobe]
pub fn inet_csk_listen_start_ret(_ctx: RetProbeContext) -> u32 {
    with_tracker(|t| t.on_listen_start_return());
    0
}

// socket ACCEPT

/// Attached to: inet_csk_accept
#[kprobe]
pub fn inet_csk_accept(ctx: ProbeContext) -> u32 {
    match try_inet_csk_accept(&ctx) {
        Ok(ret) => ret,
        Err(_) => 1,
    }
}

fn try_inet_csk_accept(ctx: &ProbeContext) -> Result<u32, i64> {
    let sk = get_sock_from_context(ctx, 0)?;
    with_tracker(|t| t.on_accept(sk));
    Ok(0)
}

/// Attached to: inet_csk_accept (return)
///
/// The return value is the newly accepted socket, or NULL.
#[kretprobe]
pub fn inet_csk_accept_ret(ctx: RetProbeContext) -> u32 {
    // an unreadable return value still has to release the pending entry
    let newsk = ctx.ret::<u64>().into_ret().map(FlowId).unwrap_or(FlowId::NULL);
    with_tracker(|t| t.on_accept_return(newsk));
    0
}

// socket SEND

/// Attached to: tcp_sendmsg
#[kprobe]
pub fn tcp_sendmsg(ctx: ProbeContext) -> u32 {
    match try_tcp_sendmsg(&ctx) {
        Ok(ret) => ret,
        Err(_) => 1,
    }
}

fn try_tcp_sendmsg(ctx: &ProbeContext) -> Result<u32, i64> {
    let sk = get_sock_from_context(ctx, 0)?;
    with_tracker(|t| t.on_sendmsg(sk));
    Ok(0)
}

/// Attached to: tcp_sendmsg (return)
///
/// The return value is the number of bytes copied, or a negative errno.
#[kretprobe]
pub fn tcp_sendmsg_ret(ctx: RetProbeContext) -> u32 {
    let copied = ctx.ret::<i32>().into_ret().unwrap_or(0);
    with_tracker(|t| t.on_sendmsg_return(copied as i64));
    0
}

// socket RECV

/// Attached to: tcp_cleanup_rbuf
///
/// Called after the reader consumed `copied` bytes.
#[kprobe]
pub fn tcp_cleanup_rbuf(ctx: ProbeContext) -> u32 {
    match try_tcp_cleanup_rbuf(&ctx) {
        Ok(ret) => ret,
        Err(_) => 1,
    }
}

fn try_tcp_cleanup_rbuf(ctx: &ProbeContext) -> Result<u32, i64> {
    let copied = ctx.arg::<i32>(1).ok_or(-1)?;
    if copied <= 0 {
        return Ok(0);
    }
    let sk = get_sock_from_context(ctx, 0)?;
    with_tracker(|t| t.on_cleanup_rbuf(sk, copied as i64));
    Ok(0)
}

// RETRANSMIT

/// Attached to: tcp_retransmit_skb
#[kprobe]
pub fn tcp_retransmit_skb(ctx: ProbeContext) -> u32 {
    match try_tcp_retransmit_skb(&ctx) {
        Ok(ret) => ret,
        Err(_) => 1,
    }
}

fn try_tcp_retransmit_skb(ctx: &ProbeContext) -> Result<u32, i64> {
    let sk = get_sock_from_context(ctx, 0)?;
    let segments = if KernelEnv::load().config().features.retransmit_segs_arg() {
        ctx.arg::<i32>(2).ok_or(-1)?
    } else {
        1
    };
    with_tracker(|t| t.on_retransmit(sk, segments as i64));
    Ok(0)
}

// STATE

/// Attached to: tcp_set_state
///
/// The move to CLOSE emits the final snapshot of the flow.
#[kprobe]
pub fn tcp_set_state(ctx: ProbeContext) -> u32 {
    match try_tcp_set_state(&ctx) {
        Ok(ret) => ret,
        Err(_) => 1,
    }
}

fn try_tcp_set_state(ctx: &ProbeContext) -> Result<u32, i64> {
    let state = ctx.arg::<i32>(1).ok_or(-1)?;
    if !(0..STATE_MASK_BITS as i32).contains(&state) {
        return Ok(0);
    }
    let sk = get_sock_from_context(ctx, 0)?;
    if let Some(event) = with_tracker(|t| t.on_set_state(sk, state as u8)) {
        TCP_CLOSE_EVENTS.output(ctx, &event, 0);
    }
    Ok(0)
}

// PASSIVE ENUMERATION

/// Attached to: tcp4_seq_show
///
/// Fires once per row while something reads /proc/net/tcp.
#[kprobe]
pub fn tcp4_seq_show(ctx: ProbeContext) -> u32 {
    match try_tcp_seq_show(&ctx) {
        Ok(ret) => ret,
        Err(_) => 1,
    }
}

/// Attached to: tcp6_seq_show
#[kprobe]
pub fn tcp6_seq_show(ctx: ProbeContext) -> u32 {
    match try_tcp_seq_show(&ctx) {
        Ok(ret) => ret,
        Err(_) => 1,
    }
}

fn try_tcp_seq_show(ctx: &ProbeContext) -> Result<u32, i64> {
    let v = get_sock_from_context(ctx, 1)?;
    with_tracker(|t| t.on_seq_show(v));
    Ok(0)
}

// socket CLOSE

/// Attached to: tcp_close
///
/// Drops sockets that never carried a flow. Flows still in FIN_WAIT or
/// LAST_ACK are finished later by tcp_set_state.
#[kprobe]
pub fn tcp_close(ctx: ProbeContext) -> u32 {
    match try_tcp_close(&ctx) {
        Ok(ret) => ret,
        Err(_) => 1,
    }
}

fn try_tcp_close(ctx: &ProbeContext) -> Result<u32, i64> {
    let sk = get_sock_from_context(ctx, 0)?;
    with_tracker(|t| t.on_close(sk));
    Ok(0)
}
