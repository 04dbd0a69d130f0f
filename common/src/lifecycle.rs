//! Lifecycle probe semantics
//!
//! One method per kernel hook. Each method applies a small mutation to the
//! shared tables and never fails: a table miss, a full table or
//! uninteresting input all end the event quietly.
//!
//! ```text
//! tcp_init_sock          -> register (unknown)
//! tcp_connect            -> direction = outgoing
//! inet_csk_listen_start  -> stash / take, direction = incoming
//! inet_csk_accept        -> stash / take, new socket direction = incoming
//! tcp_set_state          -> ESTABLISHED: register + create flow, mark state
//!                           CLOSE: mark state, snapshot + evict
//! tcp_sendmsg            -> stash / take, sent bytes + RTT
//! tcp_cleanup_rbuf       -> received bytes
//! tcp_retransmit_skb     -> retransmits
//! tcp{4,6}_seq_show      -> backfill flows of listening sockets
//! tcp_close              -> evict sockets that never had a flow
//! ```

use crate::{
    constants::*,
    correlation::CorrelationTable,
    flows::FlowTable,
    kernel::Kernel,
    registry::SocketRegistry,
    table::Table,
    types::*,
};

pub struct Tracker<'a, K, R, F, C> {
    kernel: &'a K,
    sockets: SocketRegistry<'a, K, R>,
    flows: FlowTable<'a, K, F>,
    listen_args: CorrelationTable<'a, C>,
    accept_args: CorrelationTable<'a, C>,
    sendmsg_args: CorrelationTable<'a, C>,
}

impl<'a, K, R, F, C> Tracker<'a, K, R, F, C>
where
    K: Kernel,
    R: Table<FlowId, SocketInfo>,
    F: Table<FlowId, TcpFlow>,
    C: Table<u64, FlowId>,
{
    #[inline(always)]
    pub fn new(
        kernel: &'a K,
        sockets: &'a R,
        flows: &'a F,
        listen_args: &'a C,
        accept_args: &'a C,
        sendmsg_args: &'a C,
    ) -> Self {
        Self {
            kernel,
            sockets: SocketRegistry::new(kernel, sockets),
            flows: FlowTable::new(kernel, flows),
            listen_args: CorrelationTable::new(listen_args),
            accept_args: CorrelationTable::new(accept_args),
            sendmsg_args: CorrelationTable::new(sendmsg_args),
        }
    }

    /// Address family of `sk` if it is IPv4 or IPv6
    #[inline(always)]
    pub fn supported_family(&self, sk: FlowId) -> Option<u16> {
        match self.kernel.family(sk) {
            family @ (AF_INET | AF_INET6) => Some(family),
            _ => {
                self.kernel.count(STAT_UNSUPPORTED_FAMILY);
                None
            }
        }
    }

    /// Family of a socket visited by the listing traversal, if it is a
    /// listening TCP socket worth backfilling
    #[inline(always)]
    pub fn listening_family(&self, sk: FlowId) -> Option<u16> {
        let family = self.supported_family(sk)?;
        if self.kernel.state(sk) != TCP_LISTEN {
            return None;
        }
        // 0 means the protocol field is not readable on this kernel
        match self.kernel.protocol(sk) {
            0 | IPPROTO_TCP => Some(family),
            _ => None,
        }
    }

    #[inline(always)]
    pub fn on_init_sock(&self, sk: FlowId) {
        if self.sockets.contains(sk) {
            return;
        }
        self.sockets.register(sk, Direction::Unknown);
    }

    #[inline(always)]
    pub fn on_connect(&self, sk: FlowId) {
        self.sockets.set_direction(sk, Direction::Outgoing);
    }

    #[inline(always)]
    pub fn on_listen_start(&self, sk: FlowId) {
        self.listen_args.stash(self.kernel.pid_tgid(), sk);
    }

    #[inline(always)]
    pub fn on_listen_start_return(&self) {
        let Some(sk) = self.claim(&self.listen_args) else {
            return;
        };
        // a stale entry must not undo an explicit connect
        self.sockets.promote(sk, Direction::Incoming);
    }

    #[inline(always)]
    pub fn on_accept(&self, sk: FlowId) {
        self.accept_args.stash(self.kernel.pid_tgid(), sk);
    }

    /// `newsk` is the socket returned by `inet_csk_accept`
    #[inline(always)]
    pub fn on_accept_return(&self, newsk: FlowId) {
        if self.claim(&self.accept_args).is_none() || newsk.is_null() {
            return;
        }
        if self.supported_family(newsk).is_none() {
            return;
        }
        self.sockets.set_direction(newsk, Direction::Incoming);
    }

    #[inline(always)]
    pub fn on_sendmsg(&self, sk: FlowId) {
        self.sendmsg_args.stash(self.kernel.pid_tgid(), sk);
    }

    /// `copied` is the return value of `tcp_sendmsg`
    #[inline(always)]
    pub fn on_sendmsg_return(&self, copied: i64) {
        let Some(sk) = self.claim(&self.sendmsg_args) else {
            return;
        };
        self.flows.record_sent(sk, copied);
    }

    #[inline(always)]
    pub fn on_cleanup_rbuf(&self, sk: FlowId, copied: i64) {
        self.flows.record_received(sk, copied);
    }

    #[inline(always)]
    pub fn on_retransmit(&self, sk: FlowId, segments: i64) {
        self.flows.record_retransmit(sk, segments);
    }

    /// Entering ESTABLISHED starts tracking; other states are only recorded
    /// for flows that are already tracked. Entering CLOSE finishes the flow
    /// and returns its final snapshot.
    #[inline(always)]
    pub fn on_set_state(&self, sk: FlowId, state: u8) -> Option<TcpCloseEvent> {
        if state != TCP_ESTABLISHED {
            self.flows.mark_state(sk, state);
            if state == TCP_CLOSE {
                return self.finish(sk);
            }
            return None;
        }
        let family = self.supported_family(sk)?;

        self.sockets.register(sk, Direction::Unknown);
        if self.flows.get_or_create(sk, family).is_some() {
            self.flows.mark_state(sk, TCP_ESTABLISHED);
        }
        None
    }

    /// One row of the `/proc/net/tcp{,6}` traversal
    #[inline(always)]
    pub fn on_seq_show(&self, v: FlowId) {
        if v.0 == SEQ_START_TOKEN {
            return;
        }
        let Some(family) = self.listening_family(v) else {
            return;
        };
        if self.flows.contains(v) {
            return;
        }
        if self.flows.get_or_create(v, family).is_some() {
            self.kernel.count(STAT_ENUMERATED_FLOWS);
        }
    }

    /// `tcp_close` entry
    ///
    /// A socket with a flow is still draining (FIN_WAIT*, LAST_ACK) and is
    /// finished by its transition to CLOSE. Anything else is dropped from
    /// the registry here.
    #[inline(always)]
    pub fn on_close(&self, sk: FlowId) {
        if self.flows.contains(sk) {
            return;
        }
        self.sockets.evict(sk);
    }

    /// Evict `sk` from both tables and return the final snapshot if the
    /// socket had a flow
    #[inline(always)]
    pub fn finish(&self, sk: FlowId) -> Option<TcpCloseEvent> {
        let skinfo = self.sockets.evict(sk);
        let flow = self.flows.evict(sk)?;
        self.kernel.count(STAT_FLOWS_CLOSED);
        Some(TcpCloseEvent {
            skp: sk,
            flow,
            skinfo: skinfo.unwrap_or_default(),
        })
    }

    #[inline(always)]
    fn claim(&self, args: &CorrelationTable<'a, C>) -> Option<FlowId> {
        let sk = args.take(self.kernel.pid_tgid());
        if sk.is_none() {
            self.kernel.count(STAT_CORRELATION_MISSES);
        }
        sk
    }
}
