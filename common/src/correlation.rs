//! Entry/return call correlation
//!
//! A kprobe and its kretprobe fire on the same thread, so the entry half
//! parks the socket under the caller's `pid_tgid` and the return half picks
//! it up again. A re-entrant call on the same thread overwrites the pending
//! entry.

use crate::{
    table::{Insert, InsertMode, Table},
    types::FlowId,
};

pub struct CorrelationTable<'a, T> {
    table: &'a T,
}

impl<'a, T> CorrelationTable<'a, T>
where
    T: Table<u64, FlowId>,
{
    pub fn new(table: &'a T) -> Self {
        Self { table }
    }

    /// Park `sk` for the return probe of the current call
    #[inline(always)]
    pub fn stash(&self, pid_tgid: u64, sk: FlowId) -> Insert {
        self.table.insert(&pid_tgid, &sk, InsertMode::Any)
    }

    /// Claim the pending entry for this thread
    ///
    /// The entry is removed before returning, so no exit path of the return
    /// probe can leak it.
    #[inline(always)]
    pub fn take(&self, pid_tgid: u64) -> Option<FlowId> {
        let sk = unsafe { *self.table.lookup(&pid_tgid)? };
        self.table.remove(&pid_tgid);
        Some(sk)
    }
}
