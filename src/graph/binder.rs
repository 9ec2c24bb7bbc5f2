//! Matching of two-phase binder transactions.
//!
//! A synchronous call is parked in the pending queue until a reply from the
//! target (or one of its binder threads) shows up; the pair then moves to the
//! completed queue. One-way calls go straight to the completed queue. Completed
//! transactions wait there until their target is scheduled in.
//!
//! Both queues are scanned newest first so nested transactions pair up the way
//! calls and returns nest.

use std::collections::VecDeque;

use serde::Serialize;
use tracing::debug;

use crate::config::RetentionPolicy;
use crate::error::Diagnostics;
use crate::events::{BinderKind, BinderTransaction};

/// First half of a synchronous call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCall {
    pub caller: u32,
    pub target: u32,
    /// Binder threads of `target` that may send the reply.
    pub children: Vec<u32>,
    pub send: BinderTransaction,
}

impl PendingCall {
    pub fn new(send: BinderTransaction, children: Vec<u32>) -> Self {
        Self {
            caller: send.pid,
            target: send.target_pid,
            children,
            send,
        }
    }

    pub fn accepts_reply_from(&self, pid: u32) -> bool {
        self.target == pid || self.children.contains(&pid)
    }
}

/// A call paired with its reply, or a one-way call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedTransaction {
    pub caller: u32,
    pub target: u32,
    /// Thread that carried the transaction: the replying thread of a call, or
    /// the caller itself for a one-way call.
    pub binder_thread: u32,
    pub kind: BinderKind,
    pub send: BinderTransaction,
    pub reply: Option<BinderTransaction>,
}

impl CompletedTransaction {
    pub fn from_call(call: PendingCall, reply: BinderTransaction) -> Self {
        Self {
            caller: call.caller,
            target: call.target,
            binder_thread: reply.pid,
            kind: BinderKind::Call,
            send: call.send,
            reply: Some(reply),
        }
    }

    pub fn from_async(send: BinderTransaction) -> Self {
        Self {
            caller: send.pid,
            target: send.target_pid,
            binder_thread: send.pid,
            kind: BinderKind::Async,
            send,
            reply: None,
        }
    }

    /// The event that completed the transaction.
    pub fn receive(&self) -> &BinderTransaction {
        self.reply.as_ref().unwrap_or(&self.send)
    }

    fn completed_at(&self) -> u64 {
        self.receive().ts
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub completed: usize,
}

#[derive(Debug, Default)]
pub struct BinderQueues {
    policy: RetentionPolicy,
    pending: VecDeque<PendingCall>,
    completed: VecDeque<CompletedTransaction>,
}

impl BinderQueues {
    pub fn new(policy: RetentionPolicy) -> Self {
        Self {
            policy,
            pending: VecDeque::new(),
            completed: VecDeque::new(),
        }
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            pending: self.pending.len(),
            completed: self.completed.len(),
        }
    }

    /// Drop entries older than the retention age.
    pub fn expire(&mut self, now: u64, diag: &mut Diagnostics) {
        let Some(max_age) = self.policy.max_age_us else {
            return;
        };
        while let Some(call) = self.pending.front() {
            if now.saturating_sub(call.send.ts) <= max_age {
                break;
            }
            debug!("Evicting stale binder call {} -> {}", call.caller, call.target);
            self.pending.pop_front();
            diag.evicted_pending += 1;
        }
        while let Some(tx) = self.completed.front() {
            if now.saturating_sub(tx.completed_at()) <= max_age {
                break;
            }
            debug!("Evicting unconsumed binder transaction {} -> {}", tx.caller, tx.target);
            self.completed.pop_front();
            diag.evicted_completed += 1;
        }
    }

    pub fn push_pending(&mut self, call: PendingCall, diag: &mut Diagnostics) {
        if self.policy.max_pending == 0 {
            diag.evicted_pending += 1;
            return;
        }
        if self.pending.len() >= self.policy.max_pending {
            self.pending.pop_front();
            diag.evicted_pending += 1;
        }
        self.pending.push_back(call);
    }

    pub fn push_completed(&mut self, tx: CompletedTransaction, diag: &mut Diagnostics) {
        if self.policy.max_completed == 0 {
            diag.evicted_completed += 1;
            return;
        }
        if self.completed.len() >= self.policy.max_completed {
            self.completed.pop_front();
            diag.evicted_completed += 1;
        }
        self.completed.push_back(tx);
    }

    /// Pair `reply` with the newest pending call it answers. Returns false
    /// (and counts the reply) when nothing matches.
    pub fn match_reply(&mut self, reply: &BinderTransaction, diag: &mut Diagnostics) -> bool {
        let Some(idx) = self
            .pending
            .iter()
            .rposition(|call| call.accepts_reply_from(reply.pid))
        else {
            debug!("Unmatched binder reply from {} at {}", reply.pid, reply.ts);
            diag.unmatched_replies += 1;
            return false;
        };
        let Some(call) = self.pending.remove(idx) else {
            return false;
        };
        self.push_completed(CompletedTransaction::from_call(call, reply.clone()), diag);
        true
    }

    pub fn completed_len(&self) -> usize {
        self.completed.len()
    }

    /// Newest completed transaction targeting `pid` among the first `before`
    /// entries.
    pub fn rfind_completed(&self, pid: u32, before: usize) -> Option<usize> {
        self.completed
            .iter()
            .take(before)
            .rposition(|tx| tx.target == pid)
    }

    pub fn remove_completed(&mut self, idx: usize) -> Option<CompletedTransaction> {
        self.completed.remove(idx)
    }
}
