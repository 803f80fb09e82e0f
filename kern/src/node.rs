// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Nodes: the kernel-side record of a service a process has exported
//!, and the asymmetric refcount-acknowledgement protocol that keeps
//! the owner's user-space object alive exactly as long as some reference
//! exists somewhere in the system.

use std::collections::VecDeque;

use abi::Nice;

use crate::ids::{NodeId, ProcessId, TransactionId};

/// Work the reference engine has decided must be delivered to a node's
/// owner thread, translated to `abi::ReturnCode` by the codec.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum NodeWork {
    Increfs(NodeId),
    Acquire(NodeId),
    Release(NodeId),
    Decrefs(NodeId),
}

/// A service a process has exported, identified to its owner by an
/// opaque `(ptr, cookie)` pair and to everyone else by `NodeId`.
#[derive(Clone, Debug)]
pub struct Node {
    pub id: NodeId,
    pub owner: ProcessId,
    pub ptr: u64,
    pub cookie: u64,
    pub accepts_fds: bool,
    pub min_priority: Nice,

    /// Total strong interest from every reference plus any in-flight
    /// transaction holding an implicit strong ref, excluding the owner's
    /// own implicit strong ref over its local object.
    strong_count: u32,
    weak_count: u32,

    /// Set between sending `BR_ACQUIRE`/`BR_INCREFS` and receiving the
    /// matching `BC_ACQUIRE_DONE`/`BC_INCREFS_DONE`, so a 0->1->0->1
    /// flutter while the owner hasn't replied yet does not re-notify it.
    pending_strong_ack: bool,
    pending_weak_ack: bool,

    /// `true` while one oneway transaction addressed to this node is
    /// either enqueued or being processed by the owner, enforcing
    /// at-most-one concurrent oneway per node.
    pub has_async_transaction: bool,
    /// Oneway transactions that arrived while `has_async_transaction` was
    /// already set, in delivery order. The head moves onto a todo queue
    /// when the in-flight one's buffer is freed.
    pub async_todo: VecDeque<TransactionId>,
}

impl Node {
    pub fn new(
        id: NodeId,
        owner: ProcessId,
        ptr: u64,
        cookie: u64,
        accepts_fds: bool,
        min_priority: Nice,
    ) -> Self {
        Self {
            id,
            owner,
            ptr,
            cookie,
            accepts_fds,
            min_priority,
            strong_count: 0,
            weak_count: 0,
            pending_strong_ack: false,
            pending_weak_ack: false,
            has_async_transaction: false,
            async_todo: VecDeque::new(),
        }
    }

    pub fn strong_count(&self) -> u32 {
        self.strong_count
    }

    pub fn weak_count(&self) -> u32 {
        self.weak_count
    }

    /// A node with no strong refs, no weak refs, and no acknowledgement
    /// in flight is eligible for deletion from its owner's node table.
    pub fn is_dead(&self) -> bool {
        self.strong_count == 0
            && self.weak_count == 0
            && !self.pending_strong_ack
            && !self.pending_weak_ack
    }

    /// Adds one strong reference. Returns `Some(Acquire)` the first time
    /// this crosses 0 -> 1 while no acknowledgement is already pending.
    pub fn incr_strong(&mut self) -> Option<NodeWork> {
        self.strong_count += 1;
        if self.strong_count == 1 && !self.pending_strong_ack {
            self.pending_strong_ack = true;
            Some(NodeWork::Acquire(self.id))
        } else {
            None
        }
    }

    /// Removes one strong reference. Returns `Some(Release)` when this
    /// crosses 1 -> 0 while no acknowledgement is pending -- an acquire
    /// still in flight suppresses the release until it is acknowledged,
    /// per the asymmetric acquire/release protocol. `Release`, unlike
    /// `Acquire`, has no `_DONE` of its own to wait on, so this never
    /// arms `pending_strong_ack` itself.
    pub fn decr_strong(&mut self) -> Option<NodeWork> {
        debug_assert!(self.strong_count > 0, "strong refcount underflow");
        self.strong_count = self.strong_count.saturating_sub(1);
        if self.strong_count == 0 && !self.pending_strong_ack {
            Some(NodeWork::Release(self.id))
        } else {
            None
        }
    }

    pub fn incr_weak(&mut self) -> Option<NodeWork> {
        self.weak_count += 1;
        if self.weak_count == 1 && !self.pending_weak_ack {
            self.pending_weak_ack = true;
            Some(NodeWork::Increfs(self.id))
        } else {
            None
        }
    }

    pub fn decr_weak(&mut self) -> Option<NodeWork> {
        debug_assert!(self.weak_count > 0, "weak refcount underflow");
        self.weak_count = self.weak_count.saturating_sub(1);
        if self.weak_count == 0 && !self.pending_weak_ack {
            Some(NodeWork::Decrefs(self.id))
        } else {
            None
        }
    }

    /// `BC_ACQUIRE_DONE`: the owner has applied the `Acquire` it was last
    /// told about. A no-op if nothing is actually outstanding -- `Release`
    /// never arms the pending flag itself, so a count that settled back to
    /// zero on its own needs no ack at all. If the count has dropped back
    /// to zero again since the `Acquire` was sent, queue the `Release`
    /// that `decr_strong` had to suppress while the ack was in flight;
    /// `Release` has no `_DONE` of its own, so this never re-arms the flag.
    pub fn ack_strong(&mut self) -> Option<NodeWork> {
        if !self.pending_strong_ack {
            return None;
        }
        self.pending_strong_ack = false;
        if self.strong_count > 0 {
            None
        } else {
            Some(NodeWork::Release(self.id))
        }
    }

    pub fn ack_weak(&mut self) -> Option<NodeWork> {
        if !self.pending_weak_ack {
            return None;
        }
        self.pending_weak_ack = false;
        if self.weak_count > 0 {
            None
        } else {
            Some(NodeWork::Decrefs(self.id))
        }
    }

    /// Reverses one `incr_strong`/`incr_weak` call whose resulting node work
    /// was never actually delivered to the owner, because the transaction
    /// that produced it failed before it could be committed -- a failed
    /// translation releases all already-rewritten objects, decrementing
    /// references and nodes in turn. `had_work` must be exactly the `is_some()` of
    /// what that call returned, so a pending-ack flag it set is cleared
    /// along with the count, instead of being left stuck forever.
    pub fn undo_incr(&mut self, strong: bool, had_work: bool) {
        if strong {
            debug_assert!(self.strong_count > 0, "undo_incr(strong) underflow");
            self.strong_count = self.strong_count.saturating_sub(1);
            if had_work {
                self.pending_strong_ack = false;
            }
        } else {
            debug_assert!(self.weak_count > 0, "undo_incr(weak) underflow");
            self.weak_count = self.weak_count.saturating_sub(1);
            if had_work {
                self.pending_weak_ack = false;
            }
        }
    }
}
