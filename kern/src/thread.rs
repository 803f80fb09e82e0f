// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-thread state: the looper registration bits, the
//! thread's private work queue, its transaction stack, and the slots used
//! to hand back an out-of-band error on the next read.

use std::collections::VecDeque;

use abi::{Nice, ReturnCode};
use bitflags::bitflags;

use crate::death::DeathWork;
use crate::ids::{ThreadId, TransactionId};
use crate::node::NodeWork;

bitflags! {
    /// Mirrors a thread's participation in its process's thread pool
    ///. A thread moves `Unregistered -> Registered -> Looping`, and
    /// separately may be marked `Exited` once it has told the core it is
    /// leaving for good.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct LooperState: u8 {
        /// Counted against the process's `max_threads` budget.
        const REGISTERED = 0x01;
        /// Actively blocked in a read waiting for work.
        const LOOPING = 0x02;
        /// Told the core it is leaving; must not be handed new work.
        const EXITED = 0x04;
        /// Must pop back to user-space before blocking again, to let it
        /// observe a side effect (freshly spawned, or a `flush()`) rather
        /// than sitting in the kernel forever. Consumed by the next `read`.
        const NEED_RETURN = 0x08;
        /// Saw an illegal state transition (`BC_REGISTER_LOOPER` on a thread
        /// that entered on its own, or vice versa). Diagnostic only -- the
        /// thread keeps running, but this flags the process as misbehaving.
        const INVALID = 0x10;
    }
}

/// An item queued for a thread (or, via the process queue, for whichever
/// thread picks it up next) to deliver on its next read.
#[derive(Clone, Debug)]
pub enum WorkItem {
    /// Deliver as `BR_TRANSACTION`: a call arriving from another process.
    Transaction(TransactionId),
    /// Deliver as `BR_REPLY`: a reply to a transaction this thread sent.
    Reply(TransactionId),
    /// Deliver as `BR_TRANSACTION_COMPLETE`: acknowledges a one-way send or
    /// a queued two-way call before its reply arrives.
    TransactionComplete,
    /// Deliver as `BR_FAILED_REPLY` or `BR_DEAD_REPLY` depending on cause.
    FailedReply { dead: bool },
    /// A node refcount notification (`BR_INCREFS`/`BR_ACQUIRE`/`BR_RELEASE`/
    /// `BR_DECREFS`), generated by the reference engine.
    Node(NodeWork),
    /// A death notification (`BR_DEAD_BINDER`), generated by the death
    /// engine.
    Dead(DeathWork),
    /// Deliver as `BR_CLEAR_DEATH_NOTIFICATION_DONE`: acknowledges a
    /// `BC_CLEAR_DEATH_NOTIFICATION` that arrived before any death had been
    /// delivered.
    ClearDeath { cookie: u64 },
    /// Deliver as `BR_SPAWN_LOOPER`: told by the governor to start another
    /// thread in this process's pool.
    SpawnLooper,
}

pub struct Thread {
    pub id: ThreadId,
    pub looper: LooperState,
    /// Stack of transactions this thread is a participant in, innermost
    /// last, used to find the correct reply target and to walk the chain
    /// for priority inheritance and failure propagation.
    pub transaction_stack: Vec<TransactionId>,
    pub todo: VecDeque<WorkItem>,
    /// An error stashed by a command handler that failed outside of any
    /// transaction context, delivered in place of the next would-be block
    ///.
    pub return_error: Option<ReturnCode>,
    /// This thread's current nice value as tracked by the kernel, mirroring
    /// whatever `Host::set_thread_nice` was last told. Bumped to the
    /// inherited priority when a transaction is dispatched to this thread,
    /// and restored to what it was once the matching reply is sent.
    pub nice: Nice,
    pub blocked: bool,
}

impl Thread {
    pub fn new(id: ThreadId) -> Self {
        Self {
            id,
            looper: LooperState::NEED_RETURN,
            transaction_stack: Vec::new(),
            todo: VecDeque::new(),
            return_error: None,
            nice: Nice(0),
            blocked: false,
        }
    }

    pub fn top_transaction(&self) -> Option<TransactionId> {
        self.transaction_stack.last().copied()
    }

    pub fn push_transaction(&mut self, id: TransactionId) {
        self.transaction_stack.push(id);
    }

    pub fn pop_transaction(&mut self) -> Option<TransactionId> {
        self.transaction_stack.pop()
    }

    pub fn can_receive_work(&self) -> bool {
        !self.looper.contains(LooperState::EXITED)
    }

    pub fn is_idle_looper(&self) -> bool {
        self.looper.contains(LooperState::REGISTERED | LooperState::LOOPING)
            && self.todo.is_empty()
            && self.transaction_stack.is_empty()
    }

    /// `poll`'s idleness test: no transaction stack and nothing of its own
    /// queued, regardless of looper registration. A thread in this state is
    /// the one a process-wide work item would be handed to next.
    pub fn is_idle(&self) -> bool {
        self.todo.is_empty() && self.transaction_stack.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_looper_requires_empty_todo_and_stack() {
        let mut t = Thread::new(ThreadId(1));
        t.looper = LooperState::REGISTERED | LooperState::LOOPING;
        assert!(t.is_idle_looper());
        t.todo.push_back(WorkItem::TransactionComplete);
        assert!(!t.is_idle_looper());
    }

    #[test]
    fn exited_thread_cannot_receive_work() {
        let mut t = Thread::new(ThreadId(1));
        assert!(t.can_receive_work());
        t.looper.insert(LooperState::EXITED);
        assert!(!t.can_receive_work());
    }
}
