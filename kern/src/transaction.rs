// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Transactions: one in-flight call or reply, and the stack links
//! that tie a chain of nested two-way calls together for reply routing,
//! priority inheritance, and failure propagation.

use abi::Nice;

use crate::ids::{NodeId, ProcessId, ThreadId, TransactionId};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TransactionState {
    /// Created, not yet visible in any todo queue.
    Pending,
    /// Queued to a target thread or process, awaiting a read.
    Queued,
    /// Picked up by its target thread, which is now doing the work this
    /// call represents; only two-way, non-oneway transactions reach this.
    Outstanding,
    /// A reply has been sent and matched back to the caller.
    Replied,
    /// Failed before a reply arrived, for any reason (protocol fault, dead
    /// target, target process going away mid-call).
    Failed,
}

#[derive(Clone, Debug)]
pub struct Transaction {
    pub id: TransactionId,
    pub from_process: ProcessId,
    pub from_thread: ThreadId,
    pub to_process: ProcessId,
    /// `None` until a specific thread has picked this up, or always `None`
    /// for a oneway send, which has no reply to route.
    pub to_thread: Option<ThreadId>,
    /// The node this call targets, or `None` for a reply (replies carry no
    /// target object, only a sender to hand the data back to).
    pub target_node: Option<NodeId>,
    pub code: u32,
    pub is_oneway: bool,
    pub is_reply: bool,
    pub accept_fds: bool,
    pub sender_euid: u32,
    /// Offset of this transaction's buffer within the target process's
    /// mapping, set once the buffer has been allocated.
    pub buffer_offset: usize,
    pub data_size: usize,
    pub offsets_size: usize,
    /// The calling thread's nice value before priority was inherited onto
    /// the target, restored when this transaction's reply (or failure)
    /// unwinds past it.
    pub sender_nice: Nice,
    /// The transaction on the calling thread's stack that this one is
    /// nested under, if any -- lets failure propagation walk back up a
    /// chain of two-way calls.
    pub from_parent: Option<TransactionId>,
    /// The callee thread's nice value just before priority inheritance was
    /// applied at dispatch. Meaningless until the call is actually
    /// delivered; restored onto that thread when its reply is sent.
    pub callee_prior_nice: Nice,
    pub state: TransactionState,
}

impl Transaction {
    pub fn reply_target(&self) -> (ProcessId, ThreadId) {
        (self.from_process, self.from_thread)
    }
}
