// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Small integer identities used throughout the object graph.
//!
//! `ProcessId` and `ThreadId` come from `abi`: a process id is minted by
//! [`IdAllocator`] at `open()` time, a thread id is the host's thread id
//! handed to us by the caller of every operation. Everything else here is
//! minted monotonically, never reused, used only for identity and
//! diagnostics.

pub use abi::{DebugId, ProcessId, ThreadId};

/// Identifies a `Node`, independent of the service pointer its owner used to
/// export it and independent of which map (a process's or the orphan list)
/// currently holds it.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct NodeId(pub DebugId);

/// Identifies a `Transaction` for the lifetime of its stack entry.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TransactionId(pub DebugId);

/// Mints process ids, node ids, transaction ids and buffer/reference debug
/// ids from one monotonic counter. Never resets, never reuses a value.
#[derive(Debug, Default)]
pub struct IdAllocator(u64);

impl IdAllocator {
    pub fn new() -> Self {
        Self(0)
    }

    fn next_raw(&mut self) -> u64 {
        let id = self.0;
        self.0 = self.0.wrapping_add(1);
        id
    }

    pub fn next_debug_id(&mut self) -> DebugId {
        DebugId(self.next_raw())
    }

    pub fn next_process_id(&mut self) -> ProcessId {
        ProcessId(self.next_raw())
    }

    pub fn next_node_id(&mut self) -> NodeId {
        NodeId(self.next_debug_id())
    }

    pub fn next_transaction_id(&mut self) -> TransactionId {
        TransactionId(self.next_debug_id())
    }
}
