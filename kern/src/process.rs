// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-process state: a process's object tables, its buffer
//! pool, its thread pool governor counters, and the death subscriptions it
//! has registered against nodes it holds references to.

use std::collections::{BTreeMap, VecDeque};

use crate::buffer::BufferPool;
use crate::death::DeathSubscription;
use crate::ids::{NodeId, ProcessId, ThreadId};
use crate::node::Node;
use crate::reference::Reference;
use crate::thread::{Thread, WorkItem};

/// Governs how many threads a process's pool may grow to and how many have
/// actually registered.
#[derive(Debug, Default)]
pub struct ThreadPool {
    pub max_threads: u32,
    pub registered: u32,
    /// `BC_REQUEST_SPAWN` (our `SpawnLooper` work item) already issued and
    /// not yet matched by a new registration, so the governor does not ask
    /// for two new threads when one would do.
    pub spawn_requested: bool,
}

pub struct Process {
    pub id: ProcessId,
    /// The host-supplied caller uid this endpoint was opened with. The only
    /// authentication this core performs is comparing this against the
    /// sticky context-manager uid in `contextmgr::register`.
    pub uid: u32,
    pub threads: BTreeMap<ThreadId, Thread>,
    pub nodes: BTreeMap<NodeId, Node>,
    pub nodes_by_ptr: BTreeMap<u64, NodeId>,
    pub refs_by_descriptor: BTreeMap<i32, Reference>,
    pub refs_by_target: BTreeMap<NodeId, i32>,
    pub buffer_pool: BufferPool,
    /// Kernel-side mirror of the bytes backing this process's shared
    /// mapping. A real host keeps this content in physical pages
    /// mapped into both the kernel and the process's user space; since
    /// nothing here talks to real memory, the core keeps its own copy so a
    /// transaction's payload can be written once at delivery and read back
    /// by whichever test or shim stands in for the user-space reader.
    pub mapping: Vec<u8>,
    pub thread_pool: ThreadPool,
    /// Work not yet bound to a specific thread: any idle looper may claim
    /// it. Oneway sends to a node that already has a transaction
    /// outstanding also wait here, keyed implicitly by delivery order.
    pub process_todo: VecDeque<WorkItem>,
    /// Death subscriptions this process has registered, keyed by the node
    /// being watched.
    pub death_subscriptions: BTreeMap<NodeId, Vec<DeathSubscription>>,
    /// Set once `close()`/teardown has begun; no new work is accepted.
    pub dying: bool,
}

impl Process {
    pub fn new(id: ProcessId, buffer_pool: BufferPool) -> Self {
        Self::with_uid(id, 0, buffer_pool)
    }

    pub fn with_uid(id: ProcessId, uid: u32, buffer_pool: BufferPool) -> Self {
        Self {
            id,
            uid,
            threads: BTreeMap::new(),
            nodes: BTreeMap::new(),
            nodes_by_ptr: BTreeMap::new(),
            refs_by_descriptor: BTreeMap::new(),
            refs_by_target: BTreeMap::new(),
            buffer_pool,
            mapping: Vec::new(),
            thread_pool: ThreadPool::default(),
            process_todo: VecDeque::new(),
            death_subscriptions: BTreeMap::new(),
            dying: false,
        }
    }

    /// Allocates the smallest non-negative descriptor not currently in use
    /// by the process. Descriptor 0 is reserved for the context manager
    /// and is never handed out here; callers that need it use
    /// `abi::CONTEXT_MANAGER_DESCRIPTOR` directly.
    pub fn allocate_descriptor(&mut self) -> i32 {
        let mut candidate = 1i32;
        for &used in self.refs_by_descriptor.keys() {
            if used < candidate {
                continue;
            }
            if used == candidate {
                candidate += 1;
            } else {
                break;
            }
        }
        candidate
    }

    pub fn find_or_create_ref(&mut self, node: NodeId) -> &mut Reference {
        if let Some(&desc) = self.refs_by_target.get(&node) {
            return self.refs_by_descriptor.get_mut(&desc).expect("ref index consistency");
        }
        let desc = self.allocate_descriptor();
        self.refs_by_target.insert(node, desc);
        self.refs_by_descriptor.insert(desc, Reference::new(desc, node));
        self.refs_by_descriptor.get_mut(&desc).unwrap()
    }

    pub fn remove_reference(&mut self, descriptor: i32) {
        if let Some(reference) = self.refs_by_descriptor.remove(&descriptor) {
            self.refs_by_target.remove(&reference.node);
        }
    }

    /// Picks an idle, registered-and-looping thread to hand `item` to
    /// directly, or falls back to the process queue for whichever thread
    /// frees up next. Returns the chosen thread id, if any.
    pub fn dispatch(&mut self, item: WorkItem) -> Option<ThreadId> {
        if let Some((&id, thread)) = self
            .threads
            .iter_mut()
            .find(|(_, t)| t.is_idle_looper())
        {
            thread.todo.push_back(item);
            Some(id)
        } else {
            self.process_todo.push_back(item);
            None
        }
    }

    pub fn idle_thread_count(&self) -> u32 {
        self.threads.values().filter(|t| t.is_idle_looper()).count() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use abi::DebugId;

    fn process() -> Process {
        Process::new(ProcessId(1), BufferPool::new(4096, 0, DebugId(0)))
    }

    #[test]
    fn descriptor_allocation_skips_in_use_values() {
        let mut p = process();
        let a = p.allocate_descriptor();
        p.refs_by_descriptor.insert(a, Reference::new(a, NodeId(DebugId(1))));
        let b = p.allocate_descriptor();
        assert_ne!(a, b);
    }

    #[test]
    fn find_or_create_ref_reuses_existing_descriptor_for_same_node() {
        let mut p = process();
        let node = NodeId(DebugId(5));
        let d1 = p.find_or_create_ref(node).descriptor;
        let d2 = p.find_or_create_ref(node).descriptor;
        assert_eq!(d1, d2);
    }

    #[test]
    fn dispatch_falls_back_to_process_queue_with_no_idle_thread() {
        let mut p = process();
        p.threads.insert(ThreadId(1), Thread::new(ThreadId(1)));
        assert_eq!(p.dispatch(WorkItem::TransactionComplete), None);
        assert_eq!(p.process_todo.len(), 1);
    }
}
