// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The transaction engine: target thread selection, object
//! translation between two (or three, when a passed handle's node is
//! owned by neither party) processes, and the priority-inheritance policy
//! applied when an inbound call is actually dispatched to a thread.
//!
//! This module deliberately stays agnostic of the global lock: every
//! function takes exactly the `Process` values it touches, already
//! mutably borrowed by the caller. `Kernel` is what
//! knows how to pull two or three distinct entries out of the process
//! table to hand them here.

use std::collections::BTreeMap;

use abi::{FlatObject, Nice, ObjectFlags, ObjectType};

use crate::error::InteractFault;
use crate::ids::{IdAllocator, NodeId, ProcessId, ThreadId, TransactionId};
use crate::node::{Node, NodeWork};
use crate::process::Process;
use crate::thread::{Thread, WorkItem};
use crate::transaction::Transaction;

/// Picks which thread in `target` should receive `item`: prefers a thread
/// affinity match (a thread already blocked servicing a call it is itself
/// the nested root of), falling back to any idle looper, falling back to
/// the process queue. `preferred` is the thread-affinity match, if any --
/// it may be mid-call (not an idle looper) rather than free, which is the
/// whole point of routing to it instead of a fresh thread.
pub fn select_target_thread(target: &Process, preferred: Option<ThreadId>) -> Option<ThreadId> {
    if let Some(tid) = preferred {
        if let Some(thread) = target.threads.get(&tid) {
            if thread.can_receive_work() {
                return Some(tid);
            }
        }
    }
    target
        .threads
        .iter()
        .find(|(_, t)| t.can_receive_work() && t.is_idle_looper())
        .map(|(&id, _)| id)
}

/// Thread-affinity search for a synchronous, non-reply `BC_TRANSACTION`:
/// walks the sending thread's nested-call chain (`starting_at`, then its
/// `from_parent`, and so on) looking for the nearest ancestor transaction
/// that was itself sent *by* a thread in `target_process` -- the dependent-
/// thread optimization that keeps a chain of nested RPCs pinned to the same
/// worker instead of waking a fresh one. Resolves the open question of
/// "deepest vs. shallowest match" towards deepest: the first (innermost)
/// ancestor found while walking outward from the immediate caller.
pub fn find_thread_affinity(
    transactions: &BTreeMap<TransactionId, Transaction>,
    starting_at: Option<TransactionId>,
    target_process: ProcessId,
) -> Option<ThreadId> {
    let mut cursor = starting_at;
    while let Some(tx_id) = cursor {
        let tx = transactions.get(&tx_id)?;
        if tx.from_process == target_process {
            return Some(tx.from_thread);
        }
        cursor = tx.from_parent;
    }
    None
}

/// The target runs at least as important as its own node's declared
/// floor, and at least as important as whoever is calling it. Lower nice
/// values are more important, so this picks the minimum.
pub fn effective_priority(caller: Nice, node_min_priority: Nice) -> Nice {
    if caller.is_more_important_than(node_min_priority) {
        caller
    } else {
        node_min_priority
    }
}

/// Translates a `BINDER`/`WEAK_BINDER` flat object found in `sender`'s
/// transaction data. The sender is definitionally the node's owner --
/// exporting a service creates it in the exporter's own table. Returns the
/// `HANDLE`/`WEAK_HANDLE` object to splice into the target's copy of the
/// data, plus any node work generated in the sender (owner) by the first
/// reference `target` now holds.
pub fn translate_export(
    allocator: &mut IdAllocator,
    sender: &mut Process,
    sender_id: ProcessId,
    target: &mut Process,
    obj: FlatObject,
) -> (FlatObject, Option<NodeWork>) {
    let strong = obj.object_type == ObjectType::BINDER;
    let ptr = obj.handle_or_ptr;
    let node_id = *sender
        .nodes_by_ptr
        .entry(ptr)
        .or_insert_with(|| allocator.next_node_id());
    let obj_flags = ObjectFlags::from_bits_truncate(obj.flags);
    sender.nodes.entry(node_id).or_insert_with(|| {
        Node::new(
            node_id,
            sender_id,
            ptr,
            obj.cookie,
            obj_flags.contains(ObjectFlags::ACCEPTS_FDS),
            obj_flags.priority(),
        )
    });

    let reference = target.find_or_create_ref(node_id);
    let crossed = if strong { reference.incr_strong() } else { reference.incr_weak() };
    let work = if crossed {
        let node = sender.nodes.get_mut(&node_id).expect("just inserted");
        if strong { node.incr_strong() } else { node.incr_weak() }
    } else {
        None
    };
    let descriptor = target.refs_by_target[&node_id];
    let out_type = if strong { ObjectType::HANDLE } else { ObjectType::WEAK_HANDLE };
    (
        FlatObject { object_type: out_type, flags: obj.flags, handle_or_ptr: descriptor as u64, cookie: 0 },
        work,
    )
}

/// Translates a `HANDLE`/`WEAK_HANDLE` flat object found in `holder`'s
/// data, for the case where `target` is itself the node's owner: handing
/// an object back to whoever exported it needs no new reference, only a
/// plain pointer/cookie.
pub fn translate_handle_to_owner(
    holder: &mut Process,
    owner_as_target: &mut Process,
    obj: FlatObject,
) -> Result<FlatObject, InteractFault> {
    let strong = obj.object_type == ObjectType::HANDLE;
    let descriptor = obj.handle_or_ptr as i32;
    let reference = holder
        .refs_by_descriptor
        .get(&descriptor)
        .ok_or_else(|| InteractFault::in_src(crate::error::ProtocolError::OffsetOutOfRange(descriptor as u64)))?;
    let node_id = reference.node;
    let node = owner_as_target
        .nodes
        .get(&node_id)
        .ok_or_else(|| InteractFault::in_dst(crate::error::ProtocolError::OffsetOutOfRange(descriptor as u64)))?;
    let out_type = if strong { ObjectType::BINDER } else { ObjectType::WEAK_BINDER };
    Ok(FlatObject { object_type: out_type, flags: obj.flags, handle_or_ptr: node.ptr, cookie: node.cookie })
}

/// Translates a `HANDLE`/`WEAK_HANDLE` flat object for the general case:
/// the node is owned by a third process, distinct from both `holder` and
/// `target`. `target` gets its own handle on the same node, and the
/// owner's refcount gains the same edge `holder`'s local reference already
/// represents.
pub fn translate_handle_to_other(
    holder: &Process,
    target: &mut Process,
    owner: &mut Process,
    obj: FlatObject,
) -> Result<(FlatObject, Option<NodeWork>), InteractFault> {
    let strong = obj.object_type == ObjectType::HANDLE;
    let descriptor = obj.handle_or_ptr as i32;
    let reference = holder
        .refs_by_descriptor
        .get(&descriptor)
        .ok_or_else(|| InteractFault::in_src(crate::error::ProtocolError::OffsetOutOfRange(descriptor as u64)))?;
    let node_id = reference.node;

    let target_ref = target.find_or_create_ref(node_id);
    let crossed = if strong { target_ref.incr_strong() } else { target_ref.incr_weak() };
    let work = if crossed {
        let node = owner
            .nodes
            .get_mut(&node_id)
            .ok_or_else(|| InteractFault::in_dst(crate::error::ProtocolError::OffsetOutOfRange(descriptor as u64)))?;
        if strong { node.incr_strong() } else { node.incr_weak() }
    } else {
        None
    };
    let descriptor_out = target.refs_by_target[&node_id];
    let out_type = if strong { ObjectType::HANDLE } else { ObjectType::WEAK_HANDLE };
    Ok((
        FlatObject { object_type: out_type, flags: obj.flags, handle_or_ptr: descriptor_out as u64, cookie: 0 },
        work,
    ))
}

/// Enqueues `item` for `thread`, waking it through `wake` if it was
/// blocked. Small enough to inline at call sites, but factored out so
/// every enqueue path applies the same "wake only if actually blocked"
/// rule.
pub fn deliver_to_thread(thread: &mut Thread, item: WorkItem) -> bool {
    let was_blocked = thread.blocked;
    thread.todo.push_back(item);
    was_blocked
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferPool;
    use crate::thread::{LooperState, Thread};
    use abi::DebugId;

    fn process(id: u64) -> Process {
        Process::new(ProcessId(id), BufferPool::new(4096, 0, DebugId(0)))
    }

    #[test]
    fn select_target_prefers_idle_affinity_thread() {
        let mut target = process(2);
        let mut t1 = Thread::new(crate::ids::ThreadId(1));
        t1.looper = LooperState::REGISTERED | LooperState::LOOPING;
        let mut t2 = Thread::new(crate::ids::ThreadId(2));
        t2.looper = LooperState::REGISTERED | LooperState::LOOPING;
        target.threads.insert(crate::ids::ThreadId(1), t1);
        target.threads.insert(crate::ids::ThreadId(2), t2);
        assert_eq!(select_target_thread(&target, Some(crate::ids::ThreadId(2))), Some(crate::ids::ThreadId(2)));
    }

    #[test]
    fn select_target_accepts_a_busy_affinity_match() {
        // The whole point of thread affinity is routing to a thread that is
        // *not* idle -- it's blocked mid-call on a nested chain, which is
        // exactly why the nested call has to land on it rather than a fresh
        // looper.
        let mut target = process(2);
        let mut t1 = Thread::new(crate::ids::ThreadId(1));
        t1.looper = LooperState::REGISTERED | LooperState::LOOPING;
        t1.push_transaction(crate::ids::TransactionId(DebugId(99)));
        target.threads.insert(crate::ids::ThreadId(1), t1);
        assert_eq!(select_target_thread(&target, Some(crate::ids::ThreadId(1))), Some(crate::ids::ThreadId(1)));
    }

    #[test]
    fn find_thread_affinity_walks_to_the_nearest_ancestor_in_target_process() {
        let mut txs = BTreeMap::new();
        // tx1: P1/T1 -> P0 (outermost call).
        let tx1 = TransactionId(DebugId(1));
        txs.insert(
            tx1,
            transaction_fixture(tx1, ProcessId(1), crate::ids::ThreadId(1), ProcessId(2), None),
        );
        // tx2: P0 -> P2, nested under tx1.
        let tx2 = TransactionId(DebugId(2));
        txs.insert(
            tx2,
            transaction_fixture(tx2, ProcessId(2), crate::ids::ThreadId(20), ProcessId(3), Some(tx1)),
        );
        // tx3: P2 -> P1, nested under tx2 -- should land back on T1.
        let found = find_thread_affinity(&txs, Some(tx2), ProcessId(1));
        assert_eq!(found, Some(crate::ids::ThreadId(1)));
    }

    fn transaction_fixture(
        id: TransactionId,
        from_process: ProcessId,
        from_thread: crate::ids::ThreadId,
        to_process: ProcessId,
        from_parent: Option<TransactionId>,
    ) -> Transaction {
        Transaction {
            id,
            from_process,
            from_thread,
            to_process,
            to_thread: None,
            target_node: None,
            code: 0,
            is_oneway: false,
            is_reply: false,
            accept_fds: false,
            sender_euid: 0,
            buffer_offset: 0,
            data_size: 0,
            offsets_size: 0,
            sender_nice: Nice(0),
            from_parent,
            callee_prior_nice: Nice(0),
            state: crate::transaction::TransactionState::Pending,
        }
    }

    #[test]
    fn effective_priority_takes_the_more_important_side() {
        let caller = Nice(10);
        let floor = Nice(-5);
        assert_eq!(effective_priority(caller, floor), Nice(-5));
        assert_eq!(effective_priority(Nice(-10), Nice(0)), Nice(-10));
    }

    #[test]
    fn translate_export_creates_node_in_sender_and_handle_in_target() {
        let allocator = &mut IdAllocator::new();
        let mut sender = process(1);
        let mut target = process(2);
        let obj = FlatObject { object_type: ObjectType::BINDER, flags: 0, handle_or_ptr: 0xfeed, cookie: 0x1 };
        let (translated, work) = translate_export(allocator, &mut sender, ProcessId(1), &mut target, obj);
        assert_eq!(translated.object_type, ObjectType::HANDLE);
        assert!(work.is_some(), "first reference notifies the owner");
        assert_eq!(sender.nodes.len(), 1);
        assert_eq!(target.refs_by_descriptor.len(), 1);
    }

    #[test]
    fn translate_export_derives_node_min_priority_and_accept_fds_from_flags() {
        let allocator = &mut IdAllocator::new();
        let mut sender = process(1);
        let mut target = process(2);
        let flags = (10i8 as u32) | ObjectFlags::ACCEPTS_FDS.bits();
        let obj = FlatObject { object_type: ObjectType::BINDER, flags, handle_or_ptr: 0xfeed, cookie: 0x1 };
        translate_export(allocator, &mut sender, ProcessId(1), &mut target, obj);
        let node = sender.nodes.values().next().unwrap();
        assert_eq!(node.min_priority, Nice(10));
        assert!(node.accepts_fds);
    }

    #[test]
    fn translate_handle_back_to_owner_needs_no_new_reference() {
        let allocator = &mut IdAllocator::new();
        let mut sender = process(1);
        let mut owner = process(2);
        let export = FlatObject { object_type: ObjectType::BINDER, flags: 0, handle_or_ptr: 0x10, cookie: 0 };
        let (handle_obj, _) = translate_export(allocator, &mut owner, ProcessId(2), &mut sender, export);

        let back = translate_handle_to_owner(&mut sender, &mut owner, handle_obj).unwrap();
        assert_eq!(back.object_type, ObjectType::BINDER);
        assert_eq!(back.handle_or_ptr, 0x10);
    }
}
