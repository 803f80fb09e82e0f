// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The reference engine: composes [`crate::reference::Reference`]
//! (one process's local interest in a node) with [`crate::node::Node`]
//! (the owner's bookkeeping) into the operations the command dispatcher
//! actually calls -- `BC_INCREFS`/`BC_ACQUIRE`/`BC_RELEASE`/`BC_DECREFS`
//! from a holder, and `BC_INCREFS_DONE`/`BC_ACQUIRE_DONE` from an owner.
//!
//! Every function here takes the two `Process`es involved explicitly
//! rather than reaching into a shared `KernelState`, so it stays testable
//! without standing up a whole kernel, and so `Kernel` can use
//! `with_two_processes` (or a single process, when holder and owner are
//! the same) to get disjoint mutable borrows.

use crate::error::KernelError;
use crate::ids::NodeId;
use crate::node::NodeWork;
use crate::process::Process;

/// `BC_INCREFS`/`BC_ACQUIRE`: increases one process's local interest in a
/// handle. Returns the node work to deliver to the owner, if this is the
/// reference that pushed the node's count from zero to one.
pub fn holder_incr(
    holder: &mut Process,
    owner: &mut Process,
    descriptor: i32,
    strong: bool,
) -> Result<Option<NodeWork>, KernelError> {
    let reference = holder
        .refs_by_descriptor
        .get_mut(&descriptor)
        .ok_or(KernelError::UnknownProcess)?;
    let node_id = reference.node;
    let crossed = if strong {
        reference.incr_strong()
    } else {
        reference.incr_weak()
    };
    if !crossed {
        return Ok(None);
    }
    let node = owner.nodes.get_mut(&node_id).ok_or(KernelError::UnknownProcess)?;
    Ok(if strong { node.incr_strong() } else { node.incr_weak() })
}

/// `BC_RELEASE`/`BC_DECREFS`. Returns `(node_work, reference_now_dead)`;
/// the caller removes the reference from `holder`'s table when the second
/// element is `true`.
pub fn holder_decr(
    holder: &mut Process,
    owner: &mut Process,
    descriptor: i32,
    strong: bool,
) -> Result<(Option<NodeWork>, bool), KernelError> {
    let reference = holder
        .refs_by_descriptor
        .get_mut(&descriptor)
        .ok_or(KernelError::UnknownProcess)?;
    let node_id = reference.node;
    let crossed = if strong {
        reference.decr_strong()
    } else {
        reference.decr_weak()
    };
    let dead = reference.is_dead();
    if !crossed {
        return Ok((None, dead));
    }
    let node = owner.nodes.get_mut(&node_id).ok_or(KernelError::UnknownProcess)?;
    let work = if strong { node.decr_strong() } else { node.decr_weak() };
    Ok((work, dead))
}

/// `BC_ACQUIRE_DONE`/`BC_INCREFS_DONE`, sent by a node's owner to
/// acknowledge a `BR_ACQUIRE`/`BR_INCREFS` it was told about.
pub fn owner_ack(owner: &mut Process, node_id: NodeId, strong: bool) -> Result<Option<NodeWork>, KernelError> {
    let node = owner.nodes.get_mut(&node_id).ok_or(KernelError::UnknownProcess)?;
    Ok(if strong { node.ack_strong() } else { node.ack_weak() })
}

/// Removes `node_id` from its owner's tables if its refcounts and pending
/// acknowledgements have both settled at zero. Safe to call
/// speculatively after any operation that might have been the last one.
pub fn reap_node_if_dead(owner: &mut Process, node_id: NodeId) {
    let dead = owner.nodes.get(&node_id).map(|n| n.is_dead()).unwrap_or(false);
    if dead {
        if let Some(node) = owner.nodes.remove(&node_id) {
            owner.nodes_by_ptr.remove(&node.ptr);
        }
    }
}
