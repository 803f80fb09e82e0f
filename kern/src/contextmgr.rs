// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The context manager: the one well-known node reachable by every
//! process through `abi::CONTEXT_MANAGER_DESCRIPTOR` without having first
//! received a handle to it in a transaction.

use abi::Nice;
use thiserror::Error;

use crate::ids::{IdAllocator, NodeId, ProcessId};
use crate::node::Node;
use crate::process::Process;

#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ContextManagerError {
    #[error("a context manager is already registered")]
    AlreadyRegistered,
    #[error("no context manager is registered")]
    NotRegistered,
    #[error("only the registering process may unregister the context manager")]
    NotOwner,
}

/// Identifies the process and node currently playing context manager.
/// Exactly one may exist system-wide at a time.
#[derive(Copy, Clone, Debug)]
pub struct ContextManagerSlot {
    pub owner: ProcessId,
    pub node: NodeId,
}

/// `BINDER_SET_CONTEXT_MGR`. Creates the well-known node in `owner`'s
/// table (if one isn't already there for this `(ptr, cookie)`) and
/// returns the slot to install. Fails if a context manager already
/// exists -- the caller must `unregister` first.
pub fn register(
    slot: &Option<ContextManagerSlot>,
    allocator: &mut IdAllocator,
    owner: &mut Process,
    owner_id: ProcessId,
    ptr: u64,
    cookie: u64,
) -> Result<ContextManagerSlot, ContextManagerError> {
    if slot.is_some() {
        return Err(ContextManagerError::AlreadyRegistered);
    }
    let node_id = *owner.nodes_by_ptr.entry(ptr).or_insert_with(|| allocator.next_node_id());
    owner
        .nodes
        .entry(node_id)
        .or_insert_with(|| Node::new(node_id, owner_id, ptr, cookie, true, Nice::MIN));
    Ok(ContextManagerSlot { owner: owner_id, node: node_id })
}

/// Explicit unregistration (as opposed to the owner dying, which is
/// handled by teardown). Only the registering process may do this.
pub fn unregister(
    slot: &Option<ContextManagerSlot>,
    requester: ProcessId,
) -> Result<(), ContextManagerError> {
    match slot {
        None => Err(ContextManagerError::NotRegistered),
        Some(s) if s.owner != requester => Err(ContextManagerError::NotOwner),
        Some(_) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferPool;
    use abi::DebugId;

    #[test]
    fn registering_twice_without_unregister_fails() {
        let allocator = &mut IdAllocator::new();
        let mut owner = Process::new(ProcessId(1), BufferPool::new(4096, 0, DebugId(0)));
        let slot = register(&None, allocator, &mut owner, ProcessId(1), 0, 0).unwrap();
        let result = register(&Some(slot), allocator, &mut owner, ProcessId(1), 0, 0);
        assert_eq!(result.unwrap_err(), ContextManagerError::AlreadyRegistered);
    }

    #[test]
    fn only_owner_may_unregister() {
        let slot = ContextManagerSlot { owner: ProcessId(1), node: NodeId(DebugId(0)) };
        assert_eq!(
            unregister(&Some(slot), ProcessId(2)).unwrap_err(),
            ContextManagerError::NotOwner
        );
        assert!(unregister(&Some(slot), ProcessId(1)).is_ok());
    }
}
