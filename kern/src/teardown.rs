// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Deferred process teardown: closing a process, or discovering it
//! has gone away, does not unwind its whole footprint in one lock hold.
//! Instead it is swept in a fixed order -- threads, then nodes, then
//! references, then death subscriptions, then buffers -- so that each
//! stage only ever needs the single process plus whatever cross-process
//! index `Kernel` consults between stages.
//!
//! The order matters: threads first so nothing new gets dispatched to a
//! dying process; nodes before references so a reference this process
//! holds to its own re-exported node (rare, but not impossible) still sees
//! a consistent one-directional teardown; deaths before buffers because a
//! delivered-but-unacknowledged death notification has nothing further to
//! wait on once the process is gone anyway.

use crate::ids::NodeId;
use crate::process::Process;
use crate::thread::LooperState;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SweepStage {
    Threads,
    Nodes,
    References,
    Deaths,
    Buffers,
    Complete,
}

impl SweepStage {
    fn next(self) -> Self {
        match self {
            Self::Threads => Self::Nodes,
            Self::Nodes => Self::References,
            Self::References => Self::Deaths,
            Self::Deaths => Self::Buffers,
            Self::Buffers => Self::Complete,
            Self::Complete => Self::Complete,
        }
    }
}

/// A process's position in the teardown sweep. `Kernel` keeps one of
/// these per dying process and advances it a stage at a time across
/// separate lock holds, rather than sweeping everything atomically.
#[derive(Copy, Clone, Debug)]
pub struct TeardownRequest {
    pub process: crate::ids::ProcessId,
    stage: SweepStage,
}

impl TeardownRequest {
    pub fn new(process: crate::ids::ProcessId) -> Self {
        Self { process, stage: SweepStage::Threads }
    }

    pub fn stage(&self) -> SweepStage {
        self.stage
    }

    pub fn advance(&mut self) {
        self.stage = self.stage.next();
    }

    pub fn is_complete(&self) -> bool {
        self.stage == SweepStage::Complete
    }
}

/// Stage 1: drops every queued work item and marks every thread exited, so
/// nothing dispatches further work here while the rest of the sweep runs.
pub fn sweep_threads(dying: &mut Process) {
    for thread in dying.threads.values_mut() {
        thread.todo.clear();
        thread.transaction_stack.clear();
        thread.looper.insert(LooperState::EXITED);
    }
    dying.process_todo.clear();
    dying.dying = true;
}

/// Stage 2: every node this process owned becomes ownerless. Returns their
/// ids so the caller can walk the global death-watcher index and notify
/// anyone subscribed to them, and can mark any live reference to them as
/// pointing at a dead node.
pub fn sweep_nodes(dying: &mut Process) -> Vec<NodeId> {
    let ids: Vec<NodeId> = dying.nodes.keys().copied().collect();
    dying.nodes.clear();
    dying.nodes_by_ptr.clear();
    ids
}

/// Stage 3: every reference this process held elsewhere is dropped.
/// Returns `(node, strong_count, weak_count)` so the caller can apply the
/// matching decrement to each node's owner -- which may itself already be
/// gone, in which case there is nothing left to do for that entry.
pub fn sweep_references(dying: &mut Process) -> Vec<(NodeId, u32, u32)> {
    let out = dying
        .refs_by_descriptor
        .values()
        .map(|r| (r.node, r.strong_count(), r.weak_count()))
        .collect();
    dying.refs_by_descriptor.clear();
    dying.refs_by_target.clear();
    out
}

/// Stage 4: every death subscription this process registered elsewhere is
/// dropped -- it can neither be delivered nor acknowledged any more.
/// Returns the watched nodes so the caller can drop this process from each
/// node's subscriber index.
pub fn sweep_deaths(dying: &mut Process) -> Vec<NodeId> {
    let ids = dying.death_subscriptions.keys().copied().collect();
    dying.death_subscriptions.clear();
    ids
}

/// Stage 5: the buffer pool is torn down. Any buffer a transaction still
/// had outstanding is forgotten along with the mapping itself.
pub fn sweep_buffers(dying: &mut Process) {
    dying.buffer_pool.mark_torn_down();
}
