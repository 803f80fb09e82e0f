// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Death subscriptions: a process asks to be told when the owner of
//! a node it holds a reference to goes away, and may cancel that ask
//! before or after the notification has actually been queued to it.

use crate::ids::{NodeId, ProcessId};

/// Work generated for a subscriber's queue by the death-notification engine.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct DeathWork {
    pub cookie: u64,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DeathState {
    /// Watching; nothing has happened yet.
    Armed,
    /// `BR_DEAD_BINDER` has been queued to the subscriber; waiting on
    /// `BC_DEAD_BINDER_DONE` before the subscription can be dropped.
    Delivered,
    /// The subscriber asked to clear this after delivery already happened;
    /// removal is deferred until the `BC_DEAD_BINDER_DONE` catches up, so a
    /// clear request can never race ahead of a notification already in the
    /// subscriber's queue.
    ClearPendingAck,
}

#[derive(Clone, Debug)]
pub struct DeathSubscription {
    pub node: NodeId,
    pub subscriber: ProcessId,
    pub cookie: u64,
    pub state: DeathState,
}

impl DeathSubscription {
    pub fn new(node: NodeId, subscriber: ProcessId, cookie: u64) -> Self {
        Self {
            node,
            subscriber,
            cookie,
            state: DeathState::Armed,
        }
    }

    /// The owner of `self.node` has died. Returns the work to deliver if
    /// this subscription was still armed; a subscription already delivered
    /// or mid-clear has nothing further to do.
    pub fn notify_death(&mut self) -> Option<DeathWork> {
        match self.state {
            DeathState::Armed => {
                self.state = DeathState::Delivered;
                Some(DeathWork { cookie: self.cookie })
            }
            DeathState::Delivered | DeathState::ClearPendingAck => None,
        }
    }

    /// `BC_CLEAR_DEATH_NOTIFICATION`. Returns `true` if the subscription
    /// should be removed immediately (nothing was ever delivered, so there
    /// is nothing for the subscriber to acknowledge), `false` if removal
    /// must wait for `BC_DEAD_BINDER_DONE`.
    pub fn request_clear(&mut self) -> bool {
        match self.state {
            DeathState::Armed => true,
            DeathState::Delivered => {
                self.state = DeathState::ClearPendingAck;
                false
            }
            DeathState::ClearPendingAck => false,
        }
    }

    /// `BC_DEAD_BINDER_DONE`. Returns `true` once the subscriber has
    /// acknowledged a delivered notification -- the caller should now
    /// remove this subscription unconditionally.
    pub fn acknowledge(&mut self) -> bool {
        matches!(self.state, DeathState::Delivered | DeathState::ClearPendingAck)
    }
}
