// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The top-level orchestrator: one `Kernel<H>` per running system,
//! holding the single global `parking_lot::Mutex<KernelState>` the spec
//! calls for, and exposing the operations a host's syscall surface would
//! actually call -- open, mmap, write, read, the ioctls, and release.
//!
//! Command dispatch and the blocking read path live here
//! rather than in their own modules: both sides consult the same process
//! table and thread queues under the same lock, and splitting them would
//! mean threading that state through two more module boundaries for no
//! real separation of concerns. Syscall-shaped entry points dispatching
//! from one table rather than splitting by subsystem.

use std::collections::{BTreeMap, VecDeque};

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, trace, warn};
use parking_lot::{Condvar, Mutex};
use zerocopy::{FromBytes, IntoBytes};

use abi::{CommandCode, FlatObject, Nice, ObjectType, ProcessId, ReturnCode, ThreadId};

use crate::buffer::{Buffer, BufferPool, BufferUse};
use crate::codec::{decode_commands, encode_returns, Command, Return};
use crate::contextmgr::{self, ContextManagerSlot};
use crate::death::{DeathSubscription, DeathState};
use crate::error::{CommandError, KernelError, ProtocolError};
use crate::host::Host;
use crate::ids::{IdAllocator, NodeId, TransactionId};
use crate::node::NodeWork;
use crate::process::Process;
use crate::refcount;
use crate::reference::Reference;
use crate::teardown::{self, SweepStage, TeardownRequest};
use crate::thread::{LooperState, Thread, WorkItem};
use crate::transaction::{Transaction, TransactionState};
use crate::transaction_engine;

/// Something to unwind if a later flat object in the same transaction
/// fails to translate.
enum Undo {
    /// A reference `new_ref_holder` gained on `node`, owned by `node_owner`,
    /// which must be dropped by exactly one decrement on the matching axis.
    Reference {
        new_ref_holder: ProcessId,
        node_owner: ProcessId,
        node: NodeId,
        strong: bool,
        had_node_work: bool,
    },
    /// A file descriptor duplicated into `process` that was never actually
    /// handed to its user.
    Fd { process: ProcessId, fd: i32 },
}

/// Picks a target thread for `tx_id` in `to_process` and enqueues it,
/// falling back to the process queue with no idle looper available. Used
/// both for a transaction's first delivery and for a oneway transaction
/// that was parked in a node's `async_todo` until its predecessor's buffer
/// was freed.
fn enqueue_transaction(
    state: &mut KernelState,
    to_process: ProcessId,
    tx_id: TransactionId,
    preferred_thread: Option<ThreadId>,
    is_oneway: bool,
    is_reply: bool,
) {
    let target = match state.processes.get(&to_process) {
        Some(p) => transaction_engine::select_target_thread(p, preferred_thread),
        None => return,
    };
    let item = if is_reply { WorkItem::Reply(tx_id) } else { WorkItem::Transaction(tx_id) };
    if let Some(tid) = target {
        if let Some(p) = state.processes.get_mut(&to_process) {
            if let Some(thread) = p.threads.get_mut(&tid) {
                // Only a synchronous call occupies the receiving thread's
                // transaction stack -- a oneway send has no reply to pop it
                // back off, so pushing it there would leave the thread
                // permanently non-idle.
                if !is_reply && !is_oneway {
                    thread.push_transaction(tx_id);
                }
                thread.todo.push_back(item);
                return;
            }
        }
    }
    if let Some(p) = state.processes.get_mut(&to_process) {
        p.process_todo.push_back(item);
    }
}

struct KernelState {
    processes: BTreeMap<ProcessId, Process>,
    context_manager: Option<ContextManagerSlot>,
    /// Reverse index from a node to every process that owns it, so a
    /// three-party handle translation or a teardown sweep can find the
    /// owner without scanning every process.
    node_owner: BTreeMap<NodeId, ProcessId>,
    /// Reverse index from a node to every process subscribed to its
    /// owner's death, populated by `BC_REQUEST_DEATH_NOTIFICATION`.
    death_watchers: BTreeMap<NodeId, Vec<ProcessId>>,
    transactions: BTreeMap<TransactionId, Transaction>,
    ids: IdAllocator,
}

impl KernelState {
    fn new() -> Self {
        Self {
            processes: BTreeMap::new(),
            context_manager: None,
            node_owner: BTreeMap::new(),
            death_watchers: BTreeMap::new(),
            transactions: BTreeMap::new(),
            ids: IdAllocator::new(),
        }
    }

    fn process_mut(&mut self, id: ProcessId) -> Result<&mut Process, KernelError> {
        self.processes.get_mut(&id).ok_or(KernelError::UnknownProcess)
    }

    fn thread_mut(&mut self, process: ProcessId, thread: ThreadId) -> Result<&mut Thread, KernelError> {
        self.process_mut(process)?
            .threads
            .get_mut(&thread)
            .ok_or(KernelError::UnknownThread)
    }

    /// Mutably borrows two distinct processes at once by temporarily
    /// removing both from the table. Panics if `a == b`, which no caller
    /// here should ever attempt (self-transactions are not modeled).
    fn with_two<R>(&mut self, a: ProcessId, b: ProcessId, f: impl FnOnce(&mut Process, &mut Process) -> R) -> Option<R> {
        assert_ne!(a, b, "with_two requires distinct processes");
        let mut pa = self.processes.remove(&a)?;
        let mut pb = match self.processes.remove(&b) {
            Some(p) => p,
            None => {
                self.processes.insert(a, pa);
                return None;
            }
        };
        let result = f(&mut pa, &mut pb);
        self.processes.insert(a, pa);
        self.processes.insert(b, pb);
        Some(result)
    }

    fn with_three<R>(
        &mut self,
        a: ProcessId,
        b: ProcessId,
        c: ProcessId,
        f: impl FnOnce(&mut Process, &mut Process, &mut Process) -> R,
    ) -> Option<R> {
        assert!(a != b && b != c && a != c, "with_three requires distinct processes");
        let pa = self.processes.remove(&a)?;
        let pb = self.processes.remove(&b);
        let pc = self.processes.remove(&c);
        let (pb, pc) = match (pb, pc) {
            (Some(pb), Some(pc)) => (pb, pc),
            (pb, pc) => {
                self.processes.insert(a, pa);
                if let Some(pb) = pb {
                    self.processes.insert(b, pb);
                }
                if let Some(pc) = pc {
                    self.processes.insert(c, pc);
                }
                return None;
            }
        };
        let mut pa = pa;
        let mut pb = pb;
        let mut pc = pc;
        let result = f(&mut pa, &mut pb, &mut pc);
        self.processes.insert(a, pa);
        self.processes.insert(b, pb);
        self.processes.insert(c, pc);
        Some(result)
    }

    fn deliver(&mut self, process: ProcessId, item: WorkItem) {
        if let Some(p) = self.processes.get_mut(&process) {
            p.dispatch(item);
        }
    }

    fn deliver_node_work(&mut self, owner: ProcessId, work: Option<NodeWork>) {
        if let Some(work) = work {
            self.deliver(owner, WorkItem::Node(work));
        }
    }

    /// Delivers `item` to the specific thread that is waiting on it --
    /// the reply target recorded on the transaction -- rather than
    /// whichever idle looper happens to pick it up. Falls back to the
    /// process queue if that thread is no longer around. Returns whether
    /// the thread was actually blocked in a read, so the caller knows
    /// whether a host-level wakeup is needed.
    fn deliver_to_waiting_thread(&mut self, process: ProcessId, thread: ThreadId, item: WorkItem) -> bool {
        if let Some(p) = self.processes.get_mut(&process) {
            if let Some(t) = p.threads.get_mut(&thread) {
                return transaction_engine::deliver_to_thread(t, item);
            }
            p.process_todo.push_back(item);
        }
        false
    }

    /// A transaction has just been discovered undeliverable -- its target
    /// thread or process is gone. Its caller is never going to see a real
    /// reply, so it gets `BR_DEAD_REPLY` instead of waiting forever; and
    /// since that caller was itself blocked servicing some *other* call
    /// (the one recorded in `from_parent`), that call is equally doomed and
    /// gets the same treatment, all the way up the nesting chain. Removes
    /// every transaction it visits and returns the `(process, thread)`
    /// pairs that were actually woken, so the caller can issue host-level
    /// wakeups outside the lock.
    fn fail_transaction_chain(&mut self, start: TransactionId) -> Vec<(ProcessId, ThreadId)> {
        let mut woken = Vec::new();
        let mut cursor = Some(start);
        while let Some(id) = cursor {
            let Some(tx) = self.transactions.remove(&id) else { break };
            cursor = tx.from_parent;
            if tx.is_reply || tx.is_oneway {
                continue;
            }
            let (caller_process, caller_thread) = tx.reply_target();
            if self.deliver_to_waiting_thread(caller_process, caller_thread, WorkItem::FailedReply { dead: true }) {
                woken.push((caller_process, caller_thread));
            }
        }
        woken
    }
}

pub struct Kernel<H: Host> {
    state: Mutex<KernelState>,
    wake: Condvar,
    host: H,
}

impl<H: Host> Kernel<H> {
    pub fn new(host: H) -> Self {
        Self { state: Mutex::new(KernelState::new()), wake: Condvar::new(), host }
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    /// `open()`: allocates a process id and an (initially empty) process
    /// record. The buffer pool is installed by `mmap`.
    pub fn open_process(&self) -> ProcessId {
        let mut state = self.state.lock();
        let id = state.ids.next_process_id();
        let pool = BufferPool::new(0, 0, state.ids.next_debug_id());
        state.processes.insert(id, Process::new(id, pool));
        debug!("process {:?} opened", id);
        id
    }

    /// `mmap()`: installs the process's shared-memory buffer pool.
    pub fn mmap(&self, process: ProcessId, mapping_size: usize, user_buffer_offset: usize) -> Result<(), KernelError> {
        let mut state = self.state.lock();
        let debug_id = state.ids.next_debug_id();
        let p = state.process_mut(process)?;
        p.buffer_pool = BufferPool::new(mapping_size, user_buffer_offset, debug_id);
        Ok(())
    }

    pub fn add_thread(&self, process: ProcessId, thread: ThreadId) -> Result<(), KernelError> {
        let mut state = self.state.lock();
        let p = state.process_mut(process)?;
        p.threads.entry(thread).or_insert_with(|| Thread::new(thread));
        Ok(())
    }

    pub fn set_max_threads(&self, process: ProcessId, max: u32) -> Result<(), KernelError> {
        let mut state = self.state.lock();
        state.process_mut(process)?.thread_pool.max_threads = max;
        Ok(())
    }

    pub fn version(&self) -> u32 {
        abi::PROTOCOL_VERSION
    }

    /// `BINDER_SET_CONTEXT_MGR`.
    pub fn set_context_manager(&self, process: ProcessId, ptr: u64, cookie: u64) -> Result<(), contextmgr::ContextManagerError> {
        let mut state = self.state.lock();
        let ids = &mut state.ids;
        let slot_before = state.context_manager;
        let (owner, slot) = {
            let p = state
                .processes
                .get_mut(&process)
                .expect("process must be open before BINDER_SET_CONTEXT_MGR");
            (process, contextmgr::register(&slot_before, ids, p, process, ptr, cookie)?)
        };
        state.node_owner.insert(slot.node, owner);
        state.context_manager = Some(slot);
        Ok(())
    }

    /// `poll()`: readable iff the calling thread has work queued for it
    /// directly, or the process has work and this thread is idle (no
    /// transaction stack, empty todo) and so would be handed the next item.
    pub fn poll(&self, process: ProcessId, thread: ThreadId) -> bool {
        let mut state = self.state.lock();
        let Ok(p) = state.process_mut(process) else { return false };
        let Some(t) = p.threads.get(&thread) else { return false };
        if !t.todo.is_empty() {
            return true;
        }
        !p.process_todo.is_empty() && t.is_idle()
    }

    /// `flush()`: sets `NEED_RETURN` on every thread of `process` and wakes
    /// them, so each pops back to user-space on its next scheduling chance
    /// even with nothing new to deliver.
    pub fn flush(&self, process: ProcessId) -> Result<(), KernelError> {
        let mut state = self.state.lock();
        let p = state.process_mut(process)?;
        for thread in p.threads.values_mut() {
            thread.looper.insert(LooperState::NEED_RETURN);
        }
        drop(state);
        self.host.wake_process(process);
        self.wake.notify_all();
        Ok(())
    }

    /// Submits every command in `bytes` in order. The first command
    /// that cannot be parsed aborts the rest of the stream; a command that
    /// parses but fails semantically (e.g. an unknown handle) is recorded
    /// as a recoverable error on the issuing thread instead.
    pub fn write(&self, process: ProcessId, thread: ThreadId, bytes: &[u8]) -> Result<(), CommandError> {
        let commands = decode_commands(bytes)?;
        for command in commands {
            if let Err(CommandError::Recoverable(code)) = self.dispatch_command(process, thread, command) {
                let mut state = self.state.lock();
                if let Ok(t) = state.thread_mut(process, thread) {
                    t.return_error = Some(code);
                }
            }
        }
        self.wake.notify_all();
        Ok(())
    }

    fn dispatch_command(&self, process: ProcessId, thread: ThreadId, command: Command) -> Result<(), CommandError> {
        let mut state = self.state.lock();
        match command {
            Command::Transaction(td) | Command::Reply(td) => {
                let is_reply = matches!(command, Command::Reply(_));
                drop(state);
                self.begin_transaction(process, thread, td, is_reply)
            }
            Command::FreeBuffer(user_addr) => {
                let (buffer, plan) = {
                    let p = state.process_mut(process).map_err(|_| CommandError::Recoverable(ReturnCode::Error))?;
                    p.buffer_pool
                        .free_by_user_address(user_addr as usize)
                        .map_err(|_| CommandError::Recoverable(ReturnCode::Error))?
                };

                let mut delivered_next = false;
                if buffer.async_transaction {
                    if let Some(BufferUse { target_node: Some(node_id), .. }) = buffer.in_use {
                        let next = state.processes.get_mut(&process).and_then(|p| {
                            let node = p.nodes.get_mut(&node_id)?;
                            let next = node.async_todo.pop_front();
                            if next.is_none() {
                                node.has_async_transaction = false;
                            }
                            next
                        });
                        if let Some(next_id) = next {
                            if state.transactions.contains_key(&next_id) {
                                // Everything parked in a node's async_todo is
                                // necessarily a oneway send.
                                enqueue_transaction(&mut state, process, next_id, None, true, false);
                                delivered_next = true;
                            }
                        }
                    }
                }

                drop(state);
                for range in plan.pages_to_unmap {
                    let _ = self.host.unmap_pages(process, range);
                }
                if delivered_next {
                    self.host.wake_process(process);
                    self.wake.notify_all();
                }
                Ok(())
            }
            Command::Increfs(h) | Command::Acquire(h) => {
                let strong = matches!(command, Command::Acquire(_));
                self.holder_adjust(&mut state, process, h, strong, true)
            }
            Command::Release(h) | Command::Decrefs(h) => {
                let strong = matches!(command, Command::Release(_));
                self.holder_adjust(&mut state, process, h, strong, false)
            }
            Command::IncrefsDone { ptr, cookie } | Command::AcquireDone { ptr, cookie } => {
                let strong = matches!(command, Command::AcquireDone { .. });
                let p = state.process_mut(process).map_err(|_| CommandError::Recoverable(ReturnCode::Error))?;
                let node_id = match p.nodes_by_ptr.get(&ptr) {
                    Some(&id) => id,
                    None => return Err(CommandError::Recoverable(ReturnCode::Error)),
                };
                let _ = cookie;
                let work = refcount::owner_ack(p, node_id, strong).map_err(|_| CommandError::Recoverable(ReturnCode::Error))?;
                refcount::reap_node_if_dead(p, node_id);
                state.deliver_node_work(process, work);
                Ok(())
            }
            Command::RegisterLooper => {
                let p = state.process_mut(process).map_err(|_| CommandError::Recoverable(ReturnCode::Error))?;
                p.thread_pool.registered += 1;
                p.thread_pool.spawn_requested = false;
                if let Some(t) = p.threads.get_mut(&thread) {
                    if t.looper.contains(LooperState::LOOPING) {
                        t.looper.insert(LooperState::INVALID);
                    }
                    t.looper.insert(LooperState::REGISTERED | LooperState::LOOPING);
                }
                Ok(())
            }
            Command::EnterLooper => {
                let t = state.thread_mut(process, thread).map_err(|_| CommandError::Recoverable(ReturnCode::Error))?;
                if t.looper.contains(LooperState::LOOPING) {
                    t.looper.insert(LooperState::INVALID);
                }
                t.looper.insert(LooperState::REGISTERED | LooperState::LOOPING);
                Ok(())
            }
            Command::ExitLooper => {
                let t = state.thread_mut(process, thread).map_err(|_| CommandError::Recoverable(ReturnCode::Error))?;
                t.looper.remove(LooperState::LOOPING);
                Ok(())
            }
            Command::RequestDeathNotification { handle, cookie } => {
                let node_id = {
                    let p = state.process_mut(process).map_err(|_| CommandError::Recoverable(ReturnCode::Error))?;
                    match p.refs_by_descriptor.get(&handle) {
                        Some(r) => r.node,
                        None => return Err(CommandError::Recoverable(ReturnCode::Error)),
                    }
                };
                let p = state.process_mut(process).unwrap();
                p.death_subscriptions
                    .entry(node_id)
                    .or_default()
                    .push(DeathSubscription::new(node_id, process, cookie));
                state.death_watchers.entry(node_id).or_default().push(process);
                Ok(())
            }
            Command::ClearDeathNotification { handle, cookie } => {
                let node_id = {
                    let p = state.process_mut(process).map_err(|_| CommandError::Recoverable(ReturnCode::Error))?;
                    match p.refs_by_descriptor.get(&handle) {
                        Some(r) => r.node,
                        None => return Err(CommandError::Recoverable(ReturnCode::Error)),
                    }
                };
                let p = state.process_mut(process).unwrap();
                let mut never_delivered = false;
                if let Some(subs) = p.death_subscriptions.get_mut(&node_id) {
                    if let Some(sub) = subs.iter_mut().find(|s| s.cookie == cookie) {
                        if sub.request_clear() {
                            never_delivered = true;
                            subs.retain(|s| s.cookie != cookie);
                        }
                    }
                }
                // Nothing was ever delivered to acknowledge, so the
                // requester gets the clear's own acknowledgement instead.
                if never_delivered {
                    state.deliver(process, WorkItem::ClearDeath { cookie });
                }
                Ok(())
            }
            Command::DeadBinderDone { cookie } => {
                let p = state.process_mut(process).map_err(|_| CommandError::Recoverable(ReturnCode::Error))?;
                for subs in p.death_subscriptions.values_mut() {
                    subs.retain_mut(|s| !(s.cookie == cookie && s.acknowledge()));
                }
                Ok(())
            }
        }
    }

    fn holder_adjust(
        &self,
        state: &mut KernelState,
        holder: ProcessId,
        handle: i32,
        strong: bool,
        increment: bool,
    ) -> Result<(), CommandError> {
        // Descriptor 0 always names the context manager, whether or not
        // this process ever received an explicit reference to it --
        // `allocate_descriptor` never hands descriptor 0 out, so the first
        // `INCREFS`/`ACQUIRE` against it has to materialize the `Reference`
        // entry itself rather than finding one already there.
        let node_id = if handle == abi::CONTEXT_MANAGER_DESCRIPTOR {
            let node_id = state
                .context_manager
                .map(|slot| slot.node)
                .ok_or(CommandError::Recoverable(ReturnCode::DeadReply))?;
            if let Ok(p) = state.process_mut(holder) {
                p.refs_by_descriptor
                    .entry(abi::CONTEXT_MANAGER_DESCRIPTOR)
                    .or_insert_with(|| Reference::new(abi::CONTEXT_MANAGER_DESCRIPTOR, node_id));
                p.refs_by_target.entry(node_id).or_insert(abi::CONTEXT_MANAGER_DESCRIPTOR);
            }
            node_id
        } else {
            let p = state.process_mut(holder).map_err(|_| CommandError::Recoverable(ReturnCode::Error))?;
            match p.refs_by_descriptor.get(&handle) {
                Some(r) => r.node,
                None => return Err(CommandError::Recoverable(ReturnCode::Error)),
            }
        };
        let owner = match state.node_owner.get(&node_id).copied() {
            Some(o) => o,
            None => return Err(CommandError::Recoverable(ReturnCode::DeadReply)),
        };
        if increment {
            let work = state
                .with_two(holder, owner, |h, o| refcount::holder_incr(h, o, handle, strong))
                .transpose()
                .map_err(|_| CommandError::Recoverable(ReturnCode::Error))?
                .flatten();
            state.deliver_node_work(owner, work);
        } else {
            let (work, dead) = state
                .with_two(holder, owner, |h, o| refcount::holder_decr(h, o, handle, strong))
                .transpose()
                .map_err(|_| CommandError::Recoverable(ReturnCode::Error))?
                .unwrap_or((None, false));
            state.deliver_node_work(owner, work);
            if dead {
                if let Ok(p) = state.process_mut(holder) {
                    p.remove_reference(handle);
                }
            }
            if let Some(p) = state.processes.get_mut(&owner) {
                refcount::reap_node_if_dead(p, node_id);
                if !p.nodes.contains_key(&node_id) {
                    state.node_owner.remove(&node_id);
                }
            }
        }
        Ok(())
    }

    /// `BC_TRANSACTION`/`BC_REPLY`. Resolves the target, allocates
    /// and fills the destination buffer, translates every flat object in
    /// the payload, and enqueues the result.
    fn begin_transaction(
        &self,
        from_process: ProcessId,
        from_thread: ThreadId,
        td: abi::TransactionData,
        is_reply: bool,
    ) -> Result<(), CommandError> {
        let data_size = td.data_size as usize;
        let offsets_size = td.offsets_size as usize;

        let data_bytes = self
            .host
            .read_user_bytes(from_process, td.buffer_ptr, data_size)
            .map_err(|_| CommandError::Recoverable(ReturnCode::Error))?;
        let offsets_bytes = self
            .host
            .read_user_bytes(from_process, td.offsets_ptr, offsets_size)
            .map_err(|_| CommandError::Recoverable(ReturnCode::Error))?;

        const OFFSET_ENTRY_SIZE: usize = 8;
        if offsets_size % OFFSET_ENTRY_SIZE != 0 {
            return Err(CommandError::Recoverable(ReturnCode::Error));
        }
        let mut offsets = Vec::with_capacity(offsets_size / OFFSET_ENTRY_SIZE);
        for chunk in offsets_bytes.chunks_exact(OFFSET_ENTRY_SIZE) {
            let off = LittleEndian::read_u64(chunk);
            if off % abi::WORD_SIZE as u64 != 0 {
                return Err(CommandError::Recoverable(ReturnCode::Error));
            }
            let end = off
                .checked_add(FlatObject::WIRE_SIZE as u64)
                .ok_or(CommandError::Recoverable(ReturnCode::Error))?;
            if end > data_size as u64 {
                return Err(CommandError::Recoverable(ReturnCode::Error));
            }
            offsets.push(off as usize);
        }

        let is_oneway = td.flags & abi::TransactionFlags::ONE_WAY.bits() != 0;

        let mut state = self.state.lock();

        // The nested-call context this send is made from, if any -- the
        // transaction (in any process) that `from_thread` is currently
        // servicing as a callee. Used both to link this transaction's own
        // `from_parent` and, for a synchronous send, to search for a
        // thread-affinity match in the target process. Oneway sends have no
        // reply to route, so affinity (a dependent-thread optimization for
        // nested two-way calls) does not apply to them.
        let sender_context = if is_reply {
            None
        } else {
            state
                .processes
                .get(&from_process)
                .and_then(|p| p.threads.get(&from_thread))
                .and_then(|t| t.top_transaction())
        };

        let (to_process, target_node, to_thread, accept_fds) = if is_reply {
            let t_id = {
                let t = state
                    .thread_mut(from_process, from_thread)
                    .map_err(|_| CommandError::Recoverable(ReturnCode::Error))?;
                t.pop_transaction().ok_or(CommandError::Recoverable(ReturnCode::Error))?
            };
            let original = state
                .transactions
                .get(&t_id)
                .ok_or(CommandError::Recoverable(ReturnCode::Error))?
                .clone();
            // This thread inherited the caller's (or the node's floor)
            // priority when the call it is now replying to was dispatched
            // to it; restore what it was running at before that.
            let restored = original.callee_prior_nice;
            if let Ok(t) = state.thread_mut(from_process, from_thread) {
                t.nice = restored;
            }
            self.host.set_thread_nice(from_process, from_thread, restored);
            // A reply may carry an FD only if the call it answers asked
            // for one with `TF_ACCEPT_FDS` when it was originally sent.
            (original.from_process, None, Some(original.from_thread), original.accept_fds)
        } else if td.target as i32 == abi::CONTEXT_MANAGER_DESCRIPTOR {
            let slot = state.context_manager.ok_or(CommandError::Recoverable(ReturnCode::DeadReply))?;
            let affinity = (!is_oneway)
                .then(|| transaction_engine::find_thread_affinity(&state.transactions, sender_context, slot.owner))
                .flatten();
            let node_accepts_fds =
                state.processes.get(&slot.owner).and_then(|p| p.nodes.get(&slot.node)).is_some_and(|n| n.accepts_fds);
            (slot.owner, Some(slot.node), affinity, node_accepts_fds)
        } else {
            let p = state.process_mut(from_process).map_err(|_| CommandError::Recoverable(ReturnCode::Error))?;
            let node_id = p
                .refs_by_descriptor
                .get(&(td.target as i32))
                .map(|r| r.node)
                .ok_or(CommandError::Recoverable(ReturnCode::Error))?;
            let owner = state.node_owner.get(&node_id).copied().ok_or(CommandError::Recoverable(ReturnCode::DeadReply))?;
            let affinity = (!is_oneway)
                .then(|| transaction_engine::find_thread_affinity(&state.transactions, sender_context, owner))
                .flatten();
            let node_accepts_fds =
                state.processes.get(&owner).and_then(|p| p.nodes.get(&node_id)).is_some_and(|n| n.accepts_fds);
            (owner, Some(node_id), affinity, node_accepts_fds)
        };

        if to_process == from_process {
            warn!("refusing self-directed transaction from {:?}", from_process);
            return Err(CommandError::Recoverable(ReturnCode::Error));
        }

        // What this transaction itself declares, stashed for a later reply
        // to consult -- irrelevant to a reply's own FD gating, which uses
        // `accept_fds` (the in-reply-to call's declaration) instead.
        let declared_accept_fds = td.flags & abi::TransactionFlags::ACCEPT_FDS.bits() != 0;

        let caller_nice = state
            .processes
            .get(&from_process)
            .and_then(|p| p.threads.get(&from_thread))
            .map(|t| t.nice)
            .unwrap_or(Nice(0));

        let from_parent = sender_context;

        drop(state);

        let buffer = self.allocate_transaction_buffer(to_process, data_size, offsets_size, is_oneway)?;

        let mut state = self.state.lock();

        {
            let p = state.process_mut(to_process).map_err(|_| CommandError::Recoverable(ReturnCode::DeadReply))?;
            let needed = buffer.offsets_range().end;
            if p.mapping.len() < needed {
                p.mapping.resize(needed, 0);
            }
            p.mapping[buffer.data_range()].copy_from_slice(&data_bytes);
            p.mapping[buffer.offsets_range()].copy_from_slice(&offsets_bytes);
        }

        let mut undos = Vec::new();
        let mut node_works: Vec<(ProcessId, NodeWork)> = Vec::new();
        let mut translation_failed = false;

        for &off in &offsets {
            let obj_bytes = {
                let p = state.processes.get(&to_process).expect("checked above");
                p.mapping[buffer.offset + off..buffer.offset + off + FlatObject::WIRE_SIZE].to_vec()
            };
            let obj = match FlatObject::read_from_bytes(&obj_bytes) {
                Ok(o) => o,
                Err(_) => {
                    translation_failed = true;
                    break;
                }
            };
            match self.translate_one(&mut state, from_process, to_process, accept_fds, obj) {
                Ok((translated, work, undo)) => {
                    if let Some(w) = work {
                        node_works.push(w);
                    }
                    if let Some(u) = undo {
                        undos.push(u);
                    }
                    if let Some(p) = state.processes.get_mut(&to_process) {
                        let start = buffer.offset + off;
                        p.mapping[start..start + FlatObject::WIRE_SIZE].copy_from_slice(translated.as_bytes());
                    }
                }
                Err(()) => {
                    translation_failed = true;
                    break;
                }
            }
        }

        if translation_failed {
            for undo in undos {
                self.undo_translation(&mut state, undo);
            }
            let plan = state.processes.get_mut(&to_process).and_then(|p| p.buffer_pool.free(buffer.offset));
            drop(state);
            if let Some(plan) = plan {
                for range in plan.pages_to_unmap {
                    let _ = self.host.unmap_pages(to_process, range);
                }
            }
            return Err(CommandError::Recoverable(ReturnCode::FailedReply));
        }

        let tx_id = state.ids.next_transaction_id();
        let tx = Transaction {
            id: tx_id,
            from_process,
            from_thread,
            to_process,
            to_thread,
            target_node,
            code: td.code,
            is_oneway,
            is_reply,
            accept_fds: declared_accept_fds,
            sender_euid: td.sender_uid,
            buffer_offset: buffer.offset,
            data_size,
            offsets_size,
            sender_nice: caller_nice,
            from_parent,
            callee_prior_nice: Nice(0),
            state: TransactionState::Pending,
        };
        state.transactions.insert(tx_id, tx);

        if let Some(p) = state.processes.get_mut(&to_process) {
            p.buffer_pool.set_in_use(buffer.offset, BufferUse { transaction: tx_id, target_node });
        }

        for (owner, work) in node_works {
            state.deliver(owner, WorkItem::Node(work));
        }

        let mut deliver_now = true;
        if is_oneway && !is_reply {
            if let Some(node_id) = target_node {
                if let Some(p) = state.processes.get_mut(&to_process) {
                    if let Some(node) = p.nodes.get_mut(&node_id) {
                        if node.has_async_transaction {
                            node.async_todo.push_back(tx_id);
                            deliver_now = false;
                        } else {
                            node.has_async_transaction = true;
                        }
                    }
                }
            }
        }

        if deliver_now {
            enqueue_transaction(&mut state, to_process, tx_id, to_thread, is_oneway, is_reply);
        }
        trace!("transaction {:?} queued {:?} -> {:?}", tx_id, from_process, to_process);

        if !is_reply {
            if let Ok(t) = state.thread_mut(from_process, from_thread) {
                t.todo.push_back(WorkItem::TransactionComplete);
            }
        }

        drop(state);
        self.host.wake_process(to_process);
        self.wake.notify_all();
        Ok(())
    }

    /// Allocates a buffer for `to_process`'s mapping via the two-phase
    /// dance the locking discipline requires: plan under the lock, drop it
    /// to call `Host::map_pages`, then re-lock to commit. Retries a bounded number
    /// of times if another allocation won the free span while the lock was
    /// dropped.
    fn allocate_transaction_buffer(
        &self,
        to_process: ProcessId,
        data_size: usize,
        offsets_size: usize,
        is_async: bool,
    ) -> Result<Buffer, CommandError> {
        for _ in 0..4 {
            let mut state = self.state.lock();
            let debug_id = state.ids.next_debug_id();
            let p = state.process_mut(to_process).map_err(|_| CommandError::Recoverable(ReturnCode::DeadReply))?;
            let (plan, _template) = p
                .buffer_pool
                .plan_alloc(data_size, offsets_size, is_async, debug_id)
                .map_err(|_| CommandError::Recoverable(ReturnCode::FailedReply))?;
            drop(state);

            for range in &plan.pages_to_map {
                self.host
                    .map_pages(to_process, range.clone())
                    .map_err(|_| CommandError::Recoverable(ReturnCode::FailedReply))?;
            }

            let mut state = self.state.lock();
            let p = state.process_mut(to_process).map_err(|_| CommandError::Recoverable(ReturnCode::DeadReply))?;
            if let Some(buffer) = p.buffer_pool.commit_alloc(plan) {
                return Ok(buffer);
            }
        }
        Err(CommandError::Recoverable(ReturnCode::FailedReply))
    }

    /// Translates one flat object embedded in a transaction's payload from
    /// `from_process`'s namespace into `to_process`'s. Returns the
    /// rewritten object, any node work the translation generated (destined
    /// for the node's owner), and an `Undo` to reverse it if a later object
    /// in the same transaction fails.
    fn translate_one(
        &self,
        state: &mut KernelState,
        from_process: ProcessId,
        to_process: ProcessId,
        accept_fds: bool,
        obj: FlatObject,
    ) -> Result<(FlatObject, Option<(ProcessId, NodeWork)>, Option<Undo>), ()> {
        if obj.object_type == ObjectType::BINDER || obj.object_type == ObjectType::WEAK_BINDER {
            let mut ids = std::mem::take(&mut state.ids);
            let result = state.with_two(from_process, to_process, |sender, target| {
                transaction_engine::translate_export(&mut ids, sender, from_process, target, obj)
            });
            state.ids = ids;
            let (translated, work) = result.ok_or(())?;
            let node_id = state
                .processes
                .get(&from_process)
                .and_then(|p| p.nodes_by_ptr.get(&obj.handle_or_ptr).copied())
                .ok_or(())?;
            state.node_owner.insert(node_id, from_process);
            let had_node_work = work.is_some();
            let strong = obj.object_type == ObjectType::BINDER;
            let node_work = work.map(|w| (from_process, w));
            let undo = Some(Undo::Reference {
                new_ref_holder: to_process,
                node_owner: from_process,
                node: node_id,
                strong,
                had_node_work,
            });
            return Ok((translated, node_work, undo));
        }

        if obj.object_type == ObjectType::HANDLE || obj.object_type == ObjectType::WEAK_HANDLE {
            let strong = obj.object_type == ObjectType::HANDLE;
            let descriptor = obj.handle_or_ptr as i32;
            let node_id = state
                .processes
                .get(&from_process)
                .and_then(|p| p.refs_by_descriptor.get(&descriptor))
                .map(|r| r.node)
                .ok_or(())?;
            let owner_pid = state.node_owner.get(&node_id).copied().ok_or(())?;

            if owner_pid == to_process {
                let translated = state
                    .with_two(from_process, to_process, |holder, owner_target| {
                        transaction_engine::translate_handle_to_owner(holder, owner_target, obj)
                    })
                    .ok_or(())?
                    .map_err(|_| ())?;
                return Ok((translated, None, None));
            }

            if owner_pid == from_process {
                // The holder is itself the node's owner -- equivalent to
                // `translate_handle_to_other` with owner == holder, which
                // can't be expressed as two distinct `&mut Process`
                // borrows, so it's inlined here.
                let result = state.with_two(from_process, to_process, |holder_owner, target| {
                    let target_ref = target.find_or_create_ref(node_id);
                    let crossed = if strong { target_ref.incr_strong() } else { target_ref.incr_weak() };
                    let work = if crossed {
                        holder_owner
                            .nodes
                            .get_mut(&node_id)
                            .and_then(|n| if strong { n.incr_strong() } else { n.incr_weak() })
                    } else {
                        None
                    };
                    let descriptor_out = target.refs_by_target[&node_id];
                    let out_type = if strong { ObjectType::HANDLE } else { ObjectType::WEAK_HANDLE };
                    (
                        FlatObject { object_type: out_type, flags: obj.flags, handle_or_ptr: descriptor_out as u64, cookie: 0 },
                        work,
                    )
                });
                let (translated, work) = result.ok_or(())?;
                let had_node_work = work.is_some();
                let node_work = work.map(|w| (owner_pid, w));
                let undo = Some(Undo::Reference {
                    new_ref_holder: to_process,
                    node_owner: owner_pid,
                    node: node_id,
                    strong,
                    had_node_work,
                });
                return Ok((translated, node_work, undo));
            }

            let result = state.with_three(from_process, to_process, owner_pid, |holder, target, owner| {
                transaction_engine::translate_handle_to_other(holder, target, owner, obj)
            });
            let (translated, work) = result.ok_or(())?.map_err(|_| ())?;
            let had_node_work = work.is_some();
            let node_work = work.map(|w| (owner_pid, w));
            let undo = Some(Undo::Reference {
                new_ref_holder: to_process,
                node_owner: owner_pid,
                node: node_id,
                strong,
                had_node_work,
            });
            return Ok((translated, node_work, undo));
        }

        if obj.object_type == ObjectType::FD {
            if !accept_fds {
                return Err(());
            }
            let new_fd = self
                .host
                .duplicate_fd(from_process, obj.handle_or_ptr as i32, to_process)
                .map_err(|_| ())?;
            let translated =
                FlatObject { object_type: ObjectType::FD, flags: obj.flags, handle_or_ptr: new_fd as u64, cookie: obj.cookie };
            return Ok((translated, None, Some(Undo::Fd { process: to_process, fd: new_fd })));
        }

        Err(())
    }

    /// Reverses one object translation applied earlier in a transaction
    /// that ultimately failed.
    fn undo_translation(&self, state: &mut KernelState, undo: Undo) {
        match undo {
            Undo::Reference { new_ref_holder, node_owner, node, strong, had_node_work } => {
                state.with_two(new_ref_holder, node_owner, |holder, owner| {
                    let Some(&descriptor) = holder.refs_by_target.get(&node) else { return };
                    let Some(reference) = holder.refs_by_descriptor.get_mut(&descriptor) else { return };
                    let crossed = if strong { reference.decr_strong() } else { reference.decr_weak() };
                    if reference.is_dead() {
                        holder.remove_reference(descriptor);
                    }
                    if crossed {
                        if let Some(n) = owner.nodes.get_mut(&node) {
                            n.undo_incr(strong, had_node_work);
                        }
                    }
                });
            }
            Undo::Fd { process, fd } => {
                self.host.close_fd(process, fd);
            }
        }
    }

    /// Drains this thread's queue, falling back to the process queue,
    /// blocking on the shared condition variable if `block` is set and
    /// nothing is ready.
    pub fn read(&self, process: ProcessId, thread: ThreadId, block: bool) -> Result<Vec<u8>, KernelError> {
        let mut state = self.state.lock();
        // A fresh thread, or one `flush()` marked, pops back to user-space
        // after this one pass regardless of `block` -- consumed here so the
        // next call behaves normally again.
        let needs_prompt_return = match state.thread_mut(process, thread) {
            Ok(t) => {
                let had_it = t.looper.contains(LooperState::NEED_RETURN);
                t.looper.remove(LooperState::NEED_RETURN);
                had_it
            }
            Err(_) => false,
        };
        let block = block && !needs_prompt_return;
        loop {
            // Every read that actually produces bytes opens with BR_NOOP, so
            // a process speaking a newer or older protocol version can
            // always tell it got a reply at all.
            let mut returns = vec![Return::Noop];

            if let Ok(t) = state.thread_mut(process, thread) {
                if let Some(err) = t.return_error.take() {
                    returns.push(Return::Error(err as i32));
                }
            }

            let item = {
                let p = state.process_mut(process)?;
                p.threads
                    .get_mut(&thread)
                    .and_then(|t| t.todo.pop_front())
                    .or_else(|| p.process_todo.pop_front())
            };

            if let Some(item) = item {
                self.render_work_item(&mut state, process, thread, item, &mut returns);
                return Ok(encode_returns(&returns));
            }

            if returns.len() > 1 {
                return Ok(encode_returns(&returns));
            }

            let should_spawn = {
                let p = state.process_mut(process)?;
                p.idle_thread_count() == 0
                    && p.thread_pool.registered < p.thread_pool.max_threads
                    && !p.thread_pool.spawn_requested
            };
            if should_spawn {
                let p = state.process_mut(process)?;
                p.thread_pool.spawn_requested = true;
                return Ok(encode_returns(&[Return::Noop, Return::SpawnLooper]));
            }

            if !block {
                return Ok(Vec::new());
            }
            if let Ok(t) = state.thread_mut(process, thread) {
                t.blocked = true;
            }
            self.wake.wait(&mut state);
            if let Ok(t) = state.thread_mut(process, thread) {
                t.blocked = false;
            }
        }
    }

    /// Builds the wire payload for a `BR_TRANSACTION`/`BR_REPLY` record from
    /// a transaction's current state: the target node's pointer/cookie (if
    /// any) and the location of its buffer within the receiving process's
    /// mapping.
    fn build_transaction_data(&self, state: &KernelState, tx: &Transaction) -> abi::TransactionData {
        let (ptr, cookie) = tx
            .target_node
            .and_then(|n| state.processes.get(&tx.to_process).and_then(|p| p.nodes.get(&n)))
            .map(|n| (n.ptr, n.cookie))
            .unwrap_or((0, 0));
        let (data_size, offsets_size, buffer_ptr, offsets_ptr) = state
            .processes
            .get(&tx.to_process)
            .and_then(|p| p.buffer_pool.get(tx.buffer_offset).map(|b| (p.buffer_pool.user_buffer_offset(), b)))
            .map(|(base, b)| {
                (
                    b.data_size as u64,
                    b.offsets_size as u64,
                    (base + b.data_range().start) as u64,
                    (base + b.offsets_range().start) as u64,
                )
            })
            .unwrap_or((0, 0, 0, 0));
        abi::TransactionData {
            target: ptr,
            cookie,
            code: tx.code,
            flags: if tx.is_oneway { abi::TransactionFlags::ONE_WAY.bits() } else { 0 },
            sender_pid: tx.from_process.0,
            sender_uid: tx.sender_euid,
            data_size,
            offsets_size,
            buffer_ptr,
            offsets_ptr,
        }
    }

    fn render_work_item(
        &self,
        state: &mut KernelState,
        process: ProcessId,
        thread: ThreadId,
        item: WorkItem,
        out: &mut Vec<Return>,
    ) {
        match item {
            WorkItem::Transaction(id) => {
                if let Some(tx) = state.transactions.get(&id).cloned() {
                    // This thread is about to become the callee of a
                    // synchronous call. Save what it was running at, then
                    // adopt whichever of the caller's priority or the node's
                    // declared floor is more important -- restored when it
                    // eventually replies.
                    if !tx.is_oneway {
                        let node_min_priority = tx
                            .target_node
                            .and_then(|n| state.processes.get(&process).and_then(|p| p.nodes.get(&n)))
                            .map(|n| n.min_priority)
                            .unwrap_or(Nice(0));
                        let wanted = transaction_engine::effective_priority(tx.sender_nice, node_min_priority);
                        let clamped = self.host.clamp_nice(process, wanted);
                        let prior = state
                            .processes
                            .get_mut(&process)
                            .and_then(|p| p.threads.get_mut(&thread))
                            .map(|t| {
                                let prior = t.nice;
                                t.nice = clamped;
                                prior
                            })
                            .unwrap_or(Nice(0));
                        if let Some(txm) = state.transactions.get_mut(&id) {
                            txm.callee_prior_nice = prior;
                        }
                        self.host.set_thread_nice(process, thread, clamped);
                    }
                    out.push(Return::Transaction(self.build_transaction_data(state, &tx)));
                }
            }
            WorkItem::Reply(id) => {
                if let Some(tx) = state.transactions.get(&id).cloned() {
                    out.push(Return::Reply(self.build_transaction_data(state, &tx)));
                }
            }
            WorkItem::TransactionComplete => out.push(Return::TransactionComplete),
            WorkItem::FailedReply { dead } => out.push(if dead { Return::DeadReply } else { Return::FailedReply }),
            WorkItem::Node(work) => {
                let p = state.processes.get(&process);
                let (ptr, cookie) = p
                    .and_then(|p| {
                        let id = match work {
                            NodeWork::Increfs(n) | NodeWork::Acquire(n) | NodeWork::Release(n) | NodeWork::Decrefs(n) => n,
                        };
                        p.nodes.get(&id).map(|n| (n.ptr, n.cookie))
                    })
                    .unwrap_or((0, 0));
                out.push(match work {
                    NodeWork::Increfs(_) => Return::Increfs { ptr, cookie },
                    NodeWork::Acquire(_) => Return::Acquire { ptr, cookie },
                    NodeWork::Release(_) => Return::Release { ptr, cookie },
                    NodeWork::Decrefs(_) => Return::Decrefs { ptr, cookie },
                });
            }
            WorkItem::Dead(work) => out.push(Return::DeadBinder { cookie: work.cookie }),
            WorkItem::ClearDeath { cookie } => out.push(Return::ClearDeathNotificationDone { cookie }),
            WorkItem::SpawnLooper => out.push(Return::SpawnLooper),
        }
    }

    /// `BINDER_THREAD_EXIT`.
    pub fn thread_exit(&self, process: ProcessId, thread: ThreadId) -> Result<(), KernelError> {
        let mut state = self.state.lock();
        let p = state.process_mut(process)?;
        let Some(t) = p.threads.remove(&thread) else {
            return Ok(());
        };
        if t.looper.contains(LooperState::REGISTERED) {
            p.thread_pool.registered = p.thread_pool.registered.saturating_sub(1);
        }

        // Any two-way call this thread was in the middle of servicing dies
        // with it: the sender is never going to see a reply, so it gets
        // BR_DEAD_REPLY instead of waiting forever. A call it had sent out
        // and was itself blocked on just loses its from-pointer -- nothing to
        // clean up there, the reply (if it ever arrives) will simply find no
        // thread to route to.
        let mut buffers_to_free = Vec::new();
        let mut woken = Vec::new();
        for tx_id in t.transaction_stack {
            let Some(tx) = state.transactions.get(&tx_id) else { continue };
            if tx.to_process != process || tx.is_reply || tx.is_oneway {
                continue;
            }
            // This process's buffer for the innermost call is freed here;
            // any ancestor failed further up the chain lives in some other
            // process's pool and is untouched by this teardown.
            buffers_to_free.push(tx.buffer_offset);
            woken.extend(state.fail_transaction_chain(tx_id));
        }
        let mut unmap_plans = Vec::new();
        if let Ok(p) = state.process_mut(process) {
            for offset in buffers_to_free {
                if let Some(plan) = p.buffer_pool.free(offset) {
                    unmap_plans.push(plan);
                }
            }
        }
        drop(state);
        for plan in unmap_plans {
            for range in plan.pages_to_unmap {
                let _ = self.host.unmap_pages(process, range);
            }
        }
        for (caller_process, caller_thread) in woken {
            self.host.wake_thread(caller_process, caller_thread);
        }
        self.wake.notify_all();
        Ok(())
    }

    /// `close()`: runs every stage of the deferred teardown for
    /// `process` in one call. A production host would yield the lock
    /// between stages; doing so here would need an async runtime this
    /// crate does not otherwise depend on, so the stages simply run back
    /// to back under one lock acquisition -- still in the mandated order,
    /// just without the intermediate unlocks.
    pub fn release(&self, process: ProcessId) {
        let mut state = self.state.lock();
        let mut req = TeardownRequest::new(process);
        while !req.is_complete() {
            self.run_teardown_stage(&mut state, &mut req);
            req.advance();
        }
        state.processes.remove(&process);
        drop(state);
        self.wake.notify_all();
    }

    fn run_teardown_stage(&self, state: &mut KernelState, req: &mut TeardownRequest) {
        let process = req.process;
        match req.stage() {
            SweepStage::Threads => {
                // Anything still sitting in a queue or a transaction stack
                // here is a synchronous call this process will now never
                // answer. Its caller gets BR_DEAD_REPLY instead of waiting
                // forever; the transaction record itself is resolved either
                // way, queued reply or not, so it doesn't linger after this
                // process is gone.
                let mut resolved_other = Vec::new();
                let mut sync_starts = Vec::new();
                if let Some(p) = state.processes.get(&process) {
                    let mut ids: Vec<TransactionId> = Vec::new();
                    for thread in p.threads.values() {
                        ids.extend(thread.transaction_stack.iter().copied());
                        for item in &thread.todo {
                            if let WorkItem::Transaction(id) | WorkItem::Reply(id) = item {
                                ids.push(*id);
                            }
                        }
                    }
                    for item in &p.process_todo {
                        if let WorkItem::Transaction(id) | WorkItem::Reply(id) = item {
                            ids.push(*id);
                        }
                    }
                    for id in ids {
                        let Some(tx) = state.transactions.get(&id) else { continue };
                        if tx.to_process == process && !tx.is_reply && !tx.is_oneway {
                            // Walked (and removed) via fail_transaction_chain below,
                            // along with every live ancestor up its from_parent chain.
                            sync_starts.push(id);
                        } else {
                            resolved_other.push(id);
                        }
                    }
                }
                for id in resolved_other {
                    state.transactions.remove(&id);
                }
                if let Some(p) = state.processes.get_mut(&process) {
                    teardown::sweep_threads(p);
                }
                for id in sync_starts {
                    state.fail_transaction_chain(id);
                }
            }
            SweepStage::Nodes => {
                let orphaned = state.processes.get_mut(&process).map(teardown::sweep_nodes).unwrap_or_default();
                for node_id in orphaned {
                    state.node_owner.remove(&node_id);
                    if let Some(subscribers) = state.death_watchers.remove(&node_id) {
                        for subscriber in subscribers {
                            if subscriber == process {
                                continue;
                            }
                            if let Some(sp) = state.processes.get_mut(&subscriber) {
                                if let Some(subs) = sp.death_subscriptions.get_mut(&node_id) {
                                    for sub in subs.iter_mut() {
                                        if let Some(work) = sub.notify_death() {
                                            sp.dispatch(WorkItem::Dead(work));
                                        }
                                    }
                                }
                            }
                        }
                    }
                }
            }
            SweepStage::References => {
                let held = state.processes.get_mut(&process).map(teardown::sweep_references).unwrap_or_default();
                for (node_id, strong, weak) in held {
                    let Some(owner) = state.node_owner.get(&node_id).copied() else { continue };
                    if owner == process {
                        continue;
                    }
                    if let Some(op) = state.processes.get_mut(&owner) {
                        if let Some(node) = op.nodes.get_mut(&node_id) {
                            let mut last_strong = None;
                            for _ in 0..strong {
                                last_strong = node.decr_strong();
                            }
                            let mut last_weak = None;
                            for _ in 0..weak {
                                last_weak = node.decr_weak();
                            }
                            if let Some(w) = last_strong {
                                op.dispatch(WorkItem::Node(w));
                            }
                            if let Some(w) = last_weak {
                                op.dispatch(WorkItem::Node(w));
                            }
                        }
                        refcount::reap_node_if_dead(op, node_id);
                        if !op.nodes.contains_key(&node_id) {
                            state.node_owner.remove(&node_id);
                        }
                    }
                }
            }
            SweepStage::Deaths => {
                let watched = state.processes.get_mut(&process).map(teardown::sweep_deaths).unwrap_or_default();
                for node_id in watched {
                    if let Some(subs) = state.death_watchers.get_mut(&node_id) {
                        subs.retain(|&p| p != process);
                    }
                }
            }
            SweepStage::Buffers => {
                if let Some(p) = state.processes.get_mut(&process) {
                    teardown::sweep_buffers(p);
                }
            }
            SweepStage::Complete => {}
        }
    }
}
