// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! End-to-end scenarios driven entirely through `Kernel`'s public
//! operations and an in-memory `FakeHost`, exactly as a real character-
//! device shim and a real process would drive it, just without any real
//! memory or scheduler underneath.

use byteorder::{ByteOrder, LittleEndian};
use zerocopy::{FromBytes, IntoBytes};

use abi::{CommandCode, FlatObject, Nice, ObjectFlags, ObjectType, ProcessId, ReturnCode, ThreadId, TransactionData};
use kern::host::fake::FakeHost;
use kern::kernel::Kernel;

const MAPPING_SIZE: usize = 128 * 1024;

fn push_u32(buf: &mut Vec<u8>, v: u32) {
    let mut tmp = [0u8; 4];
    LittleEndian::write_u32(&mut tmp, v);
    buf.extend_from_slice(&tmp);
}

fn push_u64(buf: &mut Vec<u8>, v: u64) {
    let mut tmp = [0u8; 8];
    LittleEndian::write_u64(&mut tmp, v);
    buf.extend_from_slice(&tmp);
}

fn command(code: CommandCode) -> Vec<u8> {
    let mut buf = Vec::new();
    push_u32(&mut buf, code as u32);
    buf
}

fn command_i32(code: CommandCode, v: i32) -> Vec<u8> {
    let mut buf = command(code);
    push_u32(&mut buf, v as u32);
    buf
}

fn command_u64(code: CommandCode, v: u64) -> Vec<u8> {
    let mut buf = command(code);
    push_u64(&mut buf, v);
    buf
}

fn command_handle_cookie(code: CommandCode, handle: i32, cookie: u64) -> Vec<u8> {
    let mut buf = command(code);
    push_u32(&mut buf, handle as u32);
    push_u64(&mut buf, cookie);
    buf
}

fn command_transaction(code: CommandCode, td: &TransactionData) -> Vec<u8> {
    let mut buf = command(code);
    buf.extend_from_slice(td.as_bytes());
    buf
}

fn join(parts: &[Vec<u8>]) -> Vec<u8> {
    parts.iter().flat_map(|p| p.iter().copied()).collect()
}

/// A bare-bones parse of a return stream: just enough of each record to
/// walk past its payload. Good enough for assertions on the sequence of
/// codes and the handful of payload fields these scenarios check.
#[derive(Debug, PartialEq)]
enum R {
    Noop,
    TransactionComplete,
    Transaction { data_size: u64, offsets_size: u64 },
    Reply { data_size: u64 },
    Error(i32),
    FailedReply,
    DeadReply,
    Increfs { ptr: u64, cookie: u64 },
    Acquire { ptr: u64, cookie: u64 },
    Release { ptr: u64, cookie: u64 },
    Decrefs { ptr: u64, cookie: u64 },
    SpawnLooper,
    DeadBinder { cookie: u64 },
    ClearDeathNotificationDone { cookie: u64 },
}

fn parse_returns(bytes: &[u8]) -> Vec<R> {
    let mut pos = 0;
    let mut out = Vec::new();
    let td_size = core::mem::size_of::<TransactionData>();
    while pos < bytes.len() {
        let code = LittleEndian::read_u32(&bytes[pos..pos + 4]);
        pos += 4;
        out.push(match code {
            c if c == ReturnCode::Noop as u32 => R::Noop,
            c if c == ReturnCode::TransactionComplete as u32 => R::TransactionComplete,
            c if c == ReturnCode::Transaction as u32 => {
                let td = TransactionData::read_from_bytes(&bytes[pos..pos + td_size]).unwrap();
                pos += td_size;
                R::Transaction { data_size: td.data_size, offsets_size: td.offsets_size }
            }
            c if c == ReturnCode::Reply as u32 => {
                let td = TransactionData::read_from_bytes(&bytes[pos..pos + td_size]).unwrap();
                pos += td_size;
                R::Reply { data_size: td.data_size }
            }
            c if c == ReturnCode::Error as u32 => {
                let v = LittleEndian::read_u32(&bytes[pos..pos + 4]) as i32;
                pos += 4;
                R::Error(v)
            }
            c if c == ReturnCode::FailedReply as u32 => R::FailedReply,
            c if c == ReturnCode::DeadReply as u32 => R::DeadReply,
            c if c == ReturnCode::Increfs as u32
                || c == ReturnCode::Acquire as u32
                || c == ReturnCode::Release as u32
                || c == ReturnCode::Decrefs as u32 =>
            {
                let ptr = LittleEndian::read_u64(&bytes[pos..pos + 8]);
                let cookie = LittleEndian::read_u64(&bytes[pos + 8..pos + 16]);
                pos += 16;
                if c == ReturnCode::Increfs as u32 {
                    R::Increfs { ptr, cookie }
                } else if c == ReturnCode::Acquire as u32 {
                    R::Acquire { ptr, cookie }
                } else if c == ReturnCode::Release as u32 {
                    R::Release { ptr, cookie }
                } else {
                    R::Decrefs { ptr, cookie }
                }
            }
            c if c == ReturnCode::SpawnLooper as u32 => R::SpawnLooper,
            c if c == ReturnCode::DeadBinder as u32 => {
                let cookie = LittleEndian::read_u64(&bytes[pos..pos + 8]);
                pos += 8;
                R::DeadBinder { cookie }
            }
            c if c == ReturnCode::ClearDeathNotificationDone as u32 => {
                let cookie = LittleEndian::read_u64(&bytes[pos..pos + 8]);
                pos += 8;
                R::ClearDeathNotificationDone { cookie }
            }
            other => panic!("unrecognized return code {other}"),
        });
    }
    out
}

/// Opens a process, maps it, registers one thread, and enters its looper.
fn open_looping_process(kernel: &Kernel<FakeHost>, thread: u64) -> (ProcessId, ThreadId) {
    let p = kernel.open_process();
    kernel.mmap(p, MAPPING_SIZE, 0).unwrap();
    let t = ThreadId(thread);
    kernel.add_thread(p, t).unwrap();
    kernel.write(p, t, &command(CommandCode::EnterLooper)).unwrap();
    (p, t)
}

fn empty_transaction(target: u64, code: u32) -> TransactionData {
    TransactionData {
        target,
        cookie: 0,
        code,
        flags: 0,
        sender_pid: 0,
        sender_uid: 0,
        data_size: 0,
        offsets_size: 0,
        buffer_ptr: 0,
        offsets_ptr: 0,
    }
}

#[test]
fn s1_context_manager_handshake() {
    let kernel = Kernel::new(FakeHost::new());
    let (p0, _t0) = open_looping_process(&kernel, 1);
    kernel.set_context_manager(p0, 0xC077EC7, 0).unwrap();

    let (p1, t1) = open_looping_process(&kernel, 2);
    let td = empty_transaction(abi::CONTEXT_MANAGER_DESCRIPTOR as u64, 1);
    let write = join(&[
        command_i32(CommandCode::Increfs, abi::CONTEXT_MANAGER_DESCRIPTOR),
        command_i32(CommandCode::Acquire, abi::CONTEXT_MANAGER_DESCRIPTOR),
        command_transaction(CommandCode::Transaction, &td),
    ]);
    kernel.write(p1, t1, &write).unwrap();

    let p1_read = parse_returns(&kernel.read(p1, t1, false).unwrap());
    assert_eq!(p1_read, vec![R::Noop, R::TransactionComplete]);

    // Each read() renders exactly one queued item, so the three things
    // waiting for P0 (the incref, the acquire, and the transaction itself)
    // come back one call at a time.
    assert_eq!(
        parse_returns(&kernel.read(p0, _t0, false).unwrap()),
        vec![R::Noop, R::Increfs { ptr: 0xC077EC7, cookie: 0 }]
    );
    assert_eq!(
        parse_returns(&kernel.read(p0, _t0, false).unwrap()),
        vec![R::Noop, R::Acquire { ptr: 0xC077EC7, cookie: 0 }]
    );
    assert_eq!(
        parse_returns(&kernel.read(p0, _t0, false).unwrap()),
        vec![R::Noop, R::Transaction { data_size: 0, offsets_size: 0 }]
    );
}

#[test]
fn s5_death_notification_on_owner_teardown() {
    let kernel = Kernel::new(FakeHost::new());
    let (p0, t0) = open_looping_process(&kernel, 1);
    kernel.set_context_manager(p0, 0x5000, 0).unwrap();

    let (p1, t1) = open_looping_process(&kernel, 2);
    // P1 acquires a strong ref on the context-manager node and registers a
    // death subscription on it, the same node P0 will take down with it.
    kernel
        .write(
            p1,
            t1,
            &join(&[
                command_i32(CommandCode::Increfs, abi::CONTEXT_MANAGER_DESCRIPTOR),
                command_i32(CommandCode::Acquire, abi::CONTEXT_MANAGER_DESCRIPTOR),
                command_handle_cookie(
                    CommandCode::RequestDeathNotification,
                    abi::CONTEXT_MANAGER_DESCRIPTOR,
                    0xC1,
                ),
            ]),
        )
        .unwrap();
    // Drain P0's read (the strong-ref acquire it was told about).
    let _ = kernel.read(p0, t0, false).unwrap();

    kernel.release(p0);

    let p1_read = parse_returns(&kernel.read(p1, t1, false).unwrap());
    assert_eq!(p1_read, vec![R::Noop, R::DeadBinder { cookie: 0xC1 }]);

    kernel.write(p1, t1, &command_u64(CommandCode::DeadBinderDone, 0xC1)).unwrap();
    let after_ack = parse_returns(&kernel.read(p1, t1, false).unwrap());
    assert!(
        after_ack.iter().all(|r| !matches!(r, R::DeadBinder { .. })),
        "no further death notification once acknowledged"
    );
}

#[test]
fn poll_reports_process_wide_work_only_to_an_idle_thread() {
    let kernel = Kernel::new(FakeHost::new());
    let (p0, t0) = open_looping_process(&kernel, 1);
    assert!(!kernel.poll(p0, t0));

    kernel.set_context_manager(p0, 0x9000, 0).unwrap();
    let (p1, t1) = open_looping_process(&kernel, 2);
    let td = empty_transaction(abi::CONTEXT_MANAGER_DESCRIPTOR as u64, 7);
    kernel
        .write(p1, t1, &command_transaction(CommandCode::Transaction, &td))
        .unwrap();

    assert!(kernel.poll(p0, t0));
}

/// Stages a one-object transaction payload in `from`'s simulated user
/// memory and returns the header pointing at it.
fn transaction_data_with_object(
    kernel: &Kernel<FakeHost>,
    from: ProcessId,
    target: u64,
    code: u32,
    obj: FlatObject,
) -> TransactionData {
    let data_addr = 0x1000u64;
    let offsets_addr = 0x2000u64;
    kernel.host().put_user_bytes(from, data_addr, obj.as_bytes());
    let mut off_bytes = [0u8; 8];
    LittleEndian::write_u64(&mut off_bytes, 0);
    kernel.host().put_user_bytes(from, offsets_addr, &off_bytes);
    TransactionData {
        target,
        cookie: 0,
        code,
        flags: 0,
        sender_pid: 0,
        sender_uid: 0,
        data_size: FlatObject::WIRE_SIZE as u64,
        offsets_size: off_bytes.len() as u64,
        buffer_ptr: data_addr,
        offsets_ptr: offsets_addr,
    }
}

/// Pulls `buffer_ptr` out of a raw read of exactly `BR_NOOP BR_TRANSACTION`
/// -- what a single `read()` renders for one queued transaction -- for
/// tests that need the user-space address to hand back via `BC_FREE_BUFFER`.
fn transaction_buffer_ptr(bytes: &[u8]) -> u64 {
    let td_size = core::mem::size_of::<TransactionData>();
    let code = LittleEndian::read_u32(&bytes[4..8]);
    assert_eq!(code, ReturnCode::Transaction as u32, "expected exactly one BR_TRANSACTION");
    let td = TransactionData::read_from_bytes(&bytes[8..8 + td_size]).unwrap();
    td.buffer_ptr
}

/// Reads `(process, thread)` to exhaustion, one work item at a time,
/// collecting every record seen along the way.
fn drain_all(kernel: &Kernel<FakeHost>, process: ProcessId, thread: ThreadId) -> Vec<R> {
    let mut out = Vec::new();
    loop {
        let bytes = kernel.read(process, thread, false).unwrap();
        if bytes.is_empty() {
            break;
        }
        out.extend(parse_returns(&bytes));
    }
    out
}

/// Registers a `BINDER` node for `(from_process, from_thread)` with the
/// context manager and replies empty, leaving both sides idle again.
fn register_binder(
    kernel: &Kernel<FakeHost>,
    p_cm: ProcessId,
    t_cm: ThreadId,
    from_process: ProcessId,
    from_thread: ThreadId,
    node_ptr: u64,
) {
    register_binder_with_flags(kernel, p_cm, t_cm, from_process, from_thread, node_ptr, 0)
}

/// As `register_binder`, but with caller-supplied object flags -- used to
/// stamp a declared `min_priority` (and/or `ACCEPTS_FDS`) onto the node as
/// it is created, per the object-translation rule in §4.4.
fn register_binder_with_flags(
    kernel: &Kernel<FakeHost>,
    p_cm: ProcessId,
    t_cm: ThreadId,
    from_process: ProcessId,
    from_thread: ThreadId,
    node_ptr: u64,
    flags: u32,
) {
    let obj = FlatObject { object_type: ObjectType::BINDER, flags, handle_or_ptr: node_ptr, cookie: node_ptr };
    let td = transaction_data_with_object(kernel, from_process, abi::CONTEXT_MANAGER_DESCRIPTOR as u64, 1, obj);
    kernel.write(from_process, from_thread, &command_transaction(CommandCode::Transaction, &td)).unwrap();

    let cm_read = drain_all(kernel, p_cm, t_cm);
    assert!(cm_read.iter().any(|r| matches!(r, R::Transaction { .. })), "cm should see the registration");
    kernel.write(p_cm, t_cm, &command_transaction(CommandCode::Reply, &empty_transaction(0, 0))).unwrap();

    let reg_read = drain_all(kernel, from_process, from_thread);
    assert!(reg_read.iter().any(|r| matches!(r, R::Reply { .. })));
}

/// Asks the context manager for a handle on whatever node sits at its
/// `cm_descriptor`, leaving `(asker_process, asker_thread)` with its own
/// new handle on that node (its lowest unused descriptor).
fn fetch_handle(
    kernel: &Kernel<FakeHost>,
    p_cm: ProcessId,
    t_cm: ThreadId,
    asker_process: ProcessId,
    asker_thread: ThreadId,
    cm_descriptor: i32,
    code: u32,
) {
    let req = empty_transaction(abi::CONTEXT_MANAGER_DESCRIPTOR as u64, code);
    kernel
        .write(asker_process, asker_thread, &command_transaction(CommandCode::Transaction, &req))
        .unwrap();

    let cm_read = drain_all(kernel, p_cm, t_cm);
    assert!(cm_read.iter().any(|r| matches!(r, R::Transaction { .. })));
    let obj = FlatObject { object_type: ObjectType::HANDLE, flags: 0, handle_or_ptr: cm_descriptor as u64, cookie: 0 };
    let reply_td = transaction_data_with_object(kernel, p_cm, 0, 0, obj);
    kernel.write(p_cm, t_cm, &command_transaction(CommandCode::Reply, &reply_td)).unwrap();

    let asker_read = drain_all(kernel, asker_process, asker_thread);
    assert!(asker_read.iter().any(|r| matches!(r, R::Reply { .. })));
}

/// A two-way call nested inside a call that is itself nested one level
/// deeper should be routed to the specific thread servicing the outer
/// call -- the "dependent thread" optimization -- even though that
/// thread is busy and would otherwise be skipped by the plain idle-looper
/// search. This exercises `find_thread_affinity` walking two hops up
/// `from_parent` and `select_target_thread` accepting a busy match.
#[test]
fn nested_reentrant_call_routes_to_the_busy_dependent_thread() {
    let kernel = Kernel::new(FakeHost::new());

    let (p_cm, t_cm) = open_looping_process(&kernel, 1);
    kernel.set_context_manager(p_cm, 0xC33C, 0).unwrap();

    let (p_svc, t_svc) = open_looping_process(&kernel, 2);
    let (p_client, t_client) = open_looping_process(&kernel, 3);
    // A second, deliberately idle thread in the client process -- the
    // decoy the old idle-only affinity check would have picked instead.
    let t_client2 = ThreadId(4);
    kernel.add_thread(p_client, t_client2).unwrap();
    kernel.write(p_client, t_client2, &command(CommandCode::EnterLooper)).unwrap();

    // The service registers descriptor 1 on the context manager, the
    // client descriptor 2.
    register_binder(&kernel, p_cm, t_cm, p_svc, t_svc, 0xAAAA);
    register_binder(&kernel, p_cm, t_cm, p_client, t_client, 0xBBBB);

    // The client fetches a handle on the service's node: its own first
    // handle, descriptor 1.
    fetch_handle(&kernel, p_cm, t_cm, p_client, t_client, 1, 2);

    // The context manager, acting on its own, calls straight into the
    // client's registered node (its descriptor 2). With two idle threads
    // in `p_client`, the plain fallback picks the lower thread id.
    let root_call = empty_transaction(2, 9);
    kernel.write(p_cm, t_cm, &command_transaction(CommandCode::Transaction, &root_call)).unwrap();
    assert_eq!(
        parse_returns(&kernel.read(p_client, t_client, false).unwrap()),
        vec![R::Noop, R::Transaction { data_size: 0, offsets_size: 0 }]
    );
    // `t_client` is now busy servicing that call, but not replied yet.

    // Still nested in the root call, the client calls the service,
    // handing it a fresh callback object the service will call back
    // through.
    let callback = FlatObject { object_type: ObjectType::BINDER, flags: 0, handle_or_ptr: 0xCA11, cookie: 0xCA11 };
    let call_svc = transaction_data_with_object(&kernel, p_client, 1, 5, callback);
    kernel.write(p_client, t_client, &command_transaction(CommandCode::Transaction, &call_svc)).unwrap();
    assert_eq!(
        parse_returns(&kernel.read(p_client, t_client, false).unwrap()),
        vec![R::Noop, R::TransactionComplete]
    );
    assert_eq!(
        parse_returns(&kernel.read(p_svc, t_svc, false).unwrap()),
        vec![R::Noop, R::Transaction { data_size: FlatObject::WIRE_SIZE as u64, offsets_size: 8 }]
    );
    // `t_svc` is now busy too, nested under that call, and holds a fresh
    // handle (its own descriptor 1) on the callback object -- owned by
    // `p_client`.

    // The service calls back through that handle. Its nesting chain
    // leads straight back to `p_client`, so the dependent-thread search
    // should find `t_client` -- busy, but the right thread -- rather
    // than falling back to the idle `t_client2`.
    let callback_call = empty_transaction(1, 6);
    kernel
        .write(p_svc, t_svc, &command_transaction(CommandCode::Transaction, &callback_call))
        .unwrap();

    assert_eq!(parse_returns(&kernel.read(p_client, t_client2, false).unwrap()), Vec::<R>::new());
    assert_eq!(
        parse_returns(&kernel.read(p_client, t_client, false).unwrap()),
        vec![R::Noop, R::Transaction { data_size: 0, offsets_size: 0 }]
    );
}

/// A thread that dies while servicing a nested call takes down not just
/// its own caller's transaction, but every transaction further up the
/// `from_parent` chain -- each one's own caller was just as doomed, since
/// it will never see a real reply either.
#[test]
fn thread_death_fails_every_transaction_up_the_nesting_chain() {
    let kernel = Kernel::new(FakeHost::new());

    let (p_cm, t_cm) = open_looping_process(&kernel, 1);
    kernel.set_context_manager(p_cm, 0xFEED, 0).unwrap();

    let (p_a, t_a) = open_looping_process(&kernel, 2);
    let (p_b, t_b) = open_looping_process(&kernel, 3);
    let (p_c, t_c) = open_looping_process(&kernel, 4);

    register_binder(&kernel, p_cm, t_cm, p_b, t_b, 0xB0);
    register_binder(&kernel, p_cm, t_cm, p_c, t_c, 0xC0);
    fetch_handle(&kernel, p_cm, t_cm, p_a, t_a, 1, 10);
    fetch_handle(&kernel, p_cm, t_cm, p_b, t_b, 2, 11);

    // a calls b...
    let call1 = empty_transaction(1, 20);
    kernel.write(p_a, t_a, &command_transaction(CommandCode::Transaction, &call1)).unwrap();
    assert_eq!(
        parse_returns(&kernel.read(p_a, t_a, false).unwrap()),
        vec![R::Noop, R::TransactionComplete]
    );
    assert_eq!(
        parse_returns(&kernel.read(p_b, t_b, false).unwrap()),
        vec![R::Noop, R::Transaction { data_size: 0, offsets_size: 0 }]
    );

    // ...and, still servicing that call, b calls c.
    let call2 = empty_transaction(1, 21);
    kernel.write(p_b, t_b, &command_transaction(CommandCode::Transaction, &call2)).unwrap();
    assert_eq!(
        parse_returns(&kernel.read(p_b, t_b, false).unwrap()),
        vec![R::Noop, R::TransactionComplete]
    );
    assert_eq!(
        parse_returns(&kernel.read(p_c, t_c, false).unwrap()),
        vec![R::Noop, R::Transaction { data_size: 0, offsets_size: 0 }]
    );

    // c's thread dies before ever replying to b's call.
    kernel.thread_exit(p_c, t_c).unwrap();

    // Both b's call to c and a's call to b -- one hop further out -- fail.
    assert_eq!(parse_returns(&kernel.read(p_b, t_b, false).unwrap()), vec![R::Noop, R::DeadReply]);
    assert_eq!(parse_returns(&kernel.read(p_a, t_a, false).unwrap()), vec![R::Noop, R::DeadReply]);
}

/// A synchronous call into a node with a declared `min_priority` bumps the
/// callee thread to that floor for the duration of the call, and restores
/// its prior value the moment it replies -- the dependent half of a
/// caller's own priority only ever mattering if it is *less* important
/// than the floor, which a freshly opened thread (nice 0) already is not,
/// so the floor alone drives the bump here.
#[test]
fn s2_synchronous_call_inherits_the_target_nodes_priority_floor() {
    let kernel = Kernel::new(FakeHost::new());
    let (p_cm, t_cm) = open_looping_process(&kernel, 1);
    kernel.set_context_manager(p_cm, 0xC0DE, 0).unwrap();

    let (p_svc, t_svc) = open_looping_process(&kernel, 2);
    let (p_client, t_client) = open_looping_process(&kernel, 3);

    // The service's node declares a floor more important than any thread's
    // freshly opened nice of 0 -- Nice(-5), packed into the low byte of the
    // object's flags per `ObjectFlags::PRIORITY_MASK`.
    let floor = Nice(-5);
    let flags = ObjectFlags::from_bits_truncate((floor.0 as u8) as u32).bits();
    register_binder_with_flags(&kernel, p_cm, t_cm, p_svc, t_svc, 0xF10, flags);
    fetch_handle(&kernel, p_cm, t_cm, p_client, t_client, 1, 2);

    let call = empty_transaction(1, 42);
    kernel.write(p_client, t_client, &command_transaction(CommandCode::Transaction, &call)).unwrap();
    assert_eq!(
        parse_returns(&kernel.read(p_svc, t_svc, false).unwrap()),
        vec![R::Noop, R::Transaction { data_size: 0, offsets_size: 0 }]
    );
    assert_eq!(kernel.host().thread_nice(p_svc, t_svc), Some(floor), "dispatch adopts the node's floor");

    kernel.write(p_svc, t_svc, &command_transaction(CommandCode::Reply, &empty_transaction(0, 0))).unwrap();
    assert_eq!(
        kernel.host().thread_nice(p_svc, t_svc),
        Some(Nice(0)),
        "replying restores the thread's prior nice"
    );
}

/// Three oneway sends to the same node become readable one at a time: the
/// second and third sit in the node's `async_todo` until `FREE_BUFFER` on
/// the prior one's buffer moves the next one over, enforcing at most one
/// concurrent oneway delivery per node.
#[test]
fn s4_oneway_sends_to_the_same_node_serialize_on_buffer_free() {
    let kernel = Kernel::new(FakeHost::new());
    let (p_cm, t_cm) = open_looping_process(&kernel, 1);
    kernel.set_context_manager(p_cm, 0xB00, 0).unwrap();

    let (p_svc, t_svc) = open_looping_process(&kernel, 2);
    let (p_client, t_client) = open_looping_process(&kernel, 3);

    register_binder(&kernel, p_cm, t_cm, p_svc, t_svc, 0xABCD);
    fetch_handle(&kernel, p_cm, t_cm, p_client, t_client, 1, 2);

    let oneway = |code: u32| TransactionData {
        target: 1,
        cookie: 0,
        code,
        flags: abi::TransactionFlags::ONE_WAY.bits(),
        sender_pid: 0,
        sender_uid: 0,
        data_size: 0,
        offsets_size: 0,
        buffer_ptr: 0,
        offsets_ptr: 0,
    };
    for code in [1u32, 2, 3] {
        kernel
            .write(p_client, t_client, &command_transaction(CommandCode::Transaction, &oneway(code)))
            .unwrap();
        assert_eq!(
            parse_returns(&kernel.read(p_client, t_client, false).unwrap()),
            vec![R::Noop, R::TransactionComplete]
        );
    }

    // Only the first is visible yet; the other two are parked on the node.
    let first_bytes = kernel.read(p_svc, t_svc, false).unwrap();
    assert_eq!(
        parse_returns(&first_bytes),
        vec![R::Noop, R::Transaction { data_size: 0, offsets_size: 0 }]
    );
    assert_eq!(parse_returns(&kernel.read(p_svc, t_svc, false).unwrap()), Vec::<R>::new());

    // Freeing the first one's buffer releases the second.
    kernel
        .write(p_svc, t_svc, &command_u64(CommandCode::FreeBuffer, transaction_buffer_ptr(&first_bytes)))
        .unwrap();
    let second_bytes = kernel.read(p_svc, t_svc, false).unwrap();
    assert_eq!(
        parse_returns(&second_bytes),
        vec![R::Noop, R::Transaction { data_size: 0, offsets_size: 0 }]
    );
    assert_eq!(parse_returns(&kernel.read(p_svc, t_svc, false).unwrap()), Vec::<R>::new());

    // And freeing the second's buffer releases the third.
    kernel
        .write(p_svc, t_svc, &command_u64(CommandCode::FreeBuffer, transaction_buffer_ptr(&second_bytes)))
        .unwrap();
    let third = parse_returns(&kernel.read(p_svc, t_svc, false).unwrap());
    assert_eq!(third, vec![R::Noop, R::Transaction { data_size: 0, offsets_size: 0 }]);
}
