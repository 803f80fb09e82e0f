// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Wire ABI shared between the transaction core and the processes that talk
//! to it through an endpoint.
//!
//! Everything in this crate describes bytes that cross the process/core
//! boundary: command and return discriminants, the `transaction_data` and
//! `flat_object` records, and the small integer types (`ProcessId`,
//! `ThreadId`, `Descriptor`, ...) that appear inside them. None of it knows
//! how those bytes get from user memory into the core -- that's `kern`'s
//! job.

use serde::{Deserialize, Serialize};
use zerocopy::{Immutable, IntoBytes, FromBytes, KnownLayout, Unaligned};

/// Current protocol version, returned by the `VERSION` ioctl.
pub const PROTOCOL_VERSION: u32 = 7;

/// Descriptor reserved for the context manager.
pub const CONTEXT_MANAGER_DESCRIPTOR: i32 = 0;

/// Word size used for all alignment computations in the buffer pool and the
/// offsets array.
pub const WORD_SIZE: usize = core::mem::size_of::<usize>();

/// Rounds `value` up to the next multiple of `align`, which must be a power
/// of two. Saturates instead of overflowing, since every caller treats
/// overflow as an allocation failure.
pub const fn align_up(value: usize, align: usize) -> usize {
    let mask = align - 1;
    match value.checked_add(mask) {
        Some(sum) => sum & !mask,
        None => usize::MAX,
    }
}

/// Identifies a process's endpoint. Stable for the lifetime of the open
/// file description; never reused while any reference to it survives.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize,
)]
pub struct ProcessId(pub u64);

/// Identifies one worker thread of a process, by host thread id.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize,
)]
pub struct ThreadId(pub u64);

/// A small integer naming a `Reference` within its owning process.
/// `CONTEXT_MANAGER_DESCRIPTOR` (0) always refers to the context manager.
pub type Descriptor = i32;

/// Monotonically increasing debug identity minted for nodes, references,
/// buffers and transactions. Never reused. Exists purely for diagnostics and
/// tests -- nothing in the core keys a lookup by `DebugId`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[repr(transparent)]
pub struct DebugId(pub u64);

/// Nice value used for priority inheritance. Numerically lower is
/// more important, matching the host scheduler's convention. Deliberately
/// omits `PartialOrd`/`Ord` so that callers can't confuse "greater" with
/// "more important".
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromBytes, IntoBytes, Unaligned, Immutable, KnownLayout, Default)]
#[repr(transparent)]
pub struct Nice(pub i8);

impl Nice {
    pub const MIN: Nice = Nice(-20);
    pub const MAX: Nice = Nice(19);

    /// `true` if `self` is strictly more important (numerically smaller)
    /// than `other`.
    pub fn is_more_important_than(self, other: Nice) -> bool {
        self.0 < other.0
    }

    pub fn clamp_range(self, lo: Nice, hi: Nice) -> Nice {
        Nice(self.0.clamp(lo.0, hi.0))
    }
}

/// Command codes consumed from the write stream.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum CommandCode {
    Transaction = 1,
    Reply = 2,
    FreeBuffer = 3,
    Increfs = 4,
    Acquire = 5,
    Release = 6,
    Decrefs = 7,
    IncrefsDone = 8,
    AcquireDone = 9,
    RegisterLooper = 10,
    EnterLooper = 11,
    ExitLooper = 12,
    RequestDeathNotification = 13,
    ClearDeathNotification = 14,
    DeadBinderDone = 15,
}

impl TryFrom<u32> for CommandCode {
    type Error = ();

    fn try_from(v: u32) -> Result<Self, ()> {
        use CommandCode::*;
        Ok(match v {
            1 => Transaction,
            2 => Reply,
            3 => FreeBuffer,
            4 => Increfs,
            5 => Acquire,
            6 => Release,
            7 => Decrefs,
            8 => IncrefsDone,
            9 => AcquireDone,
            10 => RegisterLooper,
            11 => EnterLooper,
            12 => ExitLooper,
            13 => RequestDeathNotification,
            14 => ClearDeathNotification,
            15 => DeadBinderDone,
            _ => return Err(()),
        })
    }
}

/// Return codes produced into the read stream.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum ReturnCode {
    Noop = 0,
    TransactionComplete = 1,
    Transaction = 2,
    Reply = 3,
    Error = 4,
    FailedReply = 5,
    DeadReply = 6,
    Increfs = 7,
    Acquire = 8,
    Release = 9,
    Decrefs = 10,
    SpawnLooper = 11,
    DeadBinder = 12,
    ClearDeathNotificationDone = 13,
}

/// Flags attached to a `transaction_data` record.
bitflags::bitflags! {
    #[derive(Copy, Clone, Debug, Eq, PartialEq, FromBytes, IntoBytes, Unaligned, Immutable, KnownLayout, Default)]
    #[repr(transparent)]
    pub struct TransactionFlags: u32 {
        const ONE_WAY     = 0x01;
        const ROOT_OBJECT = 0x04;
        const STATUS_CODE = 0x08;
        const ACCEPT_FDS  = 0x10;
    }
}

/// Flags attached to a `flat_object` record. The low byte carries a
/// priority (see `ObjectFlags::priority`); `ACCEPTS_FDS` is a single bit
/// above it.
bitflags::bitflags! {
    #[derive(Copy, Clone, Debug, Eq, PartialEq, FromBytes, IntoBytes, Unaligned, Immutable, KnownLayout, Default)]
    #[repr(transparent)]
    pub struct ObjectFlags: u32 {
        const PRIORITY_MASK = 0xff;
        const ACCEPTS_FDS   = 0x100;
    }
}

impl ObjectFlags {
    pub fn priority(self) -> Nice {
        Nice((self.bits() & Self::PRIORITY_MASK.bits()) as i8)
    }
}

/// Type tag of an inline object inside a transaction's offsets array.
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromBytes, IntoBytes, Unaligned, Immutable, KnownLayout)]
#[repr(transparent)]
pub struct ObjectType(pub u32);

impl ObjectType {
    pub const BINDER: Self = Self(1);
    pub const WEAK_BINDER: Self = Self(2);
    pub const HANDLE: Self = Self(3);
    pub const WEAK_HANDLE: Self = Self(4);
    pub const FD: Self = Self(5);
}

/// On-the-wire transaction header. This is reinterpreted directly from
/// caller-supplied bytes -- see `kern::codec`.
#[derive(Copy, Clone, Debug, FromBytes, IntoBytes, Unaligned, Immutable, KnownLayout)]
#[repr(C)]
pub struct TransactionData {
    /// Target: a `Descriptor` when sending (interpreted as `i32`), or an
    /// opaque owner pointer when replying/delivering (interpreted as `u64`).
    /// `kern::codec` picks the right interpretation based on direction.
    pub target: u64,
    pub cookie: u64,
    pub code: u32,
    pub flags: u32,
    pub sender_pid: u64,
    pub sender_uid: u32,
    pub data_size: u64,
    pub offsets_size: u64,
    pub buffer_ptr: u64,
    pub offsets_ptr: u64,
}

/// On-the-wire inline object record.
#[derive(Copy, Clone, Debug, FromBytes, IntoBytes, Unaligned, Immutable, KnownLayout)]
#[repr(C)]
pub struct FlatObject {
    pub object_type: ObjectType,
    pub flags: u32,
    /// Interpreted as a `binder_ptr` (`BINDER`/`WEAK_BINDER`), a `Descriptor`
    /// (`HANDLE`/`WEAK_HANDLE`), or a raw fd (`FD`), depending on
    /// `object_type`.
    pub handle_or_ptr: u64,
    pub cookie: u64,
}

impl FlatObject {
    pub const WIRE_SIZE: usize = core::mem::size_of::<Self>();
}
