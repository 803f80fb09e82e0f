// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The wire codec: turns a process's write-stream bytes into a
//! sequence of [`Command`]s, and turns a sequence of [`Return`]s the core
//! wants to deliver into the bytes a process's read() gets back.
//!
//! `TransactionData` and `FlatObject` are read and written directly as the
//! `zerocopy`-derived wire structs from `abi`; everything else here is
//! small enough to shuttle by hand with `byteorder`, favoring explicit
//! little-endian reads over a derive for a one-off record.

use byteorder::{ByteOrder, LittleEndian};
use zerocopy::{FromBytes, IntoBytes};

use abi::{CommandCode, ReturnCode, TransactionData};

use crate::error::ProtocolError;

#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    Transaction(TransactionData),
    Reply(TransactionData),
    FreeBuffer(u64),
    Increfs(i32),
    Acquire(i32),
    Release(i32),
    Decrefs(i32),
    IncrefsDone { ptr: u64, cookie: u64 },
    AcquireDone { ptr: u64, cookie: u64 },
    RegisterLooper,
    EnterLooper,
    ExitLooper,
    RequestDeathNotification { handle: i32, cookie: u64 },
    ClearDeathNotification { handle: i32, cookie: u64 },
    DeadBinderDone { cookie: u64 },
}

#[derive(Clone, Debug, PartialEq)]
pub enum Return {
    Noop,
    TransactionComplete,
    Transaction(TransactionData),
    Reply(TransactionData),
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

const TRANSACTION_DATA_SIZE: usize = core::mem::size_of::<TransactionData>();

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        let end = self.pos.checked_add(n).ok_or(ProtocolError::Truncated)?;
        let slice = self.buf.get(self.pos..end).ok_or(ProtocolError::Truncated)?;
        self.pos = end;
        Ok(slice)
    }

    fn take_u32(&mut self) -> Result<u32, ProtocolError> {
        Ok(LittleEndian::read_u32(self.take(4)?))
    }

    fn take_u64(&mut self) -> Result<u64, ProtocolError> {
        Ok(LittleEndian::read_u64(self.take(8)?))
    }

    fn take_i32(&mut self) -> Result<i32, ProtocolError> {
        Ok(self.take_u32()? as i32)
    }

    fn take_transaction_data(&mut self) -> Result<TransactionData, ProtocolError> {
        let bytes = self.take(TRANSACTION_DATA_SIZE)?;
        TransactionData::read_from_bytes(bytes).map_err(|_| ProtocolError::Truncated)
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }
}

/// Decodes every command in `buf` in order. An unrecognized code aborts
/// the whole stream, which is why this returns as soon as something's
/// wrong rather than skipping the bad record.
pub fn decode_commands(buf: &[u8]) -> Result<Vec<Command>, ProtocolError> {
    let mut cursor = Cursor::new(buf);
    let mut out = Vec::new();
    while !cursor.is_empty() {
        let raw_code = cursor.take_u32()?;
        let code = CommandCode::try_from(raw_code).map_err(|_| ProtocolError::UnknownCommand(raw_code))?;
        let command = match code {
            CommandCode::Transaction => Command::Transaction(cursor.take_transaction_data()?),
            CommandCode::Reply => Command::Reply(cursor.take_transaction_data()?),
            CommandCode::FreeBuffer => Command::FreeBuffer(cursor.take_u64()?),
            CommandCode::Increfs => Command::Increfs(cursor.take_i32()?),
            CommandCode::Acquire => Command::Acquire(cursor.take_i32()?),
            CommandCode::Release => Command::Release(cursor.take_i32()?),
            CommandCode::Decrefs => Command::Decrefs(cursor.take_i32()?),
            CommandCode::IncrefsDone => {
                let ptr = cursor.take_u64()?;
                let cookie = cursor.take_u64()?;
                Command::IncrefsDone { ptr, cookie }
            }
            CommandCode::AcquireDone => {
                let ptr = cursor.take_u64()?;
                let cookie = cursor.take_u64()?;
                Command::AcquireDone { ptr, cookie }
            }
            CommandCode::RegisterLooper => Command::RegisterLooper,
            CommandCode::EnterLooper => Command::EnterLooper,
            CommandCode::ExitLooper => Command::ExitLooper,
            CommandCode::RequestDeathNotification => {
                let handle = cursor.take_i32()?;
                let cookie = cursor.take_u64()?;
                Command::RequestDeathNotification { handle, cookie }
            }
            CommandCode::ClearDeathNotification => {
                let handle = cursor.take_i32()?;
                let cookie = cursor.take_u64()?;
                Command::ClearDeathNotification { handle, cookie }
            }
            CommandCode::DeadBinderDone => Command::DeadBinderDone {
                cookie: cursor.take_u64()?,
            },
        };
        out.push(command);
    }
    Ok(out)
}

fn push_u32(out: &mut Vec<u8>, v: u32) {
    let mut tmp = [0u8; 4];
    LittleEndian::write_u32(&mut tmp, v);
    out.extend_from_slice(&tmp);
}

fn push_u64(out: &mut Vec<u8>, v: u64) {
    let mut tmp = [0u8; 8];
    LittleEndian::write_u64(&mut tmp, v);
    out.extend_from_slice(&tmp);
}

/// Encodes a single return item onto `out`, in order, exactly as it will
/// appear in the process's read buffer.
pub fn encode_return(out: &mut Vec<u8>, item: &Return) {
    let (code, ()) = match item {
        Return::Noop => (ReturnCode::Noop, ()),
        Return::TransactionComplete => (ReturnCode::TransactionComplete, ()),
        Return::Transaction(_) => (ReturnCode::Transaction, ()),
        Return::Reply(_) => (ReturnCode::Reply, ()),
        Return::Error(_) => (ReturnCode::Error, ()),
        Return::FailedReply => (ReturnCode::FailedReply, ()),
        Return::DeadReply => (ReturnCode::DeadReply, ()),
        Return::Increfs { .. } => (ReturnCode::Increfs, ()),
        Return::Acquire { .. } => (ReturnCode::Acquire, ()),
        Return::Release { .. } => (ReturnCode::Release, ()),
        Return::Decrefs { .. } => (ReturnCode::Decrefs, ()),
        Return::SpawnLooper => (ReturnCode::SpawnLooper, ()),
        Return::DeadBinder { .. } => (ReturnCode::DeadBinder, ()),
        Return::ClearDeathNotificationDone { .. } => (ReturnCode::ClearDeathNotificationDone, ()),
    };
    push_u32(out, code as u32);
    match item {
        Return::Transaction(td) | Return::Reply(td) => out.extend_from_slice(td.as_bytes()),
        Return::Error(errno) => push_u32(out, *errno as u32),
        Return::Increfs { ptr, cookie }
        | Return::Acquire { ptr, cookie }
        | Return::Release { ptr, cookie }
        | Return::Decrefs { ptr, cookie } => {
            push_u64(out, *ptr);
            push_u64(out, *cookie);
        }
        Return::DeadBinder { cookie } | Return::ClearDeathNotificationDone { cookie } => {
            push_u64(out, *cookie);
        }
        Return::Noop
        | Return::TransactionComplete
        | Return::FailedReply
        | Return::DeadReply
        | Return::SpawnLooper => {}
    }
}

pub fn encode_returns(items: &[Return]) -> Vec<u8> {
    let mut out = Vec::new();
    for item in items {
        encode_return(&mut out, item);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_transaction_data() -> TransactionData {
        TransactionData {
            target: 7,
            cookie: 0,
            code: 42,
            flags: 0,
            sender_pid: 1,
            sender_uid: 0,
            data_size: 16,
            offsets_size: 0,
            buffer_ptr: 0x1000,
            offsets_ptr: 0,
        }
    }

    #[test]
    fn round_trips_simple_commands() {
        let mut buf = Vec::new();
        push_u32(&mut buf, CommandCode::Increfs as u32);
        push_u32(&mut buf, 3i32 as u32);
        let commands = decode_commands(&buf).unwrap();
        assert_eq!(commands, vec![Command::Increfs(3)]);
    }

    #[test]
    fn unknown_command_code_aborts_the_stream() {
        let mut buf = Vec::new();
        push_u32(&mut buf, 0xffff_ffff);
        let err = decode_commands(&buf).unwrap_err();
        assert_eq!(err, ProtocolError::UnknownCommand(0xffff_ffff));
    }

    #[test]
    fn truncated_payload_is_reported() {
        let mut buf = Vec::new();
        push_u32(&mut buf, CommandCode::Acquire as u32);
        // Missing the i32 payload entirely.
        let err = decode_commands(&buf).unwrap_err();
        assert_eq!(err, ProtocolError::Truncated);
    }

    #[test]
    fn transaction_return_encodes_embedded_transaction_data() {
        let td = sample_transaction_data();
        let bytes = encode_returns(&[Return::Transaction(td)]);
        assert_eq!(bytes.len(), 4 + TRANSACTION_DATA_SIZE);
        assert_eq!(LittleEndian::read_u32(&bytes[0..4]), ReturnCode::Transaction as u32);
    }
}
