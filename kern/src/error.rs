// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Common error-handling support.
//!
//! This module is designed around the idea that core code spends too much
//! time handling and recording errors, and we ought to be able to separate
//! that concern using `Result`.

use abi::ReturnCode;
use thiserror::Error;

use crate::host::HostError;

/// An error committed by a process while interacting with its endpoint.
///
/// This is the error type for command-stream handlers. A `Recoverable`
/// error is stashed in the offending thread's `return_error` slot and
/// surfaces on its next read; an `Abort` terminates processing of the
/// write stream outright.
#[derive(Clone, Debug, Error)]
pub enum CommandError {
    /// A recoverable condition: deliver `ReturnCode` to the caller on its
    /// next read, but keep the endpoint alive.
    #[error("recoverable: {0:?}")]
    Recoverable(ReturnCode),
    /// The write stream contained a command the core does not understand,
    /// or one whose payload was malformed; this aborts the write stream
    /// with an errno.
    #[error("write stream aborted: {0}")]
    Abort(#[from] ProtocolError),
}

/// A fault that arose while interacting with a process's shared mapping: a
/// malformed offsets array, an out-of-range pointer, or similar. A malformed
/// request has no analogue to a task fault here -- it just fails the
/// transaction with a reported reason.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ProtocolError {
    #[error("command stream ended mid-record")]
    Truncated,
    #[error("unknown command code {0}")]
    UnknownCommand(u32),
    #[error("offsets array is not word-aligned")]
    MisalignedOffsets,
    #[error("offset {0} does not point at a whole flat_object within data_size")]
    OffsetOutOfRange(u64),
    #[error("data_size/offsets_size overflow effective buffer size")]
    SizeOverflow,
}

/// A fault that arose in the interaction between two processes during a
/// transaction (i.e. while translating or copying). Can assign blame to
/// either or both sides; by convention this won't contain both as `None`.
#[derive(Clone, Debug)]
pub struct InteractFault {
    pub src: Option<ProtocolError>,
    pub dst: Option<ProtocolError>,
}

impl InteractFault {
    pub fn in_src(err: ProtocolError) -> Self {
        Self {
            src: Some(err),
            dst: None,
        }
    }

    pub fn in_dst(err: ProtocolError) -> Self {
        Self {
            src: None,
            dst: Some(err),
        }
    }
}

/// Top-level error type for operations invoked through `Host` that can fail
/// for reasons the core does not control (page mapping, fd duplication).
#[derive(Clone, Debug, Error)]
pub enum KernelError {
    #[error("unknown process")]
    UnknownProcess,
    #[error("unknown thread")]
    UnknownThread,
    #[error(transparent)]
    Host(#[from] HostError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}
