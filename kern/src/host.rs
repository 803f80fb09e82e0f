// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The boundary between the core and everything treated as an external
//! collaborator: mapping pages of a process's shared region, waking a
//! blocked reader, duplicating a file descriptor across processes, and
//! clamping a requested nice value against the host's rlimit.
//!
//! Isolating these behind a trait lets the bulk of the core run and be
//! tested without a real character device, mmap, or process table
//! underneath it.

use std::ops::Range;

use abi::{Nice, ProcessId, ThreadId};
use thiserror::Error;

/// A raw OS file descriptor, opaque to the core. It's only ever produced by
/// and handed back to `Host`.
pub type RawFd = i32;

#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum HostError {
    #[error("failed to map pages into process/kernel address space")]
    MapFailed,
    #[error("failed to duplicate file descriptor into target process")]
    FdDuplicationFailed,
    #[error("mapping has already been torn down")]
    MappingGone,
    #[error("caller-supplied user pointer is not valid/readable")]
    BadUserPointer,
}

/// Host-provided operations the core invokes but does not implement.
///
/// Every method here corresponds to something deliberately kept out of the
/// core: `map_pages`/`unmap_pages` stand in for the mmap plumbing, `duplicate_fd`/
/// `close_fd` stand in for file-descriptor-table manipulation, and
/// `wake_process`/`wake_thread`/`clamp_nice`/`set_thread_nice` stand in for
/// the scheduler hooks a real host provides.
pub trait Host: Send + Sync {
    /// Reads `len` bytes out of `process`'s address space at `addr`,
    /// wherever the caller claims its transaction payload and offsets array
    /// live.
    /// This is distinct from the shared mapping the buffer pool manages --
    /// a transaction's source data can be anywhere in the sender's memory.
    fn read_user_bytes(&self, process: ProcessId, addr: u64, len: usize) -> Result<Vec<u8>, HostError>;

    /// Ensures the given byte range of `process`'s shared mapping is backed
    /// by physical pages, mapped both for kernel write and process-side
    /// read. Called with the core's lock dropped.
    fn map_pages(&self, process: ProcessId, byte_range: Range<usize>) -> Result<(), HostError>;

    /// Inverse of `map_pages`: may be called with pages that are already
    /// unmapped, which is a no-op.
    fn unmap_pages(&self, process: ProcessId, byte_range: Range<usize>) -> Result<(), HostError>;

    /// Wakes any thread of `process` blocked reading on the process queue.
    fn wake_process(&self, process: ProcessId);

    /// Wakes `thread` if it is blocked reading on its own queue.
    fn wake_thread(&self, process: ProcessId, thread: ThreadId);

    /// Duplicates `fd`, owned by `from`, into `to`'s file descriptor table,
    /// marked close-on-exec. Returns the new descriptor as it appears in
    /// `to`.
    fn duplicate_fd(&self, from: ProcessId, fd: RawFd, to: ProcessId) -> Result<RawFd, HostError>;

    /// Closes `fd` in `process`'s file descriptor table. Used to unwind a
    /// partially-translated transaction.
    fn close_fd(&self, process: ProcessId, fd: RawFd);

    /// Clamps `requested` against `process`'s nice rlimit, returning the
    /// value the host will actually honor.
    fn clamp_nice(&self, process: ProcessId, requested: Nice) -> Nice;

    /// Applies a nice value to a specific thread. Failure to reach the
    /// target is a diagnostic, not a transaction failure -- this
    /// method has no `Result` for that reason; implementations log their
    /// own failures.
    fn set_thread_nice(&self, process: ProcessId, thread: ThreadId, nice: Nice);
}

#[cfg(any(test, feature = "test-util"))]
pub mod fake {
    //! An in-memory `Host` used by unit and property tests. Pages are
    //! tracked only as "mapped or not" (no actual memory is reserved); fd
    //! duplication mints new descriptors from a counter; nice values are
    //! clamped to `[Nice::MIN, Nice::MAX]` and recorded per thread so tests
    //! can assert on them.
    use super::*;
    use parking_lot::Mutex;
    use std::collections::{HashMap, HashSet};

    #[derive(Default)]
    struct Inner {
        mapped_ranges: HashMap<ProcessId, HashSet<usize>>, // page indices
        next_fd: RawFd,
        thread_nice: HashMap<(ProcessId, ThreadId), Nice>,
        woken_threads: Vec<(ProcessId, ThreadId)>,
        woken_processes: Vec<ProcessId>,
        /// A flat, per-process byte space a test can write into with
        /// `put_user_bytes` to stand in for "wherever in the sender's
        /// memory the transaction payload happened to live".
        user_memory: HashMap<ProcessId, HashMap<u64, u8>>,
    }

    pub const PAGE_SIZE: usize = 4096;

    pub struct FakeHost {
        inner: Mutex<Inner>,
    }

    impl Default for FakeHost {
        fn default() -> Self {
            Self {
                inner: Mutex::new(Inner {
                    next_fd: 100,
                    ..Default::default()
                }),
            }
        }
    }

    impl FakeHost {
        pub fn new() -> Self {
            Self::default()
        }

        /// Stages bytes at `addr` in `process`'s simulated user memory, so a
        /// later `write()` whose `transaction_data.buffer_ptr`/`offsets_ptr`
        /// points there can be read back by `read_user_bytes`. Stands in for
        /// whatever real user memory a live character-device shim would read
        /// with `copy_from_user`.
        pub fn put_user_bytes(&self, process: ProcessId, addr: u64, bytes: &[u8]) {
            let mut inner = self.inner.lock();
            let space = inner.user_memory.entry(process).or_default();
            for (i, &b) in bytes.iter().enumerate() {
                space.insert(addr + i as u64, b);
            }
        }

        pub fn thread_nice(&self, process: ProcessId, thread: ThreadId) -> Option<Nice> {
            self.inner.lock().thread_nice.get(&(process, thread)).copied()
        }

        pub fn was_thread_woken(&self, process: ProcessId, thread: ThreadId) -> bool {
            self.inner
                .lock()
                .woken_threads
                .iter()
                .any(|(p, t)| *p == process && *t == thread)
        }

        pub fn was_process_woken(&self, process: ProcessId) -> bool {
            self.inner.lock().woken_processes.contains(&process)
        }
    }

    impl Host for FakeHost {
        fn read_user_bytes(&self, process: ProcessId, addr: u64, len: usize) -> Result<Vec<u8>, HostError> {
            if len == 0 {
                return Ok(Vec::new());
            }
            let inner = self.inner.lock();
            let space = inner.user_memory.get(&process).ok_or(HostError::BadUserPointer)?;
            (0..len as u64)
                .map(|i| space.get(&(addr + i)).copied().ok_or(HostError::BadUserPointer))
                .collect()
        }

        fn map_pages(&self, process: ProcessId, byte_range: Range<usize>) -> Result<(), HostError> {
            let mut inner = self.inner.lock();
            let pages = inner.mapped_ranges.entry(process).or_default();
            let first = byte_range.start / PAGE_SIZE;
            let last = byte_range.end.saturating_sub(1) / PAGE_SIZE;
            for page in first..=last {
                pages.insert(page);
            }
            Ok(())
        }

        fn unmap_pages(&self, process: ProcessId, byte_range: Range<usize>) -> Result<(), HostError> {
            let mut inner = self.inner.lock();
            if let Some(pages) = inner.mapped_ranges.get_mut(&process) {
                let first = byte_range.start / PAGE_SIZE;
                let last = byte_range.end.saturating_sub(1) / PAGE_SIZE;
                for page in first..=last {
                    pages.remove(&page);
                }
            }
            Ok(())
        }

        fn wake_process(&self, process: ProcessId) {
            self.inner.lock().woken_processes.push(process);
        }

        fn wake_thread(&self, process: ProcessId, thread: ThreadId) {
            self.inner.lock().woken_threads.push((process, thread));
        }

        fn duplicate_fd(&self, _from: ProcessId, _fd: RawFd, _to: ProcessId) -> Result<RawFd, HostError> {
            let mut inner = self.inner.lock();
            let fd = inner.next_fd;
            inner.next_fd += 1;
            Ok(fd)
        }

        fn close_fd(&self, _process: ProcessId, _fd: RawFd) {}

        fn clamp_nice(&self, _process: ProcessId, requested: Nice) -> Nice {
            requested.clamp_range(Nice::MIN, Nice::MAX)
        }

        fn set_thread_nice(&self, process: ProcessId, thread: ThreadId, nice: Nice) {
            self.inner.lock().thread_nice.insert((process, thread), nice);
        }
    }
}
