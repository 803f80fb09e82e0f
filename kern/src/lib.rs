// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The transaction core: the in-kernel (or kernel-like host) IPC subsystem
//! that brokers synchronous and asynchronous request/reply transactions
//! between processes sharing a host.
//!
//! This code is *intended* to be host-agnostic: nothing here talks to a
//! real character device, a real mmap, or a real scheduler. Those concerns
//! all live behind the [`host::Host`] trait, so the core can be exercised
//! by ordinary unit and property tests against [`host::fake::FakeHost`]
//! rather than a live kernel build.
//!
//! # Design principles
//!
//! 1. One global lock ([`kernel::Kernel`]'s `parking_lot::Mutex`) covering
//!    every object table, buffer pool, and queue --
//!    partitioning further is a possible future optimization, not a
//!    correctness requirement.
//! 2. Every external dependency (paging, fd passing, wakeups, priority
//!    clamping) goes through `Host`, never called directly.
//! 3. A strong preference for plain data plus free functions over deeply
//!    nested object hierarchies -- most of the reference-counting and
//!    transaction logic is exercised directly in its own module's tests
//!    without needing a whole `Kernel` standing up.

pub mod buffer;
pub mod codec;
pub mod contextmgr;
pub mod death;
pub mod error;
pub mod host;
pub mod ids;
pub mod kernel;
pub mod node;
pub mod process;
pub mod refcount;
pub mod reference;
pub mod teardown;
pub mod thread;
pub mod transaction;
pub mod transaction_engine;

pub use abi;
