// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The buffer pool: a best-fit allocator over a single pre-reserved
//! virtual range, backed by lazy page mapping.
//!
//! `BufferPool` itself never talks to `Host` -- it only ever says *which*
//! pages a caller now needs mapped or may now unmap. The caller (`Kernel`)
//! is the one that drops its lock, asks `Host` to do the mapping, and comes
//! back to commit the allocation. This mirrors the two-phase dance the
//! kernel's locking discipline requires -- drop the lock, perform the host
//! page-mapping operation, resume -- without making the allocator itself
//! aware of locking.

use std::collections::BTreeMap;
use std::ops::Range;

use abi::{align_up, DebugId, WORD_SIZE};

use crate::ids::{NodeId, TransactionId};

/// Page size assumed by the pool's lazy-mapping math. Real hosts may differ;
/// this is a policy the `Host` implementation is free to reinterpret (it
/// receives byte ranges, not page indices).
pub const PAGE_SIZE: usize = 4096;

/// Smallest remainder worth splitting off a free buffer into its own entry,
/// on top of one more allocation header. Below this, the whole free buffer
/// is handed to the requester instead of being split.
const MIN_SPLIT_REMAINDER: usize = WORD_SIZE;

/// Bookkeeping kept for a buffer while it is allocated to an in-flight (or
/// not-yet-freed) transaction.
#[derive(Clone, Debug)]
pub struct BufferUse {
    pub transaction: TransactionId,
    /// The node this buffer's transaction was addressed to, or `None` for a
    /// reply buffer (a reply carries no target object, only a sender).
    pub target_node: Option<NodeId>,
}

/// A variable-size region inside a process's shared mapping.
#[derive(Clone, Debug)]
pub struct Buffer {
    pub debug_id: DebugId,
    /// Byte offset of this buffer's data from the start of the mapping.
    pub offset: usize,
    /// Total span this buffer occupies (word-aligned data + offsets).
    pub span: usize,
    pub data_size: usize,
    pub offsets_size: usize,
    pub free: bool,
    pub allow_user_free: bool,
    pub async_transaction: bool,
    pub in_use: Option<BufferUse>,
}

impl Buffer {
    fn end(&self) -> usize {
        self.offset + self.span
    }

    pub fn data_range(&self) -> Range<usize> {
        self.offset..self.offset + self.data_size
    }

    pub fn offsets_range(&self) -> Range<usize> {
        let data_aligned = align_up(self.data_size, WORD_SIZE);
        self.offset + data_aligned..self.offset + data_aligned + self.offsets_size
    }
}

#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum BufferError {
    #[error("data_size/offsets_size overflow usize")]
    Overflow,
    #[error("insufficient free async space")]
    NoAsyncSpace,
    #[error("no free buffer large enough")]
    OutOfMemory,
    #[error("mapping has been torn down")]
    MappingGone,
    #[error("user address does not name a currently allocated buffer")]
    NotAllocated,
}

/// A computed allocation that has not yet been committed to the pool's
/// maps. Produced by `plan_alloc`, consumed by `commit_alloc`. Carries the
/// page ranges the caller must ensure are mapped before committing.
pub struct AllocPlan {
    offset: usize,
    span: usize,
    data_size: usize,
    offsets_size: usize,
    is_async: bool,
    /// Byte ranges, in mapping-relative offsets, that are not yet covered by
    /// any other live allocation and so need a fresh `Host::map_pages` call.
    pub pages_to_map: Vec<Range<usize>>,
}

/// A release plan: page ranges no longer covered by any live allocation,
/// which the caller should pass to `Host::unmap_pages` after `free_commit`
/// has already been applied to the logical pool.
pub struct FreePlan {
    pub pages_to_unmap: Vec<Range<usize>>,
}

pub struct BufferPool {
    mapping_size: usize,
    /// Value added to a kernel-side data offset to get the corresponding
    /// address in a process's user mapping; used only by `lookup`.
    user_buffer_offset: usize,
    /// Address-ordered list of every buffer, free or allocated, keyed by
    /// its starting offset. Always partitions `0..mapping_size` exactly.
    by_offset: BTreeMap<usize, Buffer>,
    /// Free buffers indexed by (span, offset) for best-fit-then-lowest-
    /// address selection.
    free_by_size: BTreeMap<(usize, usize), ()>,
    /// Page indices currently believed mapped, so frees can tell which
    /// pages become uncovered.
    mapped_pages: std::collections::BTreeSet<usize>,
    free_async_space: usize,
    torn_down: bool,
}

impl BufferPool {
    /// Creates a pool spanning exactly `mapping_size` bytes, with a single
    /// free buffer covering the whole region, matching what `mmap` sets up.
    pub fn new(mapping_size: usize, user_buffer_offset: usize, debug_id: DebugId) -> Self {
        let mut by_offset = BTreeMap::new();
        by_offset.insert(
            0,
            Buffer {
                debug_id,
                offset: 0,
                span: mapping_size,
                data_size: 0,
                offsets_size: 0,
                free: true,
                allow_user_free: false,
                async_transaction: false,
                in_use: None,
            },
        );
        let mut free_by_size = BTreeMap::new();
        free_by_size.insert((mapping_size, 0), ());
        Self {
            mapping_size,
            user_buffer_offset,
            by_offset,
            free_by_size,
            mapped_pages: Default::default(),
            free_async_space: mapping_size / 2,
            torn_down: false,
        }
    }

    pub fn free_async_space(&self) -> usize {
        self.free_async_space
    }

    pub fn user_buffer_offset(&self) -> usize {
        self.user_buffer_offset
    }

    pub fn mark_torn_down(&mut self) {
        self.torn_down = true;
    }

    fn page_range(range: Range<usize>) -> Range<usize> {
        if range.start >= range.end {
            return 0..0;
        }
        let first = range.start / PAGE_SIZE;
        let last = (range.end - 1) / PAGE_SIZE;
        first..last + 1
    }

    /// Computes an allocation without committing it.
    pub fn plan_alloc(
        &self,
        data_size: usize,
        offsets_size: usize,
        is_async: bool,
        debug_id: DebugId,
    ) -> Result<(AllocPlan, Buffer), BufferError> {
        if self.torn_down {
            return Err(BufferError::MappingGone);
        }
        let aligned_data = align_up(data_size, WORD_SIZE);
        let aligned_offsets = align_up(offsets_size, WORD_SIZE);
        if aligned_data == usize::MAX || aligned_offsets == usize::MAX {
            return Err(BufferError::Overflow);
        }
        let effective = aligned_data
            .checked_add(aligned_offsets)
            .ok_or(BufferError::Overflow)?;

        if is_async && self.free_async_space < effective {
            return Err(BufferError::NoAsyncSpace);
        }

        // Best-fit: smallest free span >= effective, ties broken by lowest
        // address -- exactly the order `free_by_size` iterates in, since it
        // is keyed `(span, offset)`.
        let chosen = self
            .free_by_size
            .keys()
            .find(|(span, _)| *span >= effective)
            .copied()
            .ok_or(BufferError::OutOfMemory)?;
        let (chosen_span, chosen_offset) = chosen;

        let remainder = chosen_span - effective;
        let split = remainder > MIN_SPLIT_REMAINDER;
        let used_span = if split { effective } else { chosen_span };

        let mapped_end_limit = self
            .by_offset
            .range(chosen_offset + chosen_span..)
            .next()
            .map(|(&next_offset, _)| (next_offset / PAGE_SIZE) * PAGE_SIZE)
            .unwrap_or(self.mapping_size);

        let want_range = chosen_offset..(chosen_offset + used_span).min(mapped_end_limit).max(chosen_offset + used_span);
        let wanted_pages = Self::page_range(chosen_offset..chosen_offset + used_span);
        let mut pages_to_map = Vec::new();
        let mut run_start: Option<usize> = None;
        for page in wanted_pages.clone() {
            let already = self.mapped_pages.contains(&page);
            match (already, run_start) {
                (false, None) => run_start = Some(page),
                (true, Some(s)) => {
                    pages_to_map.push(s * PAGE_SIZE..page * PAGE_SIZE);
                    run_start = None;
                }
                _ => {}
            }
        }
        if let Some(s) = run_start {
            pages_to_map.push(s * PAGE_SIZE..wanted_pages.end * PAGE_SIZE);
        }
        let _ = want_range;

        let buffer = Buffer {
            debug_id,
            offset: chosen_offset,
            span: used_span,
            data_size,
            offsets_size,
            free: false,
            allow_user_free: true,
            async_transaction: is_async,
            in_use: None,
        };

        Ok((
            AllocPlan {
                offset: chosen_offset,
                span: used_span,
                data_size,
                offsets_size,
                is_async,
                pages_to_map,
            },
            buffer,
        ))
    }

    /// Commits a plan produced by `plan_alloc` by the same (unlocked-in-
    /// between) caller. Returns the live `Buffer` on success, or `None` if
    /// the chosen free span is no longer available (another allocation won
    /// the race while the lock was dropped for page mapping) -- the caller
    /// should re-`plan_alloc` and retry.
    pub fn commit_alloc(&mut self, plan: AllocPlan) -> Option<Buffer> {
        let existing = self.by_offset.get(&plan.offset)?;
        if !existing.free || existing.span < plan.span {
            return None;
        }
        let chosen_span = existing.span;
        self.free_by_size.remove(&(chosen_span, plan.offset));

        if chosen_span > plan.span {
            let remainder_offset = plan.offset + plan.span;
            let remainder_span = chosen_span - plan.span;
            self.by_offset.insert(
                remainder_offset,
                Buffer {
                    debug_id: DebugId(0),
                    offset: remainder_offset,
                    span: remainder_span,
                    data_size: 0,
                    offsets_size: 0,
                    free: true,
                    allow_user_free: false,
                    async_transaction: false,
                    in_use: None,
                },
            );
            self.free_by_size.insert((remainder_span, remainder_offset), ());
        }

        for page in Self::page_range(plan.offset..plan.offset + plan.span) {
            self.mapped_pages.insert(page);
        }

        let buffer = Buffer {
            debug_id: DebugId(0),
            offset: plan.offset,
            span: plan.span,
            data_size: plan.data_size,
            offsets_size: plan.offsets_size,
            free: false,
            allow_user_free: true,
            async_transaction: plan.is_async,
            in_use: None,
        };
        self.by_offset.insert(plan.offset, buffer.clone());
        if plan.is_async {
            self.free_async_space -= align_up(plan.data_size, WORD_SIZE) + align_up(plan.offsets_size, WORD_SIZE);
        }
        Some(buffer)
    }

    /// Frees the buffer at `offset`, coalescing with free neighbors and
    /// computing which pages became uncovered.
    pub fn free(&mut self, offset: usize) -> Option<FreePlan> {
        let buffer = self.by_offset.get(&offset)?.clone();
        if buffer.free {
            return None;
        }

        if buffer.async_transaction {
            self.free_async_space +=
                align_up(buffer.data_size, WORD_SIZE) + align_up(buffer.offsets_size, WORD_SIZE);
        }

        let mut span = buffer.span;
        let mut merged_offset = offset;

        // Coalesce with the left neighbor.
        if let Some((&left_offset, left)) = self.by_offset.range(..offset).next_back() {
            if left.free && left.end() == offset {
                self.free_by_size.remove(&(left.span, left_offset));
                self.by_offset.remove(&left_offset);
                span += left.span;
                merged_offset = left_offset;
            }
        }
        // Coalesce with the right neighbor.
        if let Some((&right_offset, right)) = self.by_offset.range(offset + buffer.span..).next() {
            if right.free && right_offset == offset + buffer.span {
                self.free_by_size.remove(&(right.span, right_offset));
                self.by_offset.remove(&right_offset);
                span += right.span;
            }
        }

        self.by_offset.remove(&offset);
        self.by_offset.insert(
            merged_offset,
            Buffer {
                debug_id: buffer.debug_id,
                offset: merged_offset,
                span,
                data_size: 0,
                offsets_size: 0,
                free: true,
                allow_user_free: false,
                async_transaction: false,
                in_use: None,
            },
        );
        self.free_by_size.insert((span, merged_offset), ());

        // Pages covered only by the freed buffer (not by any remaining live
        // allocation) become unmappable. Recompute coverage by scanning
        // live (non-free) buffers that touch the same pages.
        let candidate_pages = Self::page_range(merged_offset..merged_offset + span);
        let mut to_unmap = Vec::new();
        let mut run_start: Option<usize> = None;
        for page in candidate_pages.clone() {
            let still_covered = self.page_covered_by_live_buffer(page);
            match (still_covered, run_start) {
                (false, None) => run_start = Some(page),
                (true, Some(s)) => {
                    to_unmap.push(s * PAGE_SIZE..page * PAGE_SIZE);
                    run_start = None;
                }
                _ => {}
            }
        }
        if let Some(s) = run_start {
            to_unmap.push(s * PAGE_SIZE..candidate_pages.end * PAGE_SIZE);
        }
        for range in &to_unmap {
            for page in Self::page_range(range.clone()) {
                self.mapped_pages.remove(&page);
            }
        }

        Some(FreePlan { pages_to_unmap: to_unmap })
    }

    fn page_covered_by_live_buffer(&self, page: usize) -> bool {
        let page_start = page * PAGE_SIZE;
        let page_end = page_start + PAGE_SIZE;
        self.by_offset
            .values()
            .filter(|b| !b.free)
            .any(|b| b.offset < page_end && b.offset + b.span > page_start)
    }

    /// `BC_FREE_BUFFER`: resolves `user_address` to its backing buffer and
    /// frees it; the caller must have `allow_user_free` set. Returns the
    /// buffer as it stood just before being freed (so the caller can inspect
    /// `in_use`/`async_transaction` for the oneway-serialization follow-up)
    /// together with the unmap plan.
    pub fn free_by_user_address(&mut self, user_address: usize) -> Result<(Buffer, FreePlan), BufferError> {
        let offset = user_address
            .checked_sub(self.user_buffer_offset)
            .ok_or(BufferError::NotAllocated)?;
        let buffer = self.by_offset.get(&offset).cloned().ok_or(BufferError::NotAllocated)?;
        if buffer.free || !buffer.allow_user_free {
            return Err(BufferError::NotAllocated);
        }
        let plan = self.free(offset).ok_or(BufferError::NotAllocated)?;
        Ok((buffer, plan))
    }

    /// Looks up the allocated buffer backing `user_address`.
    pub fn lookup(&self, user_address: usize) -> Option<&Buffer> {
        let offset = user_address.checked_sub(self.user_buffer_offset)?;
        let buffer = self.by_offset.get(&offset)?;
        (!buffer.free).then_some(buffer)
    }

    pub fn lookup_mut(&mut self, user_address: usize) -> Option<&mut Buffer> {
        let offset = user_address.checked_sub(self.user_buffer_offset)?;
        let buffer = self.by_offset.get_mut(&offset)?;
        if buffer.free {
            None
        } else {
            Some(buffer)
        }
    }

    pub fn set_in_use(&mut self, offset: usize, use_: BufferUse) {
        if let Some(b) = self.by_offset.get_mut(&offset) {
            b.in_use = Some(use_);
        }
    }

    pub fn get(&self, offset: usize) -> Option<&Buffer> {
        self.by_offset.get(&offset).filter(|b| !b.free)
    }

    /// Testable property #1: every buffer partitions the mapping
    /// exactly, and no two adjacent buffers are both free.
    #[cfg(test)]
    pub fn check_invariants(&self) {
        let mut expected_next = 0usize;
        let mut prev_free: Option<bool> = None;
        for (&offset, buf) in &self.by_offset {
            assert_eq!(offset, expected_next, "gap or overlap in buffer list");
            assert_eq!(offset, buf.offset);
            expected_next += buf.span;
            if let Some(prev) = prev_free {
                assert!(!(prev && buf.free), "two adjacent free buffers");
            }
            prev_free = Some(buf.free);
            if buf.free {
                assert!(self.free_by_size.contains_key(&(buf.span, buf.offset)));
            }
        }
        assert_eq!(expected_next, self.mapping_size);
    }
}
