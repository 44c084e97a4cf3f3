// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Free-list best-fit allocation with bump-pointer fallback.

use super::bitmap::{ALLOCATED, VALID};
use super::collector::TraceRootsFn;
use super::Heap;
use crate::types::{Addr, WORD_BYTES};
use std::ffi::c_void;

impl Heap {
    /// Allocate `size_in_words` words, collecting once if necessary.
    ///
    /// On persistent failure this prints a diagnostic and aborts the
    /// process rather than returning.
    pub fn alloc(
        &mut self,
        size_in_words: usize,
        trace_thread_roots: Option<TraceRootsFn>,
        trace_data: *mut c_void,
    ) -> Addr {
        let zealous_skip = self.options.gc_zealous && self.wilderness > self.base;
        if !zealous_skip {
            if let Some(p) = self.try_allocate(size_in_words) {
                return p;
            }
        }

        self.collect(trace_thread_roots, trace_data);

        if let Some(p) = self.try_allocate(size_in_words) {
            return p;
        }

        let bytes = size_in_words * WORD_BYTES;
        if self.options.gc_trace || self.options.gc_trace2 {
            #[cfg(feature = "trace")]
            tracing::error!(bytes, "out of memory");
        }
        eprintln!("Out of memory, tried to allocate {bytes} bytes.");
        std::process::abort();
    }

    /// Round `n` bytes up to a whole number of words and delegate to `alloc`.
    pub fn alloc_bytes(
        &mut self,
        n_bytes: usize,
        trace_thread_roots: Option<TraceRootsFn>,
        trace_data: *mut c_void,
    ) -> Addr {
        let words = n_bytes.div_ceil(WORD_BYTES);
        self.alloc(words, trace_thread_roots, trace_data)
    }

    /// Best-fit over the free list, falling back to bump allocation.
    /// Never triggers collection; `None` tells the caller to do that.
    fn try_allocate(&mut self, n: usize) -> Option<Addr> {
        if let Some(p) = self.try_allocate_from_free_list(n) {
            return Some(p);
        }
        self.try_allocate_from_wilderness(n)
    }

    fn try_allocate_from_free_list(&mut self, n: usize) -> Option<Addr> {
        let mut prev: Option<Addr> = None;
        let mut cur = self.free_list;
        let mut best: Option<(Addr, Option<Addr>, usize)> = None; // (cell, prev, size)

        while !cur.is_null() {
            let size = self.size_word(cur);
            // SAFETY: free cells thread their next pointer through the
            // first payload word.
            let next = Addr::new(unsafe { self.read_word(cur) });
            if size >= n && best.is_none_or(|(_, _, best_size)| size < best_size) {
                best = Some((cur, prev, size));
            }
            prev = Some(cur);
            cur = next;
        }

        let (cell, cell_prev, old_size) = best?;
        let cell_next = Addr::new(unsafe { self.read_word(cell) });
        self.unlink_free_cell(cell_prev, cell_next);

        let idx = self.word_index(cell);
        self.bitmap.or(idx, ALLOCATED);

        if old_size >= n + 2 {
            self.write_size_word(cell, n);
            let remainder = cell.add((n + 1) * WORD_BYTES);
            let remainder_size = old_size - (n + 1);
            self.write_size_word(remainder, remainder_size);
            let remainder_idx = self.word_index(remainder);
            self.bitmap.set(remainder_idx, VALID);
            self.link_free_cell(remainder);
        }

        if self.options.gc_trace2 {
            #[cfg(feature = "trace")]
            tracing::trace!(cell = %cell, n, "alloc: free list");
        }

        Some(cell)
    }

    fn try_allocate_from_wilderness(&mut self, n: usize) -> Option<Addr> {
        let size_word_addr = self.wilderness;
        let payload = size_word_addr.add(WORD_BYTES);
        let new_wilderness = payload.add(n * WORD_BYTES);
        if new_wilderness.diff(self.base) > self.heap_size {
            return None;
        }

        self.wilderness = new_wilderness;
        self.write_size_word(payload, n);
        let idx = self.word_index(payload);
        self.bitmap.set(idx, VALID | ALLOCATED);

        if self.options.gc_trace2 {
            #[cfg(feature = "trace")]
            tracing::trace!(cell = %payload, n, "alloc: bump");
        }

        Some(payload)
    }

    fn unlink_free_cell(&mut self, prev: Option<Addr>, next: Addr) {
        match prev {
            Some(p) => unsafe { self.write_word(p, next.as_usize()) },
            None => self.free_list = next,
        }
    }

    pub(super) fn link_free_cell(&mut self, cell: Addr) {
        unsafe { self.write_word(cell, self.free_list.as_usize()) };
        self.free_list = cell;
    }
}
