// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Mark-sweep collection and the root-tracing API callers hook into.

use super::bitmap::{ALLOCATED, MARKED, VALID};
use super::{Heap, POISON_BYTE};
use crate::types::{Addr, WORD_BYTES};
use std::ffi::c_void;

/// A caller-supplied tracer: given a mark state and its opaque user data,
/// call any combination of `mark_root*` on its own storage.
pub type TraceRootsFn = fn(&mut MarkState<'_>, *mut c_void);

/// Opaque (to tracers) state threaded through one collection's mark phase.
pub struct MarkState<'h> {
    heap: &'h mut Heap,
    num_marked: usize,
    num_roots_marked: usize,
}

impl<'h> MarkState<'h> {
    pub(super) fn new(heap: &'h mut Heap) -> Self {
        Self {
            heap,
            num_marked: 0,
            num_roots_marked: 0,
        }
    }

    #[must_use]
    pub const fn num_marked(&self) -> usize {
        self.num_marked
    }

    #[must_use]
    pub const fn num_roots_marked(&self) -> usize {
        self.num_roots_marked
    }

    /// Exact root: `candidate` is already known to be a pointer (or not a
    /// pointer at all, e.g. `Addr::null()`); only tag bits are masked off.
    pub fn mark_root(&mut self, candidate: Addr) {
        let p = candidate.untagged();
        if self.heap.is_valid_object(p) && !self.is_marked(p) {
            self.mark(p);
            self.num_roots_marked += 1;
        }
    }

    /// Conservative range: every word in `[base, base+len)` is treated as a
    /// possible exact pointer (no interior-pointer search).
    pub fn mark_root_conservative(&mut self, base: Addr, len_bytes: usize) {
        let mut cursor = base;
        let end = base.add(len_bytes);
        while cursor < end {
            // SAFETY: cursor walks a caller-supplied (base, len) byte range
            // that the caller guarantees is readable and word-aligned.
            let raw = unsafe { self.heap.read_word(cursor) };
            let candidate = Addr::new(raw).untagged();
            if self.heap.is_valid_object(candidate) {
                self.mark(candidate);
                self.num_roots_marked += 1;
            }
            cursor = cursor.add(WORD_BYTES);
        }
    }

    /// Conservative range with interior-pointer discovery: a word that
    /// lands inside a live cell's payload (not at its start) is walked
    /// backward to find the cell's start.
    ///
    /// The walk is capped at the heap's current word count, so a value
    /// that merely looks heap-addressed but matches no cell start is
    /// rejected instead of under-running the mapped region.
    pub fn mark_root_conservative_interior(&mut self, base: Addr, len_bytes: usize) {
        let mut cursor = base;
        let end = base.add(len_bytes);
        while cursor < end {
            // SAFETY: see `mark_root_conservative`.
            let raw = unsafe { self.heap.read_word(cursor) };
            let candidate = Addr::new(raw).untagged();
            if self.heap.is_heap_address(candidate) {
                if let Some(cell_start) = self.heap.find_cell_start(candidate) {
                    if self.heap.is_valid_object(cell_start) && !self.is_marked(cell_start) {
                        self.mark(cell_start);
                        self.num_roots_marked += 1;
                    }
                }
            }
            cursor = cursor.add(WORD_BYTES);
        }
    }

    fn is_marked(&self, p: Addr) -> bool {
        self.heap.bitmap.has(self.heap.word_index(p), MARKED)
    }

    /// Mark `root` and everything it transitively references. Uses an
    /// explicit work list rather than native recursion, so a long
    /// reference chain cannot blow the interpreter's own call stack.
    fn mark(&mut self, root: Addr) {
        let mut work = vec![root];
        while let Some(p) = work.pop() {
            let idx = self.heap.word_index(p);
            if self.heap.bitmap.has(idx, MARKED) {
                continue;
            }
            self.heap.bitmap.or(idx, MARKED);
            self.num_marked += 1;

            let size = self.heap.size_word(p);
            for i in 0..size {
                // SAFETY: i ranges over this cell's own payload words, which
                // are part of the mapped region by construction.
                let raw = unsafe { self.heap.read_word(p.add(i * WORD_BYTES)) };
                let candidate = Addr::new(raw).untagged();
                if self.heap.is_valid_object(candidate) && !self.is_marked(candidate) {
                    work.push(candidate);
                }
            }
        }
    }
}

impl Heap {
    /// Run one collection: trace roots, then sweep.
    pub fn collect(&mut self, trace_thread_roots: Option<TraceRootsFn>, trace_data: *mut c_void) {
        if self.options.gc_slow_asserts {
            debug_assert!(self.check_heap(), "heap inconsistent before collect");
        }

        let global_tracer = self.trace_global_roots;
        let global_data = self.trace_global_roots_data;
        let (num_marked, num_roots_marked) = {
            let mut state = MarkState::new(self);
            global_tracer(&mut state, global_data);
            if let Some(thread_tracer) = trace_thread_roots {
                thread_tracer(&mut state, trace_data);
            }
            (state.num_marked, state.num_roots_marked)
        };

        self.sweep();

        if self.options.gc_trace {
            #[cfg(feature = "trace")]
            tracing::debug!(num_marked, num_roots_marked, wilderness = %self.wilderness, "collect");
        }
        #[cfg(not(feature = "trace"))]
        let _ = (num_marked, num_roots_marked);

        if self.options.gc_slow_asserts {
            debug_assert!(self.check_heap(), "heap inconsistent after collect");
        }
    }

    /// Bounded backward search for the start of the cell containing `addr`.
    fn find_cell_start(&self, addr: Addr) -> Option<Addr> {
        let max_words = self.heap_size() / WORD_BYTES;
        let mut cursor = addr;
        for _ in 0..=max_words {
            if self.bitmap.has(self.word_index(cursor), VALID) {
                return Some(cursor);
            }
            if cursor <= self.base.add(WORD_BYTES) {
                return None;
            }
            cursor = cursor.sub(WORD_BYTES);
        }
        None
    }

    fn sweep(&mut self) {
        self.free_list = Addr::null();
        let mut cursor = self.base.add(WORD_BYTES);
        let mut run_head: Option<Addr> = None;

        while cursor < self.wilderness {
            let idx = self.word_index(cursor);
            let old_size = self.size_word(cursor);
            let bits = self.bitmap.get(idx);
            debug_assert!(bits & VALID != 0, "sweep walked onto a non-cell word");

            if bits & MARKED == 0 {
                if run_head.is_some() {
                    if self.options.gc_poison {
                        // SAFETY: the size word belongs to this cell, which
                        // lies within the mapped region.
                        unsafe {
                            self.region()
                                .poison(cursor.sub(WORD_BYTES), WORD_BYTES, POISON_BYTE);
                        }
                    }
                    self.bitmap.clear(idx);
                } else {
                    if self.options.gc_poison {
                        // SAFETY: the payload belongs to this cell.
                        unsafe {
                            self.region().poison(cursor, old_size * WORD_BYTES, POISON_BYTE);
                        }
                    }
                    self.bitmap.and_not(idx, ALLOCATED);
                    self.link_free_cell(cursor);
                    run_head = Some(cursor);
                }
            } else {
                debug_assert!(bits & ALLOCATED != 0, "marked cell was not allocated");
                self.bitmap.and_not(idx, MARKED);
                if let Some(head) = run_head.take() {
                    let new_size = cursor.sub(WORD_BYTES).diff(head) / WORD_BYTES;
                    self.write_size_word(head, new_size);
                }
            }

            cursor = cursor.add((old_size + 1) * WORD_BYTES);
        }

        if let Some(head) = run_head {
            let new_size = self.wilderness.diff(head) / WORD_BYTES;
            self.write_size_word(head, new_size);
        }
    }
}
