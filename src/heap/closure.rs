// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Closure allocation glue: a code pointer paired with an environment
//! pointer, heap-allocated as a two-word cell.

use super::collector::TraceRootsFn;
use super::Heap;
use crate::types::{Addr, WORD_BYTES};
use std::ffi::c_void;

/// A `{ code, data }` pair. `data` is opaque to the heap: it may point at
/// a heap cell or at static storage outside the GC's purview.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Closure {
    pub code: Addr,
    pub data: Addr,
}

const CODE_OFFSET: usize = 0;
const DATA_OFFSET: usize = WORD_BYTES;

impl Heap {
    /// Allocate an uninitialized two-word closure cell.
    pub fn alloc_closure(
        &mut self,
        trace_thread_roots: Option<TraceRootsFn>,
        trace_data: *mut c_void,
    ) -> Addr {
        self.alloc(2, trace_thread_roots, trace_data)
    }

    /// Write `code` and `data` into a closure cell obtained from
    /// [`Heap::alloc_closure`].
    pub fn init_closure(&self, cell: Addr, code: Addr, data: Addr) {
        // SAFETY: `cell` was returned by `alloc_closure`, so both word
        // offsets lie within its two-word payload.
        unsafe {
            self.write_word(cell.add(CODE_OFFSET), code.as_usize());
            self.write_word(cell.add(DATA_OFFSET), data.as_usize());
        }
    }

    /// Read a closure back out of a cell previously written by
    /// [`Heap::init_closure`].
    #[must_use]
    pub fn read_closure(&self, cell: Addr) -> Closure {
        // SAFETY: see `init_closure`.
        unsafe {
            Closure {
                code: Addr::new(self.read_word(cell.add(CODE_OFFSET))),
                data: Addr::new(self.read_word(cell.add(DATA_OFFSET))),
            }
        }
    }
}
