// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! A conservative, non-moving mark-sweep heap.
//!
//! ```text
//!  base                         wilderness                 base+max_heap_size
//!   |                                |                              |
//!   v                                v                              v
//!   [size|payload][size|payload]...  [ ..... unused ..... ]
//!   \___________ allocated or free cells __________/
//! ```
//!
//! Cells are never moved or compacted. Free cells are threaded onto a
//! singly linked `free_list` through their first payload word; everything
//! above `wilderness` is untouched memory that bump allocation grows into.
//! See [`bitmap`] for the per-word metadata that tracks cell boundaries and
//! liveness, and [`collector`] for the mark/sweep algorithm that reclaims
//! dead cells.

mod allocator;
mod bitmap;
mod closure;
mod collector;
mod region;

#[cfg(test)]
mod heap_proptest;
#[cfg(test)]
mod heap_test;

pub use closure::Closure;
pub use collector::{MarkState, TraceRootsFn};

use crate::types::{Addr, WORD_BYTES};
use bitmap::{Bitmap, ALLOCATED, VALID};
use region::Region;
use std::ffi::c_void;

/// One OS page; `set_heap_size` refuses to shrink below this.
fn page_size() -> usize {
    // SAFETY: sysconf with _SC_PAGESIZE never fails on a POSIX system.
    let n = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    usize::try_from(n).unwrap_or(4096)
}

/// Default logical allocation cap: 8 KiB, growable via [`Heap::set_heap_size`].
pub const DEFAULT_HEAP_SIZE: usize = 4096 * 2;
/// Default and minimum hard ceiling on the mapped region: 1 MiB.
pub const DEFAULT_MAX_HEAP_SIZE: usize = 1024 * 1024;

/// Debug/behavioral knobs recognized by the heap.
#[derive(Clone, Copy, Debug)]
pub struct HeapOptions {
    /// Logical allocation ceiling in bytes, `base..base+heap_size`.
    pub heap_size: usize,
    /// Hard ceiling in bytes the mapped region is sized for; never changes
    /// after construction.
    pub max_heap_size: usize,
    /// Force `collect()` before every allocation past the first.
    pub gc_zealous: bool,
    /// Emit one tracing event per `collect()` call.
    pub gc_trace: bool,
    /// Emit one tracing event per cell touched during alloc/sweep.
    pub gc_trace2: bool,
    /// Run the full heap consistency check before and after every collection.
    pub gc_slow_asserts: bool,
    /// Overwrite dead cell payloads with a marker byte during sweep.
    pub gc_poison: bool,
}

impl Default for HeapOptions {
    fn default() -> Self {
        Self {
            heap_size: DEFAULT_HEAP_SIZE,
            max_heap_size: DEFAULT_MAX_HEAP_SIZE,
            gc_zealous: false,
            gc_trace: false,
            gc_trace2: false,
            gc_slow_asserts: false,
            gc_poison: false,
        }
    }
}

/// Recoverable, status-returning failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapError {
    /// `init()` could not map the backing region.
    MapFailed,
    /// `finalise()` could not unmap the backing region.
    UnmapFailed,
    /// `set_heap_size` was asked for less than one OS page.
    BelowPageSize,
    /// `set_heap_size` was asked for more than the heap's max size.
    AboveMaxHeapSize,
    /// `set_heap_size` would shrink below the current wilderness.
    BelowWilderness,
}

/// The poison byte written into dead cell payloads when `gc_poison` is set.
const POISON_BYTE: u8 = 0x77;

pub struct Heap {
    options: HeapOptions,
    region: Option<Region>,
    base: Addr,
    /// Logical allocation ceiling, in bytes from `base`. May grow via
    /// `set_heap_size`, bounded by `options.max_heap_size`.
    heap_size: usize,
    wilderness: Addr,
    free_list: Addr,
    bitmap: Bitmap,
    trace_global_roots: TraceRootsFn,
    trace_global_roots_data: *mut c_void,
    finalised: bool,
}

// SAFETY: `Heap` owns its mapped region exclusively and `trace_global_roots_data`
// is only ever dereferenced by the caller-supplied tracer, under the same
// single-threaded cooperative model the rest of this type assumes.
unsafe impl Send for Heap {}

impl Heap {
    /// Construct a heap. The backing region is not mapped yet; call
    /// [`Heap::init`] before allocating.
    #[must_use]
    pub fn new(
        options: HeapOptions,
        trace_global_roots: TraceRootsFn,
        trace_global_roots_data: *mut c_void,
    ) -> Self {
        let max_words = options.max_heap_size / WORD_BYTES;
        Self {
            options,
            region: None,
            base: Addr::null(),
            heap_size: options.heap_size,
            wilderness: Addr::null(),
            free_list: Addr::null(),
            bitmap: Bitmap::new(max_words),
            trace_global_roots,
            trace_global_roots_data,
            finalised: false,
        }
    }

    /// Map the backing OS region. Must be called exactly once before any
    /// allocation.
    ///
    /// # Errors
    /// Returns [`HeapError::MapFailed`] if the OS-level mapping fails.
    pub fn init(&mut self) -> Result<(), HeapError> {
        let region = Region::map(self.options.max_heap_size).ok_or(HeapError::MapFailed)?;
        self.base = region.base();
        self.wilderness = self.base;
        self.region = Some(region);
        Ok(())
    }

    /// Unmap the backing region. After this, only dropping the heap is
    /// valid (calling any other operation is a contract violation).
    ///
    /// # Errors
    /// Returns [`HeapError::UnmapFailed`] if the OS-level unmap fails.
    pub fn finalise(&mut self) -> Result<(), HeapError> {
        if let Some(region) = self.region.as_mut() {
            if !region.unmap() {
                return Err(HeapError::UnmapFailed);
            }
        }
        self.base = Addr::null();
        self.finalised = true;
        Ok(())
    }

    /// Grow or shrink the logical allocation ceiling.
    ///
    /// # Errors
    /// Rejects sizes below one OS page, above `max_heap_size`, or below the
    /// current wilderness.
    pub fn set_heap_size(&mut self, new_size: usize) -> Result<(), HeapError> {
        if new_size < page_size() {
            return Err(HeapError::BelowPageSize);
        }
        if new_size > self.options.max_heap_size {
            return Err(HeapError::AboveMaxHeapSize);
        }
        if new_size < self.wilderness.diff(self.base) {
            return Err(HeapError::BelowWilderness);
        }
        self.heap_size = new_size;
        Ok(())
    }

    #[inline]
    #[must_use]
    pub const fn is_finalised(&self) -> bool {
        self.finalised
    }

    #[inline]
    #[must_use]
    pub const fn wilderness(&self) -> Addr {
        self.wilderness
    }

    #[inline]
    #[must_use]
    pub const fn base(&self) -> Addr {
        self.base
    }

    #[inline]
    #[must_use]
    pub const fn heap_size(&self) -> usize {
        self.heap_size
    }

    #[inline]
    #[must_use]
    pub const fn free_list(&self) -> Addr {
        self.free_list
    }

    // --- heap metadata helpers ------------------------------------------

    #[inline]
    fn word_index(&self, addr: Addr) -> usize {
        addr.diff(self.base) / WORD_BYTES
    }

    #[inline]
    fn region(&self) -> &Region {
        self.region.as_ref().expect("heap must be init() before use")
    }

    #[inline]
    fn bits(&self, addr: Addr) -> u8 {
        self.bitmap.get(self.word_index(addr))
    }

    #[inline]
    fn size_word(&self, addr: Addr) -> usize {
        // SAFETY: addr is a cell payload address, so addr - WORD_BYTES is
        // the cell's size word, which lies within the mapped region.
        unsafe { self.region().read_word(addr.sub(WORD_BYTES)) }
    }

    #[inline]
    fn write_size_word(&self, addr: Addr, size_in_words: usize) {
        // SAFETY: see `size_word`.
        unsafe { self.region().write_word(addr.sub(WORD_BYTES), size_in_words) };
    }

    /// Is `addr` inside the live portion of the heap (below `wilderness`)?
    #[must_use]
    pub fn is_heap_address(&self, addr: Addr) -> bool {
        addr >= self.base && addr < self.wilderness
    }

    /// Is `addr` the payload start of a currently live, valid cell?
    #[must_use]
    pub fn is_valid_object(&self, addr: Addr) -> bool {
        if !self.is_heap_address(addr) {
            return false;
        }
        let bits = self.bits(addr);
        bits & (VALID | ALLOCATED) == (VALID | ALLOCATED)
    }

    /// Read the raw word at `addr`.
    ///
    /// # Safety
    /// `addr` must be a word-aligned address inside the mapped region.
    #[must_use]
    pub unsafe fn read_word(&self, addr: Addr) -> usize {
        unsafe { self.region().read_word(addr) }
    }

    /// Write a raw word at `addr`.
    ///
    /// # Safety
    /// `addr` must be a word-aligned address inside the mapped region.
    pub unsafe fn write_word(&self, addr: Addr, value: usize) {
        unsafe { self.region().write_word(addr, value) };
    }

    /// Walk the heap and confirm every consistency invariant holds: every
    /// live word is `VALID`, cells exactly tile `[base+W, wilderness)`, and
    /// the free list only threads `VALID` cells. Intended for
    /// `gc_slow_asserts` and tests, not the hot path.
    #[must_use]
    pub fn check_heap(&self) -> bool {
        let mut cursor = self.base.add(WORD_BYTES);
        while cursor < self.wilderness {
            if !self.bitmap.has(self.word_index(cursor), VALID) {
                return false;
            }
            let size = self.size_word(cursor);
            if size == 0 {
                return false;
            }
            cursor = cursor.add((size + 1) * WORD_BYTES);
        }
        if cursor != self.wilderness.add(WORD_BYTES) {
            return false;
        }
        let mut free_cursor = self.free_list;
        while !free_cursor.is_null() {
            if self.bitmap.get(self.word_index(free_cursor)) != VALID {
                return false;
            }
            // SAFETY: free cells carry a valid next-pointer in their first
            // payload word, per the free-list's own linking contract.
            free_cursor = Addr::new(unsafe { self.region().read_word(free_cursor) });
        }
        true
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        if !self.finalised {
            let _ = self.finalise();
        }
    }
}
