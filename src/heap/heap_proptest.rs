// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Property tests for the allocator/collector pair: these generate random
//! allocation-and-root sequences rather than fixed scenarios, to catch
//! invariant violations the hand-picked tests above don't think to try.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use super::{Heap, HeapOptions, MarkState};
use crate::types::Addr;
use proptest::prelude::*;
use std::ffi::c_void;
use std::ptr;

fn fresh_heap() -> Heap {
    let mut heap = Heap::new(HeapOptions::default(), |_, _| {}, ptr::null_mut());
    heap.init().expect("mmap should succeed");
    heap
}

/// Traces exactly the addresses baked into `data` (a `*const [Addr]`'s thin
/// pointer, smuggled through the `*mut c_void` root-tracing convention).
fn trace_slice(state: &mut MarkState<'_>, data: *mut c_void) {
    // SAFETY: callers pass a pointer obtained from `Box::into_raw` on a
    // `Vec<Addr>` they keep alive for the duration of the traced call.
    let roots = unsafe { &*(data as *const Vec<Addr>) };
    for &root in roots {
        state.mark_root(root);
    }
}

fn small_word_count() -> impl Strategy<Value = usize> {
    1usize..8
}

proptest! {
    /// Whatever sequence of allocations a caller makes, `check_heap`'s
    /// invariants (every live word VALID, cells exactly tile
    /// `[base+W, wilderness)`, the free list only threads VALID cells) must
    /// hold both before and after every collection — whether the cell just
    /// allocated becomes a root or is left as garbage for the next sweep.
    #[test]
    fn heap_stays_consistent_across_random_alloc_collect_sequences(
        sizes in prop::collection::vec(small_word_count(), 1..40),
        keep in prop::collection::vec(any::<bool>(), 1..40),
        collect_after in prop::collection::vec(any::<bool>(), 1..40),
    ) {
        let mut heap = fresh_heap();
        let mut live: Vec<Addr> = Vec::new();

        for (i, &words) in sizes.iter().enumerate() {
            let roots = Box::new(live.clone());
            let data = Box::into_raw(roots) as *mut c_void;
            let p = heap.alloc(words, Some(trace_slice), data);
            // SAFETY: reclaim the box immediately after the call that
            // borrowed it; `alloc` never retains `data` past its own return.
            drop(unsafe { Box::from_raw(data as *mut Vec<Addr>) });

            if keep.get(i).copied().unwrap_or(true) {
                live.push(p);
            }
            prop_assert!(heap.check_heap());

            if collect_after.get(i).copied().unwrap_or(false) {
                let roots = Box::new(live.clone());
                let data = Box::into_raw(roots) as *mut c_void;
                heap.collect(Some(trace_slice), data);
                drop(unsafe { Box::from_raw(data as *mut Vec<Addr>) });
                prop_assert!(heap.check_heap());
                for &p in &live {
                    prop_assert!(heap.is_valid_object(p));
                }
            }
        }
    }

    /// Every address a tracer marked as reachable survives collection intact
    /// — its payload is untouched and it still reads as a valid object,
    /// regardless of how much unreachable churn happened around it.
    #[test]
    fn marked_roots_always_survive_collection(
        keep_value in any::<u32>(),
        noise in prop::collection::vec(small_word_count(), 0..50),
    ) {
        let mut heap = fresh_heap();
        let kept = heap.alloc(1, None, ptr::null_mut());
        unsafe { heap.write_word(kept, keep_value as usize) };

        for words in noise {
            heap.alloc(words, Some(trace_slice), ptr::null_mut());
        }

        let roots = Box::new(vec![kept]);
        let data = Box::into_raw(roots) as *mut c_void;
        heap.collect(Some(trace_slice), data);
        drop(unsafe { Box::from_raw(data as *mut Vec<Addr>) });

        prop_assert!(heap.is_valid_object(kept));
        prop_assert_eq!(unsafe { heap.read_word(kept) }, keep_value as usize);
    }

    /// Collecting twice in a row with the same roots and no intervening
    /// allocation is idempotent: the second pass frees nothing further and
    /// leaves the heap exactly as the first pass did.
    #[test]
    fn collecting_twice_in_a_row_is_idempotent(
        sizes in prop::collection::vec(small_word_count(), 1..20),
        keep_every in 2usize..5,
    ) {
        let mut heap = fresh_heap();
        let mut all = Vec::new();
        for words in &sizes {
            all.push(heap.alloc(*words, None, ptr::null_mut()));
        }
        let kept: Vec<Addr> = all.iter().step_by(keep_every).copied().collect();

        let roots = Box::new(kept.clone());
        let data = Box::into_raw(roots) as *mut c_void;
        heap.collect(Some(trace_slice), data);
        let free_after_first = heap.free_list();
        let wilderness_after_first = heap.wilderness();

        heap.collect(Some(trace_slice), data);
        drop(unsafe { Box::from_raw(data as *mut Vec<Addr>) });

        prop_assert!(heap.check_heap());
        prop_assert_eq!(heap.free_list(), free_after_first);
        prop_assert_eq!(heap.wilderness(), wilderness_after_first);
        for &p in &kept {
            prop_assert!(heap.is_valid_object(p));
        }
    }
}
