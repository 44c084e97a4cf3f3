// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

#![allow(clippy::unwrap_used, clippy::expect_used)]

use super::{Heap, HeapError, HeapOptions, DEFAULT_MAX_HEAP_SIZE};
use std::ptr;

fn fresh_heap() -> Heap {
    let mut heap = Heap::new(HeapOptions::default(), |_, _| {}, ptr::null_mut());
    heap.init().expect("mmap should succeed");
    heap
}

#[test]
fn init_maps_a_fresh_wilderness_at_base() {
    let heap = fresh_heap();
    assert_eq!(heap.wilderness(), heap.base());
    assert!(heap.free_list().is_null());
}

#[test]
fn finalise_then_reinit_is_a_contract_violation_free_drop() {
    let mut heap = fresh_heap();
    heap.finalise().expect("unmap should succeed");
    assert!(heap.is_finalised());
    // Dropping an already-finalised heap must not double-unmap.
    drop(heap);
}

#[test]
fn set_heap_size_rejects_below_page_size() {
    let mut heap = fresh_heap();
    assert_eq!(heap.set_heap_size(1), Err(HeapError::BelowPageSize));
}

#[test]
fn set_heap_size_rejects_above_max() {
    let mut heap = fresh_heap();
    assert_eq!(
        heap.set_heap_size(DEFAULT_MAX_HEAP_SIZE + 4096),
        Err(HeapError::AboveMaxHeapSize)
    );
}

#[test]
fn set_heap_size_rejects_shrinking_below_wilderness() {
    let mut heap = fresh_heap();
    heap.alloc(4096, None, ptr::null_mut());
    assert_eq!(heap.set_heap_size(4096), Err(HeapError::BelowWilderness));
}

#[test]
fn set_heap_size_can_grow_within_max() {
    let mut heap = fresh_heap();
    heap.set_heap_size(DEFAULT_MAX_HEAP_SIZE)
        .expect("growing within max_heap_size should succeed");
}

#[test]
fn is_heap_address_respects_wilderness_boundary() {
    let mut heap = fresh_heap();
    let p = heap.alloc(1, None, ptr::null_mut());
    assert!(heap.is_heap_address(p));
    assert!(!heap.is_heap_address(heap.wilderness()));
}
