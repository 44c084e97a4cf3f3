// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! # stackvm
//!
//! A threaded bytecode interpreter over a conservative mark-sweep heap.
//!
//! This crate provides:
//! - A non-moving mark-sweep [`heap`] with a per-word metadata bitmap,
//!   best-fit free-list allocation with bump-pointer wilderness fallback,
//!   and a conservative/interior-pointer root-tracing API
//! - A one-byte-opcode, naturally-aligned-immediate [`bytecode`] format
//! - A [`vm`] interpreter loop dispatching over that bytecode, with calls,
//!   tail-calls, closures and indirect calls driving the heap's allocator
//!
//! Bytecode loading, compilation, and the built-in C-callable function
//! library are external collaborators and out of scope for this crate;
//! see the crate's `DESIGN.md` for the rationale.

pub mod bytecode;
pub mod heap;
pub mod stacks;
pub mod types;
pub mod value;
pub mod vm;

// Re-export the types most embedders reach for first.
pub use bytecode::{Assembler, Bytecode, Opcode};
pub use heap::{Closure, Heap, HeapError, HeapOptions};
pub use stacks::Stacks;
pub use types::Addr;
pub use vm::{main_loop, Trap};
