// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! End-to-end programs assembled and run entirely through the public API:
//! each one exercises a full `ALLOC`/`collect()`/`main_loop` path the way
//! an embedder would, rather than a single opcode in isolation.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::ptr;

use stackvm::{Addr, Assembler, Bytecode, Closure, Heap, HeapOptions, Opcode, Stacks, Width};

fn fresh_heap() -> Heap {
    let mut heap = Heap::new(HeapOptions::default(), |_, _| {}, ptr::null_mut());
    heap.init().expect("mmap should succeed");
    heap
}

fn run(asm: Assembler) -> i32 {
    let code = Bytecode::from_assembler(asm);
    let entry = Closure { code: code.base(), data: Addr::null() };
    let mut stacks = Stacks::default();
    let mut heap = fresh_heap();
    stackvm::main_loop(&mut stacks, &mut heap, &code, entry).expect("program should not trap")
}

#[test]
fn trivial_return() {
    let mut asm = Assembler::new();
    asm.opcode(Opcode::LoadImmediate(Width::W32)).imm32(0x2A);
    asm.opcode(Opcode::End);
    assert_eq!(run(asm), 42);
}

#[test]
fn arithmetic() {
    let mut asm = Assembler::new();
    asm.opcode(Opcode::LoadImmediate(Width::W32)).imm32(3);
    asm.opcode(Opcode::LoadImmediate(Width::W32)).imm32(4);
    asm.opcode(Opcode::Add(Width::W32));
    asm.opcode(Opcode::End);
    assert_eq!(run(asm), 7);
}

#[test]
fn call_and_return() {
    let mut asm = Assembler::new();
    let f_offset = asm.here();
    asm.opcode(Opcode::LoadImmediate(Width::W32)).imm32(5);
    asm.opcode(Opcode::Ret);

    let main_offset = asm.here();
    asm.opcode(Opcode::Call);
    asm.imm_usize(0);
    let call_imm_at = asm.here() - core::mem::size_of::<usize>();
    asm.opcode(Opcode::End);

    let mut code = Bytecode::from_assembler(asm);
    code.link(call_imm_at, f_offset);

    let entry = Closure { code: code.base().add(main_offset), data: Addr::null() };
    let mut stacks = Stacks::default();
    let mut heap = fresh_heap();
    let result = stackvm::main_loop(&mut stacks, &mut heap, &code, entry).expect("no trap");
    assert_eq!(result, 5);
}

#[test]
fn closure_round_trip() {
    // LOAD_IMMEDIATE_32 11; ALLOC 4; <build env>; MAKE_CLOSURE g; CALL_IND;
    // END, where g is GET_ENV; LOAD_32 0; ...; RET.
    let mut asm = Assembler::new();
    let g_offset = asm.here();
    asm.opcode(Opcode::GetEnv);
    asm.opcode(Opcode::Load(Width::W32)).imm16(0);
    asm.opcode(Opcode::Swap);
    asm.opcode(Opcode::Drop);
    asm.opcode(Opcode::Ret);

    let main_offset = asm.here();
    asm.opcode(Opcode::LoadImmediate(Width::W32)).imm32(11);
    asm.opcode(Opcode::Alloc).imm_usize(4);
    asm.opcode(Opcode::Swap);
    asm.opcode(Opcode::Store(Width::W32)).imm16(0);
    asm.opcode(Opcode::MakeClosure);
    asm.imm_usize(0);
    let make_closure_imm_at = asm.here() - core::mem::size_of::<usize>();
    asm.opcode(Opcode::CallInd);
    asm.opcode(Opcode::End);

    let mut code = Bytecode::from_assembler(asm);
    code.link(make_closure_imm_at, g_offset);

    let entry = Closure { code: code.base().add(main_offset), data: Addr::null() };
    let mut stacks = Stacks::default();
    let mut heap = fresh_heap();
    let result = stackvm::main_loop(&mut stacks, &mut heap, &code, entry).expect("no trap");
    assert_eq!(result, 11);
}

#[test]
fn gc_preserves_a_reachable_allocation_across_unreachable_churn() {
    let mut heap = fresh_heap();
    let cell = heap.alloc(4, None, ptr::null_mut());
    unsafe { heap.write_word(cell, 0xDEAD_BEEF) };

    fn trace_one(state: &mut stackvm::heap::MarkState<'_>, data: *mut std::ffi::c_void) {
        state.mark_root(Addr::new(data as usize));
    }

    for _ in 0..999 {
        heap.alloc(1, Some(trace_one), cell.as_mut_ptr::<std::ffi::c_void>());
    }
    heap.collect(Some(trace_one), cell.as_mut_ptr::<std::ffi::c_void>());

    assert!(heap.is_valid_object(cell));
    assert_eq!(unsafe { heap.read_word(cell) }, 0xDEAD_BEEF);
}

#[test]
fn bump_then_sweep_coalesces_dead_cells() {
    let mut heap = fresh_heap();
    let a = heap.alloc(4, None, ptr::null_mut());
    let _b = heap.alloc(4, None, ptr::null_mut());
    let c = heap.alloc(4, None, ptr::null_mut());

    fn trace_one(state: &mut stackvm::heap::MarkState<'_>, data: *mut std::ffi::c_void) {
        state.mark_root(Addr::new(data as usize));
    }

    heap.collect(Some(trace_one), c.as_mut_ptr::<std::ffi::c_void>());

    assert!(heap.is_valid_object(c));
    assert!(!heap.is_valid_object(a));
    let free = heap.free_list();
    assert!(!free.is_null());
    assert!(heap.check_heap());
}
