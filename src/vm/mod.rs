// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! The interpreter loop.
//!
//! `main_loop` fetches one instruction at a time from an immutable
//! [`Bytecode`] buffer, executes it against the two stacks and the heap,
//! and either falls through to the next instruction or jumps. There is no
//! separate decode/execute pass: each iteration decodes exactly the bytes
//! the current opcode needs.


use crate::bytecode::{Bytecode, Immediate, Opcode, Width};
use crate::heap::{Closure, Heap, MarkState, TraceRootsFn};
use crate::stacks::{ExpressionStack, Frame, StackError, Stacks};
use crate::types::{Addr, WORD_BYTES};
use crate::value::StackValue;
use std::ffi::c_void;

/// A foreign function reachable from bytecode via `CCALL`. It receives the
/// expression stack directly and is expected to pop its own arguments and
/// push its own result, mirroring how the interpreter itself touches the
/// stack. It does not touch the return stack.
#[derive(Clone, Copy)]
pub struct CFunc(pub unsafe extern "C" fn(*mut ExpressionStack));

/// A foreign function reachable from bytecode via `CCALL_ALLOC`: like
/// [`CFunc`], but additionally handed the heap and the same
/// tracer/trace-data pair the interpreter itself uses, so the callee can
/// call [`Heap::alloc`]/[`Heap::alloc_bytes`] and still have the
/// interpreter's own stacks scanned as conservative roots.
#[derive(Clone, Copy)]
pub struct CAllocFunc(
    pub unsafe extern "C" fn(*mut ExpressionStack, *mut Heap, TraceRootsFn, *mut c_void),
);

/// The fatal-abort taxonomy. Every variant is a contract violation
/// that `main_loop` cannot recover from; it unwinds to the caller rather
/// than continuing to execute a corrupted program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trap {
    /// `ip` decoded to a byte with no matching opcode, or landed on
    /// `InvalidToken`.
    InvalidOpcode(u8),
    /// `ip` ran past the end of the code buffer.
    CodeOutOfBounds,
    /// A division or modulo opcode's divisor was zero.
    DivisionByZero,
    /// `ROLL` was asked for a depth of zero, which has no defined rotation.
    InvalidRollDepth,
    /// `END` requires exactly one live value on the expression stack;
    /// this many were found instead.
    UnbalancedReturn { esp: usize },
    /// Underlying stack over/underflow.
    Stack(StackError),
}

impl From<StackError> for Trap {
    fn from(e: StackError) -> Self {
        Self::Stack(e)
    }
}

impl core::fmt::Display for Trap {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::InvalidOpcode(b) => write!(f, "invalid opcode byte {b:#04x}"),
            Self::CodeOutOfBounds => write!(f, "instruction pointer ran past the code buffer"),
            Self::DivisionByZero => write!(f, "division by zero"),
            Self::InvalidRollDepth => write!(f, "roll depth must be at least 1"),
            Self::UnbalancedReturn { esp } => {
                write!(f, "return with {esp} live values, expected exactly 1")
            }
            Self::Stack(e) => write!(f, "{e:?}"),
        }
    }
}

impl std::error::Error for Trap {}

/// Cooperative tracer handed to [`Heap::alloc`]/[`Heap::collect`]: the
/// current environment pointer is an exact root, the two stacks are
/// scanned conservatively. `data` points at a live [`TraceContext`] set up
/// by whichever call site triggered the allocation.
///
/// `TraceContext` carries a raw pointer rather than a borrow so this
/// function pointer can be handed to foreign code (`CCALL_ALLOC`) that
/// also holds a live `*mut ExpressionStack` into the same stacks;
/// tying the context to a Rust lifetime would make that aliasing
/// impossible to express.
fn trace_vm_roots(state: &mut MarkState<'_>, data: *mut c_void) {
    // SAFETY: every call site below builds `ctx` from a `Stacks` that
    // outlives the `Heap::alloc`/`Heap::alloc_closure` call this tracer is
    // invoked from.
    let ctx = unsafe { &*data.cast::<TraceContext>() };
    // SAFETY: see above.
    let stacks = unsafe { &*ctx.stacks };
    state.mark_root(ctx.env);
    let (base, len) = stacks.expr.live_region();
    state.mark_root_conservative(base, len);
    let (base, len) = stacks.ret.live_region();
    state.mark_root_conservative(base, len);
}

struct TraceContext {
    stacks: *const Stacks,
    env: Addr,
}

fn alloc_words(heap: &mut Heap, stacks: &Stacks, env: Addr, words: usize) -> Addr {
    let ctx = TraceContext { stacks: &raw const *stacks, env };
    let data = (&raw const ctx).cast_mut().cast::<c_void>();
    heap.alloc(words, Some(trace_vm_roots), data)
}

fn alloc_closure(heap: &mut Heap, stacks: &Stacks, env: Addr) -> Addr {
    let ctx = TraceContext { stacks: &raw const *stacks, env };
    let data = (&raw const ctx).cast_mut().cast::<c_void>();
    heap.alloc_closure(Some(trace_vm_roots), data)
}

/// Zero/sign-extend or truncate a raw 64-bit pattern from one width to
/// another.
fn widen(v: StackValue, from: Width, signed: bool) -> u64 {
    match (from, signed) {
        (Width::W8, false) => u64::from(v.as_u8()),
        (Width::W8, true) => v.as_i8() as i64 as u64,
        (Width::W16, false) => u64::from(v.as_u16()),
        (Width::W16, true) => v.as_i16() as i64 as u64,
        (Width::W32, false) => u64::from(v.as_u32()),
        (Width::W32, true) => v.as_i32() as i64 as u64,
        (Width::W64, _) => v.as_u64(),
    }
}

fn narrow(v: StackValue, to: Width) -> u64 {
    match to {
        Width::W8 => u64::from(v.as_u8()),
        Width::W16 => u64::from(v.as_u16()),
        Width::W32 => u64::from(v.as_u32()),
        Width::W64 => v.as_u64(),
    }
}

fn mask(width: Width) -> u64 {
    match width {
        Width::W8 => 0xFF,
        Width::W16 => 0xFFFF,
        Width::W32 => 0xFFFF_FFFF,
        Width::W64 => u64::MAX,
    }
}

/// Decode the instruction at `ip`, returning it together with its
/// immediate operand (zero-extended into a `StackValue` if there is one)
/// and the address of the following instruction.
///
/// # Errors
/// `Trap::CodeOutOfBounds` if any byte the instruction needs lies outside
/// the code buffer; `Trap::InvalidOpcode` if the opcode byte is unknown.
fn decode(code: &Bytecode, ip: Addr) -> Result<(Opcode, StackValue, Addr), Trap> {
    if !code.contains(ip) {
        return Err(Trap::CodeOutOfBounds);
    }
    // SAFETY: `ip` was just checked to lie within the code buffer.
    let byte = unsafe { code.read_u8(ip) };
    let op = Opcode::from_byte(byte).ok_or(Trap::InvalidOpcode(byte))?;
    if matches!(op, Opcode::InvalidToken) {
        return Err(Trap::InvalidOpcode(byte));
    }

    let mut cursor = ip.add(1);
    let imm = match op.immediate() {
        Immediate::None => StackValue::zero(),
        Immediate::Width(w) => {
            cursor = cursor.align_up(w);
            if cursor.add(w) > code.end() {
                return Err(Trap::CodeOutOfBounds);
            }
            // SAFETY: bounds and alignment checked above.
            let bits = unsafe {
                match w {
                    1 => u64::from(code.read_u8(cursor)),
                    2 => u64::from(code.read_u16(cursor)),
                    4 => u64::from(code.read_u32(cursor)),
                    8 => code.read_u64(cursor),
                    _ => code.read_usize(cursor) as u64,
                }
            };
            cursor = cursor.add(w);
            StackValue::from_u64(bits)
        }
    };

    Ok((op, imm, cursor))
}

/// Run a closure to completion, starting a fresh top-level call.
///
/// # Errors
/// Any [`Trap`] the program raises along the way.
pub fn main_loop(stacks: &mut Stacks, heap: &mut Heap, code: &Bytecode, entry: Closure) -> Result<i32, Trap> {
    let mut ip = entry.code;
    let mut env = entry.data;

    loop {
        let (op, imm, next_ip) = decode(code, ip)?;
        ip = next_ip;

        match op {
            Opcode::LoadImmediate(_w) => {
                stacks.expr.push(imm)?;
            }

            Opcode::Add(w) => binop(stacks, w, |a, b| a.wrapping_add(b))?,
            Opcode::Sub(w) => binop(stacks, w, |a, b| a.wrapping_sub(b))?,
            Opcode::Mul(w) => binop(stacks, w, |a, b| a.wrapping_mul(b))?,
            Opcode::Div(w) => checked_binop(stacks, w, |a, b| a.checked_div(b))?,
            Opcode::Mod(w) => checked_binop(stacks, w, |a, b| a.checked_rem(b))?,
            Opcode::And(w) => binop(stacks, w, |a, b| a & b)?,
            Opcode::Or(w) => binop(stacks, w, |a, b| a | b)?,
            Opcode::Xor(w) => binop(stacks, w, |a, b| a ^ b)?,
            Opcode::LtU(w) => cmp_binop(stacks, w, |a, b| a < b)?,
            Opcode::GtU(w) => cmp_binop(stacks, w, |a, b| a > b)?,
            Opcode::Eq(w) => cmp_binop(stacks, w, |a, b| a == b)?,
            Opcode::LtS(w) => signed_cmp_binop(stacks, w, |a, b| a < b)?,
            Opcode::GtS(w) => signed_cmp_binop(stacks, w, |a, b| a > b)?,

            Opcode::Not(w) => {
                let a = narrow(stacks.expr.pop()?, w);
                stacks.expr.push(StackValue::from_u64((!a) & mask(w)))?;
            }
            Opcode::LShift(w) => {
                let count = stacks.expr.pop()?.as_u8();
                let a = narrow(stacks.expr.pop()?, w);
                let bits = u32::try_from(w.bytes() * 8).unwrap_or(64);
                let result = if u32::from(count) >= bits { 0 } else { a << count };
                stacks.expr.push(StackValue::from_u64(result & mask(w)))?;
            }
            Opcode::RShift(w) => {
                let count = stacks.expr.pop()?.as_u8();
                let a = narrow(stacks.expr.pop()?, w);
                let bits = u32::try_from(w.bytes() * 8).unwrap_or(64);
                let result = if u32::from(count) >= bits { 0 } else { a >> count };
                stacks.expr.push(StackValue::from_u64(result & mask(w)))?;
            }

            Opcode::Ze(pair) => {
                let v = stacks.expr.pop()?;
                let widened = widen(v, pair.from(), false) & mask(pair.to());
                stacks.expr.push(StackValue::from_u64(widened))?;
            }
            Opcode::Se(pair) => {
                let v = stacks.expr.pop()?;
                let widened = widen(v, pair.from(), true) & mask(pair.to());
                stacks.expr.push(StackValue::from_u64(widened))?;
            }
            Opcode::Trunc(pair) => {
                let v = stacks.expr.pop()?;
                let truncated = narrow(v, pair.to());
                stacks.expr.push(StackValue::from_u64(truncated))?;
            }

            Opcode::Dup => stacks.expr.dup()?,
            Opcode::Drop => stacks.expr.drop_top()?,
            Opcode::Swap => stacks.expr.swap()?,
            Opcode::Roll => {
                let d = imm.as_u8();
                if d == 0 {
                    return Err(Trap::InvalidRollDepth);
                }
                stacks.expr.roll(d)?;
            }
            Opcode::Pick => stacks.expr.pick(imm.as_u8())?,

            // LOAD_k off: (ptr -- val ptr). `off` is a 2-byte immediate.
            // The pointer stays on the stack below the loaded value, so
            // it's peeked, not popped.
            Opcode::Load(w) => {
                let off = imm.as_u64() as usize;
                let ptr = stacks.expr.peek().ok_or(StackError::ExpressionStackUnderflow)?.as_addr();
                let target = ptr.add(off);
                // SAFETY: the program is trusted to pass a live, aligned
                // address; this mirrors the heap's own raw word access.
                let bits = unsafe {
                    match w {
                        Width::W8 => u64::from(target.as_ptr::<u8>().read()),
                        Width::W16 => u64::from(target.as_ptr::<u16>().read()),
                        Width::W32 => u64::from(target.as_ptr::<u32>().read()),
                        Width::W64 => target.as_ptr::<u64>().read(),
                    }
                };
                stacks.expr.push(StackValue::from_u64(bits))?;
            }
            Opcode::LoadPtr => {
                let off = imm.as_u64() as usize;
                let ptr = stacks.expr.peek().ok_or(StackError::ExpressionStackUnderflow)?.as_addr();
                let target = ptr.add(off);
                // SAFETY: see `Opcode::Load`.
                let loaded = unsafe { target.as_ptr::<usize>().read() };
                stacks.expr.push(StackValue::from_u64(loaded as u64))?;
            }
            // STORE_k off: (val ptr -- ptr). `off` is a 2-byte immediate.
            // Only `val` is popped; `ptr` stays on the stack.
            Opcode::Store(w) => {
                let off = imm.as_u64() as usize;
                let value = stacks.expr.pop()?;
                let ptr = stacks.expr.peek().ok_or(StackError::ExpressionStackUnderflow)?.as_addr();
                let target = ptr.add(off);
                // SAFETY: see `Opcode::Load`.
                unsafe {
                    match w {
                        Width::W8 => target.as_mut_ptr::<u8>().write(value.as_u8()),
                        Width::W16 => target.as_mut_ptr::<u16>().write(value.as_u16()),
                        Width::W32 => target.as_mut_ptr::<u32>().write(value.as_u32()),
                        Width::W64 => target.as_mut_ptr::<u64>().write(value.as_u64()),
                    }
                }
            }

            Opcode::Call => {
                stacks.ret.push(Frame { env, return_ip: ip })?;
                ip = imm.as_addr();
            }
            Opcode::Tcall => {
                ip = imm.as_addr();
            }
            // CALL_CLOSURE closure_ptr: the closure cell is named by the
            // aligned immediate, not popped off the expression stack
            // (that's CALL_IND, below).
            Opcode::CallClosure => {
                let cell = imm.as_addr();
                let closure = heap.read_closure(cell);
                stacks.ret.push(Frame { env, return_ip: ip })?;
                env = closure.data;
                ip = closure.code;
            }
            // CALL_IND: unlike CALL_CLOSURE, the cell comes off the
            // expression stack rather than an immediate, but it's still a
            // closure cell to dereference, not a bare code address.
            Opcode::CallInd => {
                let cell = stacks.expr.pop()?.as_addr();
                let closure = heap.read_closure(cell);
                stacks.ret.push(Frame { env, return_ip: ip })?;
                env = closure.data;
                ip = closure.code;
            }
            Opcode::Cjmp(w) => {
                let cond = narrow(stacks.expr.pop()?, w);
                if cond != 0 {
                    ip = imm.as_addr();
                }
            }
            Opcode::Jmp => {
                ip = imm.as_addr();
            }
            Opcode::Ret => {
                let frame = stacks.ret.pop()?;
                env = frame.env;
                ip = frame.return_ip;
            }
            Opcode::End => {
                let esp = stacks.expr.len();
                if esp != 1 {
                    return Err(Trap::UnbalancedReturn { esp });
                }
                let result = stacks.expr.pop()?;
                return Ok(result.as_i32());
            }

            // ALLOC size_bytes: the immediate names a byte count, rounded
            // up to whole words before reaching the allocator.
            Opcode::Alloc => {
                let size_bytes = usize::try_from(imm.as_u64()).unwrap_or(usize::MAX);
                let words = size_bytes.div_ceil(WORD_BYTES);
                let cell = alloc_words(heap, stacks, env, words);
                stacks.expr.push(StackValue::from_addr(cell))?;
            }
            // `data` must stay on the expression stack (not in a local) for
            // the duration of `alloc_closure`, so the conservative stack
            // scan still finds it if this allocation triggers a collection.
            Opcode::MakeClosure => {
                let code_ptr = imm.as_addr();
                let cell = alloc_closure(heap, stacks, env);
                let data = stacks.expr.pop()?.as_addr();
                heap.init_closure(cell, code_ptr, data);
                stacks.expr.push(StackValue::from_addr(cell))?;
            }
            Opcode::GetEnv => {
                stacks.expr.push(StackValue::from_addr(env))?;
            }

            Opcode::Ccall => {
                let target = imm.as_addr();
                let func: CFunc = CFunc(unsafe { core::mem::transmute::<usize, _>(target.as_usize()) });
                // SAFETY: the program is trusted to encode a real `CFunc`
                // address; the callee manages its own stack effect.
                unsafe { (func.0)(&raw mut stacks.expr) };
            }
            Opcode::CcallAlloc => {
                let target = imm.as_addr();
                let func: CAllocFunc =
                    CAllocFunc(unsafe { core::mem::transmute::<usize, _>(target.as_usize()) });
                let ctx = TraceContext { stacks: &raw const *stacks, env };
                let data = (&raw const ctx).cast_mut().cast::<c_void>();
                // SAFETY: the program is trusted to encode a real
                // `CAllocFunc` address; the callee manages its own stack
                // effect and must route any allocation through the
                // supplied heap/tracer pair so `ctx` stays valid.
                unsafe { (func.0)(&raw mut stacks.expr, &raw mut *heap, trace_vm_roots, data) };
            }

            Opcode::InvalidToken => unreachable!("decode rejects InvalidToken"),
        }
    }
}

fn binop(stacks: &mut Stacks, w: Width, f: impl Fn(u64, u64) -> u64) -> Result<(), Trap> {
    let b = narrow(stacks.expr.pop()?, w);
    let a = narrow(stacks.expr.pop()?, w);
    stacks.expr.push(StackValue::from_u64(f(a, b) & mask(w)))?;
    Ok(())
}

fn checked_binop(stacks: &mut Stacks, w: Width, f: impl Fn(u64, u64) -> Option<u64>) -> Result<(), Trap> {
    let b = narrow(stacks.expr.pop()?, w);
    let a = narrow(stacks.expr.pop()?, w);
    let r = f(a, b).ok_or(Trap::DivisionByZero)?;
    stacks.expr.push(StackValue::from_u64(r & mask(w)))?;
    Ok(())
}

fn cmp_binop(stacks: &mut Stacks, w: Width, f: impl Fn(u64, u64) -> bool) -> Result<(), Trap> {
    let b = narrow(stacks.expr.pop()?, w);
    let a = narrow(stacks.expr.pop()?, w);
    stacks.expr.push(StackValue::from_bool(f(a, b)))?;
    Ok(())
}

fn signed_cmp_binop(stacks: &mut Stacks, w: Width, f: impl Fn(i64, i64) -> bool) -> Result<(), Trap> {
    let b = widen(stacks.expr.pop()?, w, true) as i64;
    let a = widen(stacks.expr.pop()?, w, true) as i64;
    stacks.expr.push(StackValue::from_bool(f(a, b)))?;
    Ok(())
}
