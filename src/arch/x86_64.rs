// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! x86_64 (System V) context switching.
//!
//! A context is the six callee-saved general-purpose registers plus the
//! stack pointer. The instruction pointer is not stored in the context;
//! instead the saved stack pointer points at a return address, and loading a
//! context ends in `ret`. For a suspended context that return address was
//! pushed by the `call` into [`switch`]; for a fresh context it is planted
//! by [`Context::fresh`].
//!
//! Stack layout of a fresh context:
//!
//! ```text
//! +-------------+  <- stack top (16-byte aligned)
//! | 0           |     fake return address, terminates frame walks
//! +-------------+
//! | entry       |  <- saved RSP; `ret` pops this and jumps to `entry`
//! +-------------+
//! ```
//!
//! After the `ret`, RSP is 8 bytes below a 16-byte boundary, exactly as on a
//! normal function entry.

use crate::stack::{STACK_ALIGNMENT, StackPointer};
use core::arch::naked_asm;
use core::mem::offset_of;
use static_assertions::const_assert_eq;

/// Saved callee-saved register state of a suspended context.
#[repr(C)]
#[derive(Debug)]
pub(crate) struct Context {
    rsp: usize,
    rbp: usize,
    rbx: usize,
    r12: usize,
    r13: usize,
    r14: usize,
    r15: usize,
}

// The asm below hard-codes these offsets.
const_assert_eq!(offset_of!(Context, rsp), 0x00);
const_assert_eq!(offset_of!(Context, rbp), 0x08);
const_assert_eq!(offset_of!(Context, rbx), 0x10);
const_assert_eq!(offset_of!(Context, r12), 0x18);
const_assert_eq!(offset_of!(Context, r13), 0x20);
const_assert_eq!(offset_of!(Context, r14), 0x28);
const_assert_eq!(offset_of!(Context, r15), 0x30);
const_assert_eq!(size_of::<Context>(), 0x38);

impl Context {
    /// An all-zero context. Must be written by [`switch`] before it is ever
    /// loaded.
    pub(crate) const fn new() -> Self {
        Self {
            rsp: 0,
            rbp: 0,
            rbx: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
        }
    }

    /// Builds a context that begins executing `entry` on the given stack
    /// when first loaded.
    ///
    /// # Safety
    ///
    /// `stack_top` must be the top of a mapped, writable stack that stays
    /// alive for as long as the returned context can be loaded.
    pub(crate) unsafe fn fresh(stack_top: StackPointer, entry: extern "C" fn() -> !) -> Self {
        let mut sp = stack_top.get();
        debug_assert_eq!(sp % STACK_ALIGNMENT, 0);

        // Safety: both slots lie just below the top of the mapped stack.
        unsafe {
            // Zero return address so that frame walks stop at the entry
            // function.
            sp -= size_of::<usize>();
            (sp as *mut usize).write(0);

            // The address `ret` in `switch`/`enter` will pop and jump to.
            sp -= size_of::<usize>();
            (sp as *mut usize).write(entry as usize);
        }

        Self {
            rsp: sp,
            rbp: 0,
            rbx: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
        }
    }
}

/// Saves the current register state into `save` and loads `load`.
///
/// Returns when another context later loads `save`, possibly on a different
/// kernel thread.
///
/// # Safety
///
/// `save` must be valid for writes, `load` must hold a loadable context
/// (fresh, or previously saved and not yet resumed), and no other thread may
/// concurrently load or store either context.
#[unsafe(naked)]
pub(crate) unsafe extern "C" fn switch(save: *mut Context, load: *const Context) {
    naked_asm! {
        // RSP still includes the return address pushed by the call into this
        // function; the paired `ret` below finds it again on resume.
        "mov [rdi + 0x00], rsp",
        "mov [rdi + 0x08], rbp",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], r12",
        "mov [rdi + 0x20], r13",
        "mov [rdi + 0x28], r14",
        "mov [rdi + 0x30], r15",
        "mov rsp, [rsi + 0x00]",
        "mov rbp, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov r12, [rsi + 0x18]",
        "mov r13, [rsi + 0x20]",
        "mov r14, [rsi + 0x28]",
        "mov r15, [rsi + 0x30]",
        "ret",
    }
}

/// Loads `load` without saving the current state.
///
/// # Safety
///
/// As for [`switch`]; additionally the current context is lost, so nothing
/// on the current stack may be needed again.
#[unsafe(naked)]
pub(crate) unsafe extern "C" fn enter(load: *const Context) -> ! {
    naked_asm! {
        "mov rsp, [rdi + 0x00]",
        "mov rbp, [rdi + 0x08]",
        "mov rbx, [rdi + 0x10]",
        "mov r12, [rdi + 0x18]",
        "mov r13, [rdi + 0x20]",
        "mov r14, [rdi + 0x28]",
        "mov r15, [rdi + 0x30]",
        "ret",
    }
}
