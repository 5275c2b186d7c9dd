// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Architecture-specific context switching.
//!
//! Each architecture provides a saved-register [`Context`] and three
//! operations:
//!
//! - `Context::fresh(stack_top, entry)` — build a context that, when first
//!   loaded, begins executing `entry` on the given stack.
//! - `switch(save, load)` — save the current callee-saved register state
//!   (including the stack and instruction pointers) into `save` and load the
//!   state from `load`. Returns when some other context later loads `save`.
//! - `enter(load)` — load `load` without saving the current state. Used when
//!   the current context is dead and will never be resumed.
//!
//! Only callee-saved registers are preserved; a context switch behaves like
//! an opaque function call, so the compiler keeps everything else alive
//! across it on the stack.

cfg_if::cfg_if! {
    if #[cfg(all(target_arch = "x86_64", not(windows)))] {
        mod x86_64;
        pub(crate) use x86_64::*;
    } else if #[cfg(target_arch = "aarch64")] {
        mod aarch64;
        pub(crate) use aarch64::*;
    } else {
        compile_error!("Unsupported target architecture");
    }
}
