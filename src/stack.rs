// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Task stacks.
//!
//! Each task owns a fixed-size, `mmap`-backed stack with a guard page below
//! it, so that a runaway task faults instead of silently scribbling over a
//! neighbouring allocation. Stacks are released together with their task.

use std::io::Error;
use std::ptr;

#[cfg(not(unix))]
compile_error!("task stacks require a unix-like mmap");

/// A stack pointer value. Always non-zero.
pub(crate) type StackPointer = core::num::NonZeroUsize;

/// Usable size of a task stack, excluding the guard page.
pub const STACK_SIZE: usize = 64 * 1024;

/// Required alignment of the top of a stack.
pub const STACK_ALIGNMENT: usize = 16;

/// An owned, `mmap`-backed stack with a guard page at its low end.
pub(crate) struct TaskStack {
    top: StackPointer,
    mmap_len: usize,
}

impl TaskStack {
    /// Maps a new stack which has at least the given usable capacity.
    pub(crate) fn new(size: usize) -> std::io::Result<Self> {
        // Add a guard page to the requested size and round the total up to a
        // page boundary.
        let page_size = page_size();
        let mmap_len = size
            .checked_add(page_size + page_size - 1)
            .expect("integer overflow while calculating stack size")
            & !(page_size - 1);

        // OpenBSD requires MAP_STACK on anything that is used as a stack.
        cfg_if::cfg_if! {
            if #[cfg(target_os = "openbsd")] {
                let map_flags = libc::MAP_ANONYMOUS | libc::MAP_PRIVATE | libc::MAP_STACK;
            } else {
                let map_flags = libc::MAP_ANONYMOUS | libc::MAP_PRIVATE;
            }
        }

        // Safety: anonymous mapping with no fixed address; the pointer is
        // checked against MAP_FAILED before use.
        unsafe {
            let mmap = libc::mmap(ptr::null_mut(), mmap_len, libc::PROT_NONE, map_flags, -1, 0);
            if mmap == libc::MAP_FAILED {
                return Err(Error::last_os_error());
            }

            // Create the result here so that the mapping is unmapped if the
            // mprotect call below fails.
            let out = Self {
                top: StackPointer::new(mmap as usize + mmap_len)
                    .expect("mmap returned a mapping ending at address zero"),
                mmap_len,
            };
            debug_assert_eq!(out.top.get() % STACK_ALIGNMENT, 0);

            // Make everything except the lowest page writable.
            if libc::mprotect(
                mmap.cast::<u8>().add(page_size).cast(),
                mmap_len - page_size,
                libc::PROT_READ | libc::PROT_WRITE,
            ) != 0
            {
                return Err(Error::last_os_error());
            }

            Ok(out)
        }
    }

    /// The highest address of the stack. Stacks grow down from here.
    pub(crate) fn top(&self) -> StackPointer {
        self.top
    }
}

impl Drop for TaskStack {
    fn drop(&mut self) {
        let mmap = self.top.get() - self.mmap_len;
        // Safety: `mmap`/`mmap_len` describe exactly the mapping created in
        // `new`, and the stack is only dropped once no context runs on it.
        let ret = unsafe { libc::munmap(mmap as _, self.mmap_len) };
        debug_assert_eq!(ret, 0);
    }
}

fn page_size() -> usize {
    // Safety: sysconf(_SC_PAGESIZE) has no preconditions.
    let pagesize = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
    assert!(pagesize.is_power_of_two());
    pagesize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_write_unmap() {
        let stack = TaskStack::new(STACK_SIZE).unwrap();
        assert_eq!(stack.top().get() % STACK_ALIGNMENT, 0);

        // The top of the stack must be writable.
        unsafe {
            let slot = (stack.top().get() - size_of::<usize>()) as *mut usize;
            slot.write(0xdead_beef);
            assert_eq!(slot.read(), 0xdead_beef);
        }
    }

    #[test]
    fn rounds_up_to_page_size() {
        let stack = TaskStack::new(1).unwrap();
        assert!(stack.mmap_len >= 2 * page_size());
    }
}
