// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! An M:N work-stealing scheduler for stackful coroutines.
//!
//! Many lightweight *tasks* are multiplexed onto a bounded set of
//! *processors*, each serviced by exactly one kernel thread (a *machine*).
//! Scheduling is purely cooperative: a task runs until it calls
//! [`yield_now`], blocks in [`JoinHandle::join`], or returns. There is no
//! preemption, no I/O integration and no timers; the runtime is the
//! scheduler and the task lifecycle, nothing more.
//!
//! # Architecture
//!
//! Runnable tasks travel through three queue tiers. Each processor owns a
//! small *local* ring only its machine touches, and a mutex-guarded *shared*
//! ring visible to every machine; everything that overflows lands in the
//! unbounded global queue. A machine dispatches from its local ring first,
//! steals a random peer's entire shared ring when it runs dry, falls back to
//! the global queue, and idles briefly when there is nothing anywhere.
//! Yielding tasks re-enter the *shared* ring deliberately, so that idle
//! peers can pick them up.
//!
//! The first thread to touch the runtime becomes machine 0 and its thread
//! of control becomes the bootstrap task; [`spawn_machine`] adds parallel
//! machines up to [`set_max_machines`] (at most [`MAX_MACHINES`]).
//!
//! Because stolen tasks resume on whichever machine picked them up, task
//! code must not assume a stable kernel thread across [`yield_now`] or
//! [`JoinHandle::join`] — in particular, values derived from thread-locals
//! must not be cached across a suspension point.
//!
//! # Example
//!
//! ```
//! let pong = strand::spawn("pong", || {
//!     strand::yield_now();
//! });
//! let ping = strand::spawn("ping", {
//!     let pong = pong.clone();
//!     move || pong.join()
//! });
//!
//! ping.join();
//! pong.join();
//! assert!(pong.is_finished());
//! ```

mod arch;
mod error;
mod machine;
mod processor;
mod queue;
mod runtime;
mod stack;
mod task;

pub use error::MachineError;
pub use machine::yield_now;
pub use runtime::{
    MAX_MACHINES, Stats, machine_count, max_machines, set_max_machines, spawn, spawn_machine,
    stats,
};
pub use stack::STACK_SIZE;
pub use task::{Id, JoinHandle};
