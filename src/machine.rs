// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Machines and the scheduler loop.
//!
//! A [`Machine`] is a kernel thread bound 1:1 to a
//! [`Processor`](crate::processor::Processor). The scheduler runs on a
//! per-machine *scheduler context* distinct from every task: a suspending
//! task always switches out to the scheduler context first, and the park
//! action it left behind is performed there, after the task's registers are
//! fully saved. A task therefore never becomes visible in a queue (or on a
//! waiter list) while it is still executing, even briefly.
//!
//! Worker machines use their kernel thread's own stack as the scheduler
//! stack. The bootstrap machine cannot: its kernel stack belongs to the main
//! task, so it gets a dedicated stack whose context is first entered when
//! the main task suspends.

use crate::arch;
use crate::processor::Processor;
use crate::runtime;
use crate::stack::{STACK_SIZE, TaskStack};
use crate::task::{State, Task, TaskRef};
use core::cell::{Cell, UnsafeCell};
use core::fmt;
use core::time::Duration;

/// How long an idle machine sleeps before rechecking the queues.
pub(crate) const IDLE_SLEEP: Duration = Duration::from_millis(1);

/// What to do with the task that just switched out, performed on the
/// scheduler context once the switch has completed.
pub(crate) enum Park {
    /// Reinsert into the shared ring, where peers can steal it.
    Yield,
    /// Append to the target's waiter list, unless the target died first.
    Wait(TaskRef),
    /// The task completed; move it to the graveyard.
    Finished,
}

std::thread_local! {
    static CURRENT_MACHINE: Cell<Option<&'static Machine>> = const { Cell::new(None) };
}

/// A kernel thread servicing one processor.
pub(crate) struct Machine {
    id: usize,
    processor: &'static Processor,
    /// Set when the last scheduling attempt found no work anywhere; the
    /// machine loop then idles briefly before retrying.
    spinning: Cell<bool>,
    /// The pending park action of the task that is switching out.
    park: Cell<Option<Park>>,
    /// The scheduler context. Saved every time this machine dispatches a
    /// task; loaded every time a task suspends.
    g0: UnsafeCell<arch::Context>,
    /// Backing stack for `g0` on the bootstrap machine; worker machines run
    /// the scheduler on their kernel thread's stack.
    g0_stack: Option<TaskStack>,
}

// Safety: `spinning`, `park` and `g0` are only ever accessed from the one
// kernel thread bound to this machine (tasks running on it included); other
// threads only read the immutable `id` and `processor` fields.
unsafe impl Send for Machine {}
unsafe impl Sync for Machine {}

impl Machine {
    pub(crate) fn new_worker(id: usize, processor: &'static Processor) -> Self {
        debug_assert_eq!(id, processor.id());
        Self {
            id,
            processor,
            spinning: Cell::new(false),
            park: Cell::new(None),
            g0: UnsafeCell::new(arch::Context::new()),
            g0_stack: None,
        }
    }

    pub(crate) fn new_bootstrap(processor: &'static Processor) -> Self {
        let stack = TaskStack::new(STACK_SIZE).expect("failed to map the scheduler stack");
        // Safety: the stack was just mapped and is owned by this machine for
        // the lifetime of the process.
        let g0 = unsafe { arch::Context::fresh(stack.top(), scheduler_entry) };
        Self {
            id: 0,
            processor,
            spinning: Cell::new(false),
            park: Cell::new(None),
            g0: UnsafeCell::new(g0),
            g0_stack: Some(stack),
        }
    }

    /// The machine bound to the calling kernel thread, if any.
    ///
    /// Never inlined: a task can migrate to a different kernel thread at
    /// every suspension point, so the thread-local access must happen inside
    /// its own frame, where no context switch can sit between the TLS read
    /// and its use.
    #[inline(never)]
    pub(crate) fn current() -> Option<&'static Machine> {
        CURRENT_MACHINE.with(Cell::get)
    }

    /// Binds this machine to the calling kernel thread.
    pub(crate) fn bind(&'static self) {
        debug_assert!(Machine::current().is_none(), "thread already bound to a machine");
        CURRENT_MACHINE.with(|current| current.set(Some(self)));
    }

    pub(crate) fn processor(&self) -> &'static Processor {
        self.processor
    }

    /// The scheduler loop. Never returns; machines live until process exit.
    pub(crate) fn run(&'static self) -> ! {
        let _span = tracing::debug_span!("scheduler", machine = self.id).entered();
        let mut rng = fastrand::Rng::new();
        tracing::debug!(machine = self.id, "machine running");
        loop {
            if self.spinning.get() {
                std::thread::sleep(IDLE_SLEEP);
                self.spinning.set(false);
            } else if let Some(task) = self.pick_next(&mut rng) {
                self.dispatch(task);
            } else {
                self.spinning.set(true);
            }
        }
    }

    /// Picks the next runnable task: own local ring (refilled from the own
    /// shared ring), then the pinned bootstrap seat (machine 0 only), then a
    /// steal from a random peer, then the global injector.
    fn pick_next(&self, rng: &mut fastrand::Rng) -> Option<TaskRef> {
        let runtime = runtime::current();

        if let Some(task) = self.processor.pop(rng) {
            return Some(task);
        }
        if self.id == 0 {
            if let Some(task) = runtime.take_bootstrap() {
                return Some(task);
            }
        }
        if let Some(task) = self.steal(rng) {
            return Some(task);
        }
        runtime.injector().pop_random(rng)
    }

    /// Work stealing: starting at a random seat, drain the first non-empty
    /// peer shared ring into the own local ring, then pop from it.
    fn steal(&self, rng: &mut fastrand::Rng) -> Option<TaskRef> {
        let runtime = runtime::current();
        let seats = runtime.processor_count();
        if seats <= 1 {
            return None;
        }

        let start = rng.usize(..seats);
        for i in 0..seats {
            let Some(victim) = runtime.processor((start + i) % seats) else {
                continue;
            };
            if victim.id() == self.processor.id() {
                continue;
            }

            let stolen = victim.take_shared();
            if stolen.is_empty() {
                continue;
            }
            tracing::trace!(
                machine = self.id,
                victim = victim.id(),
                count = stolen.len(),
                "stole shared ring"
            );
            // The local ring is empty (pick_next pops it first) and a shared
            // ring is never larger, so everything fits.
            for task in stolen {
                self.processor.enqueue(task);
            }
            return self.processor.pop(rng);
        }

        None
    }

    /// Runs a task until it parks or finishes, then performs its park
    /// action.
    fn dispatch(&'static self, task: TaskRef) {
        if task.state() == State::New {
            task.set_state(State::Running);
        }
        debug_assert_eq!(task.state(), State::Running);
        tracing::trace!(machine = self.id, task = task.id().as_u64(), "dispatch");

        let ctx = task.context_ptr();
        self.processor.set_current(task);
        // Safety: `ctx` belongs to the task just installed as current; it is
        // either fresh or was saved when the task last suspended, and no
        // other machine can load it while the task is outside every queue.
        unsafe { arch::switch(self.g0.get(), ctx) };

        self.unpark();
    }

    /// Performs the park action of the task that just switched out. Runs on
    /// the scheduler context, after the switch: only now may the task become
    /// visible to other machines.
    ///
    /// Called from [`dispatch`](Self::dispatch) and, for the very first
    /// suspension on the bootstrap machine, from [`scheduler_entry`] (the
    /// fresh scheduler context starts there rather than after the switch in
    /// `dispatch`, with the main task's park action still pending).
    fn unpark(&self) {
        let task = self
            .processor
            .take_current()
            .expect("a task switched to the scheduler without being current");
        match self.park.take() {
            Some(Park::Yield) => {
                tracing::trace!(machine = self.id, task = task.id().as_u64(), "yielded");
                self.processor.wake(task);
            }
            Some(Park::Wait(target)) => self.park_waiter(task, target),
            Some(Park::Finished) => {
                tracing::trace!(machine = self.id, task = task.id().as_u64(), "finished");
                runtime::current().graveyard().push(task);
            }
            None => unreachable!("task switched to the scheduler without parking"),
        }
    }

    fn park_waiter(&self, task: TaskRef, target: TaskRef) {
        let mut waiters = target.waiters().lock();
        if target.state() == State::Dead {
            // The target completed between the join fast path and the park;
            // the joiner can continue right away.
            drop(waiters);
            if task.is_bootstrap() {
                runtime::current().offer_bootstrap(task);
            } else {
                self.processor.enqueue(task);
            }
        } else {
            task.set_state(State::Waiting);
            waiters.push(task);
        }
    }

    /// Suspends the current task with the given park action and switches to
    /// the scheduler context. Returns when the task is next dispatched,
    /// possibly on a *different* machine: `self` must not be used after this
    /// call.
    pub(crate) fn park_current(&'static self, task: &Task, park: Park) {
        debug_assert!(
            self.processor
                .current_ptr()
                .is_some_and(|current| current.as_ptr() == core::ptr::from_ref(task).cast_mut()),
            "parking a task that is not current"
        );
        self.park.set(Some(park));
        // Safety: `task` is current on this machine, so its context slot is
        // exclusively ours to save into, and `g0` holds the scheduler state
        // saved when this task was dispatched.
        unsafe { arch::switch(task.context_ptr(), self.g0.get()) };
    }

    /// Leaves a completed task for good. The dead context is not saved.
    pub(crate) fn finish_current(&'static self) -> ! {
        self.park.set(Some(Park::Finished));
        // Safety: as for `park_current`, except the current context is dead
        // and will never be loaded again, so nothing needs to be saved.
        unsafe { arch::enter(self.g0.get()) }
    }
}

impl fmt::Debug for Machine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Machine")
            .field("id", &self.id)
            .field("spinning", &self.spinning.get())
            .field("owns_scheduler_stack", &self.g0_stack.is_some())
            .finish_non_exhaustive()
    }
}

/// Entry of the bootstrap machine's dedicated scheduler context; first
/// loaded when the main task suspends for the first time, with the main
/// task's park action still pending.
extern "C" fn scheduler_entry() -> ! {
    let machine = Machine::current().expect("scheduler context entered on an unbound thread");
    machine.unpark();
    machine.run()
}

/// Cooperatively gives up the processor.
///
/// The calling task is reinserted into its processor's *shared* ring (not
/// the private one), so that idle peers get a chance to pick it up; this
/// improves load balance on bursty workloads. Returns once the task is
/// dispatched again, possibly on a different machine.
///
/// Calling this from a thread that is not running the scheduler, or outside
/// any task, is a no-op.
pub fn yield_now() {
    let Some(machine) = Machine::current() else {
        return;
    };
    let Some(current) = machine.processor().current_ptr() else {
        return;
    };
    // Safety: the `current` slot owns a reference for as long as the task
    // runs.
    let current = unsafe { current.as_ref() };
    tracing::trace!(task = current.id().as_u64(), "yield");
    machine.park_current(current, Park::Yield);
}
