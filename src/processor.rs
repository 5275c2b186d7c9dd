// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Processors.
//!
//! A [`Processor`] is a logical scheduling unit: it owns the two bounded run
//! queue tiers and the slot for the task currently executing on it. Every
//! processor is bound 1:1 to a [`Machine`](crate::machine::Machine) for the
//! lifetime of the process.

use crate::queue::{RING_CAPACITY, Ring};
use crate::task::{Task, TaskRef};
use arrayvec::ArrayVec;
use core::cell::UnsafeCell;
use core::fmt;
use core::ptr::NonNull;

/// A logical scheduling unit.
///
/// The `local` ring and the `current` slot are single-owner state: only the
/// machine bound to this processor may touch them, and it does so only from
/// its own kernel thread. The `shared` ring is the processor's window to its
/// peers; any machine may lock it to steal or to enqueue remotely.
pub(crate) struct Processor {
    id: usize,
    local: UnsafeCell<Ring>,
    shared: spin::Mutex<Ring>,
    current: UnsafeCell<Option<TaskRef>>,
}

// Safety: `shared` is lock-guarded; `local` and `current` are only ever
// accessed from the kernel thread of the bound machine (enforced by every
// accessor being called on the scheduler paths of that machine).
unsafe impl Send for Processor {}
unsafe impl Sync for Processor {}

impl Processor {
    pub(crate) fn new(id: usize) -> Self {
        Self {
            id,
            local: UnsafeCell::new(Ring::new()),
            shared: spin::Mutex::new(Ring::new()),
            current: UnsafeCell::new(None),
        }
    }

    pub(crate) fn id(&self) -> usize {
        self.id
    }

    /// Enqueues a runnable task, preferring the private tier:
    /// local ring, then shared ring, then the global injector.
    ///
    /// Bound machine only.
    pub(crate) fn enqueue(&self, task: TaskRef) {
        // Safety: bound machine only, see struct docs.
        let local = unsafe { &mut *self.local.get() };
        if let Err(task) = local.push(task) {
            self.push_shared(task);
        }
    }

    /// Enqueues a runnable task where peers can see it: shared ring, spilling
    /// into the global injector when full. Callable from any machine.
    pub(crate) fn push_shared(&self, task: TaskRef) {
        let spilled = {
            let mut shared = self.shared.lock();
            match shared.push(task) {
                Ok(()) => return,
                Err(task) => task,
            }
        };
        // The shared lock is released above; at most one queue lock is ever
        // held at a time.
        crate::runtime::current().injector().push(spilled);
    }

    /// Makes a woken task runnable. The bootstrap task is handed back to its
    /// pinned seat on machine 0; everything else becomes stealable via the
    /// shared ring.
    pub(crate) fn wake(&self, task: TaskRef) {
        if task.is_bootstrap() {
            crate::runtime::current().offer_bootstrap(task);
        } else {
            self.push_shared(task);
        }
    }

    /// Pops a runnable task from the local ring, refilling it from the
    /// shared ring when empty (and topping it up again if the pop leaves it
    /// empty).
    ///
    /// Bound machine only.
    pub(crate) fn pop(&self, rng: &mut fastrand::Rng) -> Option<TaskRef> {
        // Safety: bound machine only, see struct docs.
        let local = unsafe { &mut *self.local.get() };
        if local.is_empty() {
            self.refill(local);
        }
        let picked = local.pop_random(rng);
        if local.is_empty() {
            self.refill(local);
        }
        picked
    }

    fn refill(&self, local: &mut Ring) {
        let mut shared = self.shared.lock();
        while !local.is_full() {
            let Some(task) = shared.pop_front() else { break };
            let Ok(()) = local.push(task) else {
                unreachable!("local ring checked non-full")
            };
        }
    }

    /// Empties the shared ring, returning its contents in order. This is the
    /// work-stealing primitive: a thief drains the whole tier at once.
    pub(crate) fn take_shared(&self) -> ArrayVec<TaskRef, RING_CAPACITY> {
        self.shared.lock().take_all()
    }

    /// Installs the task about to run. Bound machine only.
    pub(crate) fn set_current(&self, task: TaskRef) {
        // Safety: bound machine only, see struct docs.
        let current = unsafe { &mut *self.current.get() };
        debug_assert!(current.is_none(), "processor {} already has a current task", self.id);
        *current = Some(task);
    }

    /// Removes and returns the task that just stopped running. Bound machine
    /// only.
    pub(crate) fn take_current(&self) -> Option<TaskRef> {
        // Safety: bound machine only, see struct docs.
        unsafe { (*self.current.get()).take() }
    }

    /// The task currently executing on this processor. Bound machine only.
    pub(crate) fn current_ptr(&self) -> Option<NonNull<Task>> {
        // Safety: bound machine only, see struct docs.
        unsafe { (*self.current.get()).as_ref().map(TaskRef::as_ptr) }
    }

    /// Queue depths `(local, shared)`, for diagnostics. Bound machine only.
    pub(crate) fn queue_depths(&self) -> (usize, usize) {
        // Safety: bound machine only, see struct docs.
        let local = unsafe { &*self.local.get() };
        (local.len(), self.shared.lock().len())
    }
}

impl fmt::Debug for Processor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Processor").field("id", &self.id).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy(name: &str) -> TaskRef {
        Task::new(name.to_owned(), Box::new(|| {}))
    }

    #[test]
    fn take_shared_drains_in_order() {
        let processor = Processor::new(9);
        let first = dummy("first");
        let first_id = first.id();
        processor.push_shared(first);
        processor.push_shared(dummy("second"));

        let stolen = processor.take_shared();
        assert_eq!(stolen.len(), 2);
        assert_eq!(stolen[0].id(), first_id);
        assert!(processor.take_shared().is_empty());
    }

    #[test]
    fn pop_refills_from_shared() {
        let mut rng = fastrand::Rng::with_seed(3);
        let processor = Processor::new(10);

        let task = dummy("shared-only");
        let id = task.id();
        processor.push_shared(task);

        // Nothing in the local ring, so the pop must pull the task over.
        let popped = processor.pop(&mut rng).unwrap();
        assert_eq!(popped.id(), id);
        assert!(processor.pop(&mut rng).is_none());
    }

    #[test]
    fn current_slot_round_trip() {
        let processor = Processor::new(11);
        assert!(processor.current_ptr().is_none());

        let task = dummy("current");
        let ptr = task.as_ptr();
        processor.set_current(task);
        assert_eq!(processor.current_ptr(), Some(ptr));

        let task = processor.take_current().unwrap();
        assert_eq!(task.as_ptr(), ptr);
        assert!(processor.current_ptr().is_none());
    }
}
