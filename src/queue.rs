// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Run queues.
//!
//! Three tiers, fastest first:
//!
//! 1. [`Ring`] used as a per-processor *local* queue: bounded, touched only
//!    by the owning machine, no locking.
//! 2. [`Ring`] used as a per-processor *shared* queue behind a mutex,
//!    visible to every machine for stealing and remote enqueues.
//! 3. [`Injector`], the unbounded global queue, also behind a mutex. All
//!    overflow ends up here.
//!
//! The [`Graveyard`] reuses the same intrusive list shape for completed
//! tasks awaiting reclamation.

use crate::task::{Task, TaskRef};
use arrayvec::ArrayVec;
use cordyceps::List;
use core::sync::atomic::{AtomicUsize, Ordering};

/// Capacity of the per-processor rings.
pub(crate) const RING_CAPACITY: usize = 4;

/// A bounded run queue.
///
/// Pops remove a uniformly random resident slot rather than the head; the
/// remaining items keep their relative order. Randomized dispatch avoids
/// convoy behaviour when many tasks yield in lockstep.
pub(crate) struct Ring {
    slots: ArrayVec<TaskRef, RING_CAPACITY>,
}

impl Ring {
    pub(crate) fn new() -> Self {
        Self {
            slots: ArrayVec::new(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub(crate) fn is_full(&self) -> bool {
        self.slots.is_full()
    }

    /// Appends at the tail, handing the task back if the ring is full so the
    /// caller can spill it into the next tier.
    pub(crate) fn push(&mut self, task: TaskRef) -> Result<(), TaskRef> {
        self.slots.try_push(task).map_err(|err| err.element())
    }

    /// Removes a uniformly random slot, compacting the remainder.
    pub(crate) fn pop_random(&mut self, rng: &mut fastrand::Rng) -> Option<TaskRef> {
        if self.slots.is_empty() {
            return None;
        }
        Some(self.slots.remove(rng.usize(..self.slots.len())))
    }

    /// Removes the oldest slot. Used when transferring between rings, where
    /// relative order should be preserved.
    pub(crate) fn pop_front(&mut self) -> Option<TaskRef> {
        if self.slots.is_empty() {
            return None;
        }
        Some(self.slots.remove(0))
    }

    /// Empties the ring, returning its contents in order.
    pub(crate) fn take_all(&mut self) -> ArrayVec<TaskRef, RING_CAPACITY> {
        core::mem::take(&mut self.slots)
    }
}

/// The unbounded global run queue.
///
/// An intrusive FIFO; pushes append at the tail, pops unlink a uniformly
/// random position so that bursty contention cannot starve tasks near the
/// tail. The O(len) pop cost is acceptable on this slow path. The length is
/// tracked next to the list so it can be read without walking it.
pub(crate) struct Injector {
    queue: spin::Mutex<List<Task>>,
    queued: AtomicUsize,
}

impl Injector {
    pub(crate) const fn new() -> Self {
        Self {
            queue: spin::Mutex::new(List::new()),
            queued: AtomicUsize::new(0),
        }
    }

    pub(crate) fn push(&self, task: TaskRef) {
        let mut queue = self.queue.lock();
        queue.push_back(task);
        self.queued.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn len(&self) -> usize {
        self.queued.load(Ordering::Relaxed)
    }

    pub(crate) fn pop_random(&self, rng: &mut fastrand::Rng) -> Option<TaskRef> {
        let mut queue = self.queue.lock();
        let len = self.queued.load(Ordering::Relaxed);
        if len == 0 {
            return None;
        }

        // Rotate a uniformly chosen element to the head and unlink it.
        // Rotation keeps later pops uniform over the residents as well.
        for _ in 0..rng.usize(..len) {
            let head = queue.pop_front().expect("length tracked above");
            queue.push_back(head);
        }
        let popped = queue.pop_front();
        debug_assert!(popped.is_some());
        self.queued.fetch_sub(1, Ordering::Relaxed);
        popped
    }
}

/// Completed tasks awaiting reclamation.
///
/// A dead task is parked here by the scheduler that ran its completion; its
/// memory is reclaimed by [`sweep`](Graveyard::sweep) once no `JoinHandle`
/// to it remains.
pub(crate) struct Graveyard {
    queue: spin::Mutex<List<Task>>,
    buried: AtomicUsize,
}

impl Graveyard {
    pub(crate) const fn new() -> Self {
        Self {
            queue: spin::Mutex::new(List::new()),
            buried: AtomicUsize::new(0),
        }
    }

    pub(crate) fn push(&self, task: TaskRef) {
        debug_assert_eq!(task.state(), crate::task::State::Dead);
        let mut queue = self.queue.lock();
        queue.push_back(task);
        self.buried.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn len(&self) -> usize {
        self.buried.load(Ordering::Relaxed)
    }

    /// Reclaims every task whose only remaining reference is the
    /// graveyard's own; tasks with live handles are kept for a later sweep.
    /// One bounded pass over the queue.
    pub(crate) fn sweep(&self) {
        let mut queue = self.queue.lock();
        for _ in 0..self.buried.load(Ordering::Relaxed) {
            let Some(task) = queue.pop_front() else { break };
            if task.ref_count() == 1 {
                tracing::trace!(task = task.id().as_u64(), "reclaiming dead task");
                drop(task);
                self.buried.fetch_sub(1, Ordering::Relaxed);
            } else {
                queue.push_back(task);
            }
        }
    }
}
