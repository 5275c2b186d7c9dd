// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::machine::{Machine, Park};
use crate::task::{Id, State, TaskRef};
use core::fmt;

/// An owned permission to join a spawned task.
///
/// Handles are cheap to clone, and any number of tasks may [`join`] the same
/// target. A handle keeps the target's metadata alive, so it can be queried
/// even long after the task has finished.
///
/// [`join`]: JoinHandle::join
#[derive(Clone)]
pub struct JoinHandle {
    task: TaskRef,
}

impl JoinHandle {
    pub(crate) fn new(task: TaskRef) -> Self {
        Self { task }
    }

    /// Blocks the calling task until the target task has completed.
    ///
    /// If the target is already dead this returns immediately, without a
    /// scheduling transition. Otherwise the caller is parked on the target's
    /// waiter list and made runnable again by the target's completion; it
    /// may be resumed by a different machine than the one it parked on.
    ///
    /// # Panics
    ///
    /// Panics if a task joins itself, or when called from a thread that is
    /// not running the scheduler (only tasks can park).
    pub fn join(&self) {
        let machine =
            Machine::current().expect("JoinHandle::join must be called from a runtime task");
        let current = machine
            .processor()
            .current_ptr()
            .expect("JoinHandle::join must be called from a runtime task");
        assert!(
            current != self.task.as_ptr(),
            "a task cannot join itself (task {})",
            self.task.id(),
        );

        if self.task.state() == State::Dead {
            return;
        }

        tracing::trace!(target_task = self.task.id().as_u64(), "join");
        // Safety: the `current` slot owns a reference while the task runs.
        let current = unsafe { current.as_ref() };
        // The waiter-list append happens on the scheduler context, after
        // this context is fully saved; see `Machine::unpark`.
        machine.park_current(current, Park::Wait(self.task.clone()));

        debug_assert_eq!(self.task.state(), State::Dead);
    }

    /// Whether the task has completed.
    pub fn is_finished(&self) -> bool {
        self.task.state() == State::Dead
    }

    /// The task's unique id.
    pub fn id(&self) -> Id {
        self.task.id()
    }

    /// The name the task was spawned with.
    pub fn name(&self) -> &str {
        self.task.name()
    }
}

impl fmt::Debug for JoinHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinHandle").field("task", &self.task).finish()
    }
}
