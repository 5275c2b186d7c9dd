// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Tasks and their lifecycle.
//!
//! A [`Task`] is a unit of user work with its own stack, saved register
//! context, state machine and list of joiners. Tasks are heap-allocated and
//! reference-counted: run queues, the per-processor `current` slot, waiter
//! lists and user-held [`JoinHandle`]s each own one reference through a
//! [`TaskRef`]. A task's stack and metadata are freed when the last
//! reference is dropped, which can only happen after the task is dead, so a
//! handle can always be queried safely.

mod id;
mod join_handle;

use crate::arch;
use crate::machine::Machine;
use crate::stack::{STACK_SIZE, TaskStack};
use core::cell::UnsafeCell;
use core::fmt;
use core::marker::PhantomPinned;
use core::mem::{self, offset_of};
use core::panic::AssertUnwindSafe;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU8, AtomicUsize, Ordering, fence};
use cordyceps::{Linked, list};

pub use id::Id;
pub use join_handle::JoinHandle;

/// Lifecycle state of a task.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub(crate) enum State {
    /// Spawned but never dispatched.
    New = 0,
    /// Runnable or currently running.
    Running = 1,
    /// Parked on another task's waiter list.
    Waiting = 2,
    /// Completed. Terminal.
    Dead = 3,
}

struct AtomicState(AtomicU8);

impl AtomicState {
    const fn new(state: State) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    fn load(&self) -> State {
        match self.0.load(Ordering::Acquire) {
            0 => State::New,
            1 => State::Running,
            2 => State::Waiting,
            3 => State::Dead,
            state => unreachable!("invalid task state {state}"),
        }
    }

    fn store(&self, state: State) {
        self.0.store(state as u8, Ordering::Release);
    }
}

/// A task control block.
///
/// Interior mutability rules:
/// - `entry` is taken exactly once, by the trampoline, on the machine
///   dispatching the task for the first time.
/// - `ctx` is only touched by the machine that currently owns the task, i.e.
///   holds it outside of any queue. Queue mutexes order the hand-over.
/// - `waiters` guards its list *and* the transition to [`State::Dead`]: the
///   completing task drains the list and stores `Dead` under the lock, so a
///   joiner that takes the lock afterwards cannot append to a drained list.
pub(crate) struct Task {
    refs: AtomicUsize,
    id: Id,
    name: String,
    state: AtomicState,
    entry: UnsafeCell<Option<Box<dyn FnOnce() + Send + 'static>>>,
    ctx: UnsafeCell<arch::Context>,
    /// `None` only for the bootstrap task, which runs on the kernel-provided
    /// stack of the thread that initialized the runtime.
    stack: Option<TaskStack>,
    waiters: spin::Mutex<Vec<TaskRef>>,
    /// Links for the injector or the graveyard; a task is a member of at
    /// most one of them at a time.
    links: list::Links<Task>,
    span: tracing::Span,
    _pin: PhantomPinned,
}

// Safety: all shared interior state is either atomic or guarded as described
// on the struct; `entry` and `ctx` are confined to the single machine that
// owns the task at any given moment.
unsafe impl Send for Task {}
unsafe impl Sync for Task {}

impl Task {
    /// Allocates a task with a fresh stack and a context that enters the
    /// trampoline when first dispatched.
    ///
    /// Allocation failure is fatal: a coroutine runtime that cannot map a
    /// stack has no useful way to recover.
    pub(crate) fn new(name: String, entry: Box<dyn FnOnce() + Send + 'static>) -> TaskRef {
        let stack = TaskStack::new(STACK_SIZE).expect("failed to map a task stack");
        // Safety: the stack is freshly mapped and owned by this task.
        let ctx = unsafe { arch::Context::fresh(stack.top(), trampoline) };
        let id = Id::next();
        let span = tracing::trace_span!("task", task.id = id.as_u64(), task.name = %name);

        TaskRef::new_allocated(Box::new(Self {
            refs: AtomicUsize::new(1),
            id,
            name,
            state: AtomicState::new(State::New),
            entry: UnsafeCell::new(Some(entry)),
            ctx: UnsafeCell::new(ctx),
            stack: Some(stack),
            waiters: spin::Mutex::new(Vec::new()),
            links: list::Links::new(),
            span,
            _pin: PhantomPinned,
        }))
    }

    /// The task representing the initial thread of control. It is already
    /// running, owns no fiber stack, and its context is first filled in when
    /// it suspends.
    pub(crate) fn new_bootstrap() -> TaskRef {
        let id = Id::next();
        let span = tracing::trace_span!("task", task.id = id.as_u64(), task.name = "main");

        TaskRef::new_allocated(Box::new(Self {
            refs: AtomicUsize::new(1),
            id,
            name: "main".to_owned(),
            state: AtomicState::new(State::Running),
            entry: UnsafeCell::new(None),
            ctx: UnsafeCell::new(arch::Context::new()),
            stack: None,
            waiters: spin::Mutex::new(Vec::new()),
            links: list::Links::new(),
            span,
            _pin: PhantomPinned,
        }))
    }

    pub(crate) fn id(&self) -> Id {
        self.id
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn state(&self) -> State {
        self.state.load()
    }

    pub(crate) fn set_state(&self, state: State) {
        debug_assert_ne!(self.state.load(), State::Dead, "tasks never leave Dead");
        self.state.store(state);
    }

    /// Whether this is the bootstrap task. The bootstrap task is pinned to
    /// machine 0 (see `Runtime::offer_bootstrap`).
    pub(crate) fn is_bootstrap(&self) -> bool {
        self.stack.is_none()
    }

    pub(crate) fn waiters(&self) -> &spin::Mutex<Vec<TaskRef>> {
        &self.waiters
    }

    pub(crate) fn context_ptr(&self) -> *mut arch::Context {
        self.ctx.get()
    }

    pub(crate) fn span(&self) -> &tracing::Span {
        &self.span
    }

    /// Takes the entry closure.
    ///
    /// # Safety
    ///
    /// Only the trampoline, on the machine dispatching this task for the
    /// first time, may call this.
    unsafe fn take_entry(&self) -> Option<Box<dyn FnOnce() + Send + 'static>> {
        // Safety: per the caller contract there is no concurrent access.
        unsafe { (*self.entry.get()).take() }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state.load())
            .finish_non_exhaustive()
    }
}

/// A reference-counted pointer to a spawned [`Task`].
///
/// Tasks are pinned on the heap for their whole life; schedulers move
/// `TaskRef`s around instead. The task is deallocated, stack included, when
/// the last `TaskRef` is dropped.
pub(crate) struct TaskRef(NonNull<Task>);

// Safety: the pointee is `Send + Sync` and the reference count is atomic.
unsafe impl Send for TaskRef {}
unsafe impl Sync for TaskRef {}

impl TaskRef {
    fn new_allocated(task: Box<Task>) -> Self {
        debug_assert_eq!(task.refs.load(Ordering::Relaxed), 1);
        Self(NonNull::from(Box::leak(task)))
    }

    pub(crate) fn as_ptr(&self) -> NonNull<Task> {
        self.0
    }

    /// The current number of live references, including this one.
    pub(crate) fn ref_count(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }
}

impl Clone for TaskRef {
    fn clone(&self) -> Self {
        self.refs.fetch_add(1, Ordering::Relaxed);
        Self(self.0)
    }
}

impl Drop for TaskRef {
    fn drop(&mut self) {
        if self.refs.fetch_sub(1, Ordering::Release) == 1 {
            fence(Ordering::Acquire);
            // Safety: this was the last reference, and the pointer came out
            // of `Box::leak` in `new_allocated`.
            unsafe { drop(Box::from_raw(self.0.as_ptr())) }
        }
    }
}

impl core::ops::Deref for TaskRef {
    type Target = Task;

    fn deref(&self) -> &Self::Target {
        // Safety: the reference count keeps the task alive.
        unsafe { self.0.as_ref() }
    }
}

impl fmt::Debug for TaskRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        (**self).fmt(f)
    }
}

// Safety: `links` is the links field, tasks are never moved once allocated,
// and a `TaskRef` (one reference) is what queues logically store.
unsafe impl Linked<list::Links<Task>> for Task {
    type Handle = TaskRef;

    fn into_ptr(r: Self::Handle) -> NonNull<Self> {
        let ptr = r.0;
        // The list takes over this reference; it is given back in `from_ptr`.
        mem::forget(r);
        ptr
    }

    unsafe fn from_ptr(ptr: NonNull<Self>) -> Self::Handle {
        TaskRef(ptr)
    }

    unsafe fn links(ptr: NonNull<Self>) -> NonNull<list::Links<Self>> {
        ptr.map_addr(|addr| {
            let offset = offset_of!(Self, links);
            addr.checked_add(offset).unwrap()
        })
        .cast()
    }
}

/// First-entry function of every spawned task.
///
/// Runs the user closure, then performs the completion protocol: transition
/// to [`State::Dead`] and drain the waiter list under the waiter lock, make
/// every waiter runnable, and leave for the scheduler context without saving
/// this (now dead) context. The scheduler then moves the task to the
/// graveyard.
extern "C" fn trampoline() -> ! {
    let task = Machine::current()
        .and_then(|machine| machine.processor().current_ptr())
        .expect("task trampoline entered with no current task");
    // Safety: the `current` slot owns a reference for as long as the task
    // runs, and the task outlives this borrow via the graveyard reference.
    let task = unsafe { task.as_ref() };

    // Safety: first dispatch of this task; nothing else touches `entry`.
    let entry = unsafe { task.take_entry() }.expect("task entered twice");
    task.span().in_scope(|| tracing::trace!("entered"));
    // Unwinding must not cross the context-switch boundary below, so a
    // panicking task completes like any other. The span is not kept entered
    // across the user code: entering and exiting must pair up on one kernel
    // thread, and the task may migrate inside `entry`.
    let panicked = std::panic::catch_unwind(AssertUnwindSafe(entry)).is_err();
    task.span().in_scope(|| {
        if panicked {
            tracing::error!("task panicked, treating it as completed");
        }
        tracing::trace!("completed");
    });

    // The task may have been resumed on a different machine than the one it
    // started on; everything carrier-related must be re-read.
    let machine = Machine::current().expect("completing task lost its machine");
    debug_assert!(
        machine
            .processor()
            .current_ptr()
            .is_some_and(|current| current.as_ptr() == core::ptr::from_ref(task).cast_mut()),
        "completing task is not current on its machine"
    );

    let woken = {
        let mut waiters = task.waiters().lock();
        task.set_state(State::Dead);
        mem::take(&mut *waiters)
    };
    for waiter in woken {
        tracing::trace!(waiter = waiter.id().as_u64(), "waking joiner");
        waiter.set_state(State::Running);
        machine.processor().wake(waiter);
    }

    machine.finish_current()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_round_trip() {
        let state = AtomicState::new(State::New);
        assert_eq!(state.load(), State::New);
        state.store(State::Running);
        assert_eq!(state.load(), State::Running);
        state.store(State::Waiting);
        assert_eq!(state.load(), State::Waiting);
        state.store(State::Dead);
        assert_eq!(state.load(), State::Dead);
    }

    #[test]
    fn ref_counting_frees_on_last_drop() {
        let task = Task::new("refcount".to_owned(), Box::new(|| {}));
        assert_eq!(task.ref_count(), 1);

        let clone = task.clone();
        assert_eq!(task.ref_count(), 2);
        assert_eq!(task.as_ptr(), clone.as_ptr());

        drop(clone);
        assert_eq!(task.ref_count(), 1);
        drop(task);
    }

    #[test]
    fn bootstrap_task_is_running_and_stackless() {
        let main = Task::new_bootstrap();
        assert_eq!(main.state(), State::Running);
        assert!(main.is_bootstrap());
    }

    #[test]
    fn spawned_task_is_new() {
        let task = Task::new("fresh".to_owned(), Box::new(|| {}));
        assert_eq!(task.state(), State::New);
        assert!(!task.is_bootstrap());
        assert_eq!(task.name(), "fresh");
    }
}
