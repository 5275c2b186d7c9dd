// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The process-wide runtime.
//!
//! There is exactly one [`Runtime`] per process, initialized lazily by the
//! first thread that touches it. That thread becomes machine 0 and its
//! thread of control becomes the bootstrap ("main") task; subsequent
//! machines are added with [`spawn_machine`]. There is deliberately no way
//! to run several independent runtimes in one process.

use crate::error::MachineError;
use crate::machine::Machine;
use crate::processor::Processor;
use crate::queue::{Graveyard, Injector};
use crate::task::{JoinHandle, Task, TaskRef};
use core::num::NonZeroUsize;
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::{Once, OnceLock};

/// Hard upper bound on the number of machine/processor seats.
pub const MAX_MACHINES: usize = 64;

pub(crate) struct Runtime {
    injector: Injector,
    graveyard: Graveyard,
    /// The bootstrap task, whenever it is runnable but not running.
    ///
    /// The bootstrap task runs on the kernel stack of the thread that
    /// initialized the runtime, and control must eventually return to that
    /// thread (its stack hosts `main`, or a test harness). It is therefore
    /// pinned to machine 0: wakes and yields of the bootstrap task land
    /// here, where only machine 0 looks, instead of in a stealable ring.
    bootstrap_seat: spin::Mutex<Option<TaskRef>>,
    /// Serializes seat registration (bootstrap and [`spawn_machine`]).
    registration: spin::Mutex<()>,
    /// Dense seat array; `processors[..seats]` are non-null and immutable
    /// once published.
    processors: [AtomicPtr<Processor>; MAX_MACHINES],
    seats: AtomicUsize,
    max_machines: AtomicUsize,
    bootstrapped: Once,
}

static RUNTIME: OnceLock<Runtime> = OnceLock::new();

/// The runtime singleton, bootstrapping it on first use.
pub(crate) fn current() -> &'static Runtime {
    let runtime = RUNTIME.get_or_init(Runtime::new);
    runtime.bootstrapped.call_once(|| runtime.bootstrap());
    runtime
}

impl Runtime {
    fn new() -> Self {
        Self {
            injector: Injector::new(),
            graveyard: Graveyard::new(),
            bootstrap_seat: spin::Mutex::new(None),
            registration: spin::Mutex::new(()),
            processors: [const { AtomicPtr::new(core::ptr::null_mut()) }; MAX_MACHINES],
            seats: AtomicUsize::new(0),
            max_machines: AtomicUsize::new(default_max_machines()),
            bootstrapped: Once::new(),
        }
    }

    /// Creates the main seats on the calling thread: processor 0, machine 0
    /// and the bootstrap task, already running in machine 0's current slot.
    fn bootstrap(&'static self) {
        let _guard = self.registration.lock();

        let processor: &'static Processor = Box::leak(Box::new(Processor::new(0)));
        let machine: &'static Machine = Box::leak(Box::new(Machine::new_bootstrap(processor)));
        self.install_seat(0, processor);
        self.publish_seats(1);

        machine.bind();
        processor.set_current(Task::new_bootstrap());
        tracing::debug!(max_machines = self.max_machines.load(Ordering::Relaxed), "runtime bootstrapped");
    }

    pub(crate) fn injector(&self) -> &Injector {
        &self.injector
    }

    pub(crate) fn graveyard(&self) -> &Graveyard {
        &self.graveyard
    }

    pub(crate) fn offer_bootstrap(&self, task: TaskRef) {
        debug_assert!(task.is_bootstrap());
        let previous = self.bootstrap_seat.lock().replace(task);
        debug_assert!(previous.is_none(), "bootstrap task runnable twice");
    }

    pub(crate) fn take_bootstrap(&self) -> Option<TaskRef> {
        self.bootstrap_seat.lock().take()
    }

    pub(crate) fn processor_count(&self) -> usize {
        self.seats.load(Ordering::Acquire)
    }

    pub(crate) fn processor(&self, index: usize) -> Option<&'static Processor> {
        let ptr = self.processors[index].load(Ordering::Acquire);
        if ptr.is_null() {
            None
        } else {
            // Safety: seat pointers come out of `Box::leak` and are never
            // freed once their seat count has been published.
            Some(unsafe { &*ptr })
        }
    }

    fn install_seat(&self, index: usize, processor: &'static Processor) {
        self.processors[index].store(core::ptr::from_ref(processor).cast_mut(), Ordering::Release);
    }

    fn publish_seats(&self, count: usize) {
        self.seats.store(count, Ordering::Release);
    }

    fn clear_seat(&self, index: usize) {
        self.processors[index].store(core::ptr::null_mut(), Ordering::Release);
    }
}

fn default_max_machines() -> usize {
    std::thread::available_parallelism()
        .map_or(1, NonZeroUsize::get)
        .min(MAX_MACHINES)
}

/// Spawns a new task and returns a handle to join it.
///
/// The task is inserted into the calling processor's local ring, spilling
/// into the shared ring and then the global queue when full; it runs no
/// earlier than the next scheduling point on some machine. Spawning never
/// blocks. When the calling thread is not a machine, the task goes straight
/// to the global queue.
///
/// Allocation failure is fatal: the runtime panics rather than limping on
/// without a stack.
pub fn spawn<F>(name: impl Into<String>, f: F) -> JoinHandle
where
    F: FnOnce() + Send + 'static,
{
    let runtime = current();
    // Reclaim whatever earlier tasks are done with; spawn time is the one
    // point where every program using the runtime pays the sweep.
    runtime.graveyard.sweep();

    let task = Task::new(name.into(), Box::new(f));
    let handle = JoinHandle::new(task.clone());
    tracing::trace!(task = task.id().as_u64(), name = task.name(), "spawned");

    match Machine::current() {
        Some(machine) => machine.processor().enqueue(task),
        None => runtime.injector.push(task),
    }

    handle
}

/// Adds a machine: a new processor serviced by a new, detached kernel
/// thread, which first runs `f` as an ordinary task and then keeps
/// scheduling until process exit.
///
/// # Errors
///
/// [`MachineError::AtCapacity`] when the configured cap is reached, and
/// [`MachineError::Thread`] when the OS thread cannot be created (the
/// pre-registered seat is unwound before returning).
pub fn spawn_machine<F>(f: F) -> Result<(), MachineError>
where
    F: FnOnce() + Send + 'static,
{
    let runtime = current();
    let _guard = runtime.registration.lock();

    let id = runtime.seats.load(Ordering::Acquire);
    let max = runtime.max_machines.load(Ordering::Relaxed);
    if id >= max || id >= MAX_MACHINES {
        return Err(MachineError::AtCapacity { max });
    }

    let processor: &'static Processor = Box::leak(Box::new(Processor::new(id)));
    let machine: &'static Machine = Box::leak(Box::new(Machine::new_worker(id, processor)));
    runtime.install_seat(id, processor);

    let result = std::thread::Builder::new()
        .name(format!("machine-{id}"))
        .spawn(move || {
            machine.bind();
            machine
                .processor()
                .enqueue(Task::new(format!("machine-{id}-start"), Box::new(f)));
            machine.run();
        });

    match result {
        Ok(join) => {
            // Machines are detached; they live until process exit.
            drop(join);
            runtime.publish_seats(id + 1);
            tracing::debug!(machine = id, "machine spawned");
            Ok(())
        }
        Err(err) => {
            runtime.clear_seat(id);
            // Safety: the seat count was never published and the thread
            // closure was dropped, so the two leaked boxes are unreachable
            // again and can be reclaimed.
            unsafe {
                drop(Box::from_raw(core::ptr::from_ref(machine).cast_mut()));
                drop(Box::from_raw(core::ptr::from_ref(processor).cast_mut()));
            }
            Err(MachineError::Thread(err))
        }
    }
}

/// Sets the cap on the number of machines. Values outside `1..=64` are
/// silently ignored. The cap is advisory for machines that already exist.
pub fn set_max_machines(max: usize) {
    if (1..=MAX_MACHINES).contains(&max) {
        current().max_machines.store(max, Ordering::Relaxed);
    }
}

/// The current cap on the number of machines. Defaults to the number of
/// logical CPUs.
pub fn max_machines() -> usize {
    current().max_machines.load(Ordering::Relaxed)
}

/// How many machines (and processors) exist right now, the bootstrap seat
/// included.
pub fn machine_count() -> usize {
    current().processor_count()
}

/// A point-in-time snapshot of queue depths, for diagnostics and tests.
///
/// `local` and `shared` describe the calling machine's processor and are
/// zero on threads that are not machines.
#[derive(Debug, Clone, Copy)]
pub struct Stats {
    pub machines: usize,
    pub local: usize,
    pub shared: usize,
    pub injector: usize,
    pub graveyard: usize,
}

/// Takes a [`Stats`] snapshot.
pub fn stats() -> Stats {
    let runtime = current();
    let (local, shared) =
        Machine::current().map_or((0, 0), |machine| machine.processor().queue_depths());
    Stats {
        machines: runtime.processor_count(),
        local,
        shared,
        injector: runtime.injector.len(),
        graveyard: runtime.graveyard.len(),
    }
}
