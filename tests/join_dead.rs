//! Joining an already-dead task returns immediately, and dead tasks are
//! reclaimed lazily once their handles are gone.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::util::SubscriberInitExt;

#[test]
fn join_already_dead() {
    let _trace = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_thread_names(true)
        .set_default();

    let ran = Arc::new(AtomicBool::new(false));
    let task = strand::spawn("quick", {
        let ran = Arc::clone(&ran);
        move || ran.store(true, Ordering::SeqCst)
    });

    // One yield lets the freshly spawned task run to completion.
    strand::yield_now();
    assert!(ran.load(Ordering::SeqCst));
    assert!(task.is_finished());

    // Joining a dead task is immediate, any number of times.
    task.join();
    task.join();

    // The dead task is parked in the graveyard while its handle lives...
    assert_eq!(strand::stats().graveyard, 1);
    drop(task);

    // ...and the next spawn sweeps it. The sweeper then takes its place
    // until its own handle is dropped.
    let sweeper = strand::spawn("sweeper", || {});
    sweeper.join();
    assert_eq!(strand::stats().graveyard, 1);
}
