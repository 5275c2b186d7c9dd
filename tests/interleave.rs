//! Two yielding tasks share a single machine and interleave.

use std::sync::{Arc, Mutex};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::util::SubscriberInitExt;

#[test]
fn yielders_interleave() {
    let _trace = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_thread_names(true)
        .set_default();

    let log = Arc::new(Mutex::new(Vec::new()));
    let spawn_yielder = |letter: char| {
        let log = Arc::clone(&log);
        strand::spawn(letter.to_string(), move || {
            for _ in 0..10 {
                log.lock().unwrap().push(letter);
                strand::yield_now();
            }
        })
    };

    let a = spawn_yielder('a');
    let b = spawn_yielder('b');

    a.join();
    b.join();
    assert!(a.is_finished());
    assert!(b.is_finished());

    // Dispatch order within a ring is randomized, so the exact interleaving
    // varies; both tasks must have made all their steps though.
    let log = log.lock().unwrap();
    assert_eq!(log.len(), 20);
    assert_eq!(log.iter().filter(|&&c| c == 'a').count(), 10);
    assert_eq!(log.iter().filter(|&&c| c == 'b').count(), 10);
}
