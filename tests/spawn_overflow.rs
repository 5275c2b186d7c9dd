//! A burst of spawns overflows the local ring into the shared ring and the
//! global queue, tier by tier.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::util::SubscriberInitExt;

#[test]
fn spawn_overflow_fills_tiers() {
    let _trace = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_thread_names(true)
        .set_default();

    let ran = Arc::new(AtomicUsize::new(0));
    let handles: Vec<_> = (0..20)
        .map(|i| {
            let ran = Arc::clone(&ran);
            strand::spawn(format!("task-{i}"), move || {
                ran.fetch_add(1, Ordering::SeqCst);
            })
        })
        .collect();

    // Nothing has yielded yet: the first 4 spawns sit in the local ring, the
    // next 4 in the shared ring, the remaining 12 in the global queue.
    let stats = strand::stats();
    assert_eq!(stats.machines, 1);
    assert_eq!(stats.local, 4);
    assert_eq!(stats.shared, 4);
    assert_eq!(stats.injector, 12);

    for handle in &handles {
        handle.join();
    }
    assert_eq!(ran.load(Ordering::SeqCst), 20);
    assert_eq!(strand::stats().injector, 0);
}
