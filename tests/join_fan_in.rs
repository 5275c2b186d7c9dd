//! Six tasks join the same target; all of them wake only after it completed.

use std::sync::{Arc, Mutex};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::util::SubscriberInitExt;

#[test]
fn fan_in_join() {
    let _trace = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_thread_names(true)
        .set_default();

    let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

    let target = strand::spawn("target", {
        let log = Arc::clone(&log);
        move || {
            for i in 0..3 {
                log.lock().unwrap().push(format!("target progress {i}"));
                strand::yield_now();
            }
            log.lock().unwrap().push("target done".to_owned());
        }
    });

    let waiters: Vec<_> = (0..6)
        .map(|i| {
            let target = target.clone();
            let log = Arc::clone(&log);
            strand::spawn(format!("waiter-{i}"), move || {
                target.join();
                log.lock().unwrap().push(format!("waiter {i} woke"));
            })
        })
        .collect();

    for waiter in &waiters {
        waiter.join();
    }

    let log = log.lock().unwrap();
    let done = log
        .iter()
        .position(|entry| entry == "target done")
        .expect("target never completed");
    for i in 0..6 {
        let woke = log
            .iter()
            .position(|entry| *entry == format!("waiter {i} woke"))
            .unwrap_or_else(|| panic!("waiter {i} never woke"));
        assert!(woke > done, "waiter {i} woke before the target completed");
    }
}
