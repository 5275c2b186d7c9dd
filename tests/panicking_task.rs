//! A panicking task completes like any other and does not take the
//! scheduler down with it.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::util::SubscriberInitExt;

#[test]
fn panicking_task_completes() {
    let _trace = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_thread_names(true)
        .set_default();

    let panicker = strand::spawn("panicker", || panic!("boom"));
    panicker.join();
    assert!(panicker.is_finished());

    // The machine keeps scheduling afterwards.
    let after = strand::spawn("after", || {});
    after.join();
    assert!(after.is_finished());
}
