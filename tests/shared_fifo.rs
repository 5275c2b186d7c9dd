//! Producer/consumer over a shared bounded FIFO, coordinated purely through
//! cooperative yields.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::util::SubscriberInitExt;

const PRODUCERS: usize = 2;
const CONSUMERS: usize = 2;
const ITEMS_PER_PRODUCER: usize = 100;
const QUEUE_CAP: usize = 8;

#[test]
fn producers_and_consumers() {
    let _trace = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_thread_names(true)
        .set_default();

    let queue: Arc<Mutex<VecDeque<usize>>> = Arc::new(Mutex::new(VecDeque::new()));
    let next = Arc::new(AtomicUsize::new(0));
    let running = Arc::new(AtomicBool::new(true));
    let consumed: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|i| {
            let queue = Arc::clone(&queue);
            let next = Arc::clone(&next);
            strand::spawn(format!("producer-{i}"), move || {
                for _ in 0..ITEMS_PER_PRODUCER {
                    let value = next.fetch_add(1, Ordering::SeqCst);
                    loop {
                        let pushed = {
                            let mut queue = queue.lock().unwrap();
                            if queue.len() < QUEUE_CAP {
                                queue.push_back(value);
                                true
                            } else {
                                false
                            }
                        };
                        if pushed {
                            break;
                        }
                        strand::yield_now();
                    }
                }
            })
        })
        .collect();

    let consumers: Vec<_> = (0..CONSUMERS)
        .map(|i| {
            let queue = Arc::clone(&queue);
            let running = Arc::clone(&running);
            let consumed = Arc::clone(&consumed);
            strand::spawn(format!("consumer-{i}"), move || {
                loop {
                    let item = queue.lock().unwrap().pop_front();
                    match item {
                        Some(value) => consumed.lock().unwrap().push(value),
                        None if !running.load(Ordering::SeqCst) => break,
                        None => strand::yield_now(),
                    }
                }
            })
        })
        .collect();

    for producer in &producers {
        producer.join();
    }
    running.store(false, Ordering::SeqCst);
    for consumer in &consumers {
        consumer.join();
    }

    let mut consumed = consumed.lock().unwrap().clone();
    consumed.sort_unstable();
    let expected: Vec<usize> = (0..PRODUCERS * ITEMS_PER_PRODUCER).collect();
    assert_eq!(consumed, expected, "items were lost or duplicated");
}
