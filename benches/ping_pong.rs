use criterion::{Criterion, criterion_group, criterion_main};

fn spawn_join(c: &mut Criterion) {
    c.bench_function("spawn_join", |b| {
        b.iter(|| strand::spawn("bench", || {}).join());
    });
}

fn yield_ping_pong(c: &mut Criterion) {
    c.bench_function("yield_ping_pong", |b| {
        b.iter(|| {
            let ping = strand::spawn("ping", || {
                for _ in 0..100 {
                    strand::yield_now();
                }
            });
            let pong = strand::spawn("pong", || {
                for _ in 0..100 {
                    strand::yield_now();
                }
            });
            ping.join();
            pong.join();
        });
    });
}

criterion_group!(benches, spawn_join, yield_ping_pong);
criterion_main!(benches);
