//! Event queue throughput benchmark.
//!
//! Measures producer-side push cost for both queue disciplines and the
//! end-to-end push→dispatch cycle with a registered handler.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;

use axon_core::{Behaviour, EventQueue, Properties, QueueConfig, ServiceId};

#[derive(Debug)]
struct BenchEvent {
    value: u64,
}

fn bench_push(c: &mut Criterion) {
    let batch_sizes: &[u64] = &[16, 256, 4096];

    let mut group = c.benchmark_group("push");
    for &batch in batch_sizes {
        group.bench_with_input(BenchmarkId::new("heap", batch), &batch, |b, &batch| {
            b.iter(|| {
                let queue = EventQueue::new(QueueConfig::default());
                for value in 0..batch {
                    queue.push_prioritised_event(
                        ServiceId::FRAMEWORK,
                        value % 7,
                        black_box(BenchEvent { value }),
                    );
                }
                queue
            });
        });
        group.bench_with_input(BenchmarkId::new("ordered", batch), &batch, |b, &batch| {
            b.iter(|| {
                let queue = EventQueue::new_ordered(QueueConfig::default());
                for value in 0..batch {
                    queue.push_prioritised_event(
                        ServiceId::FRAMEWORK,
                        value % 7,
                        black_box(BenchEvent { value }),
                    );
                }
                queue
            });
        });
    }
    group.finish();
}

fn bench_dispatch(c: &mut Criterion) {
    let batch_sizes: &[u64] = &[16, 256, 4096];

    let mut group = c.benchmark_group("push_and_dispatch");
    for &batch in batch_sizes {
        group.bench_with_input(BenchmarkId::from_parameter(batch), &batch, |b, &batch| {
            b.iter(|| {
                let queue = EventQueue::new(QueueConfig::default());
                let dm = queue.create_manager();
                let _registration = dm.register_event_handler::<BenchEvent, _, _>(
                    ServiceId::FRAMEWORK,
                    None,
                    |event: Arc<BenchEvent>| async move {
                        black_box(event.value);
                        Behaviour::Continue
                    },
                );
                for value in 0..batch {
                    queue.push_event(ServiceId::FRAMEWORK, BenchEvent { value });
                }
                dm.run_until_idle()
            });
        });
    }
    group.finish();
}

fn bench_service_lifecycle(c: &mut Criterion) {
    use axon_core::dependency::DependencyRegister;
    use axon_core::{AdvancedService, ServiceContext};

    struct Noop;

    impl AdvancedService for Noop {
        fn construct(
            _reg: &mut DependencyRegister<Self>,
            _props: &Properties,
            _ctx: ServiceContext,
        ) -> Self {
            Noop
        }
    }

    c.bench_function("create_start_stop_service", |b| {
        b.iter(|| {
            let queue = EventQueue::new(QueueConfig::default());
            let dm = queue.create_manager();
            let proxy = dm
                .create_service_manager::<Noop>(Properties::new())
                .build()
                .unwrap();
            dm.run_until_idle();
            queue.push_stop_service(proxy.id(), true);
            dm.run_until_idle();
            dm.service_count()
        });
    });
}

criterion_group!(benches, bench_push, bench_dispatch, bench_service_lifecycle);
criterion_main!(benches);
