use appearance_core::{Appearance, ClientAppearanceCache, ServerAppearanceRegistry};
use appearance_proto::{AppearanceMessage, ResourceId};
use criterion::{criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};

fn crowd(distinct: usize) -> Vec<Appearance> {
    (0..distinct)
        .map(|i| {
            Appearance::with_icon(ResourceId(i as u32 % 7), format!("state_{i}"))
                .with_overlay(Appearance::with_icon(ResourceId(100), "shadow"))
        })
        .collect()
}

fn bench_intern(c: &mut Criterion) {
    let mut group = c.benchmark_group("intern");

    for distinct in [1usize, 16, 256] {
        let appearances = crowd(distinct);
        group.bench_with_input(
            BenchmarkId::new("dedup_1024_sprites", distinct),
            &appearances,
            |b, appearances| {
                b.iter_batched(
                    ServerAppearanceRegistry::with_default_limits,
                    |(registry, _queue)| {
                        let held: Vec<_> = appearances
                            .iter()
                            .cycle()
                            .take(1024)
                            .map(|appearance| registry.intern(appearance))
                            .collect();
                        held
                    },
                    BatchSize::SmallInput,
                )
            },
        );
    }

    group.finish();
}

fn bench_client_apply(c: &mut Criterion) {
    let mut group = c.benchmark_group("client_apply");

    for distinct in [16usize, 256] {
        let (registry, queue) = ServerAppearanceRegistry::with_default_limits();
        let held: Vec<_> = crowd(distinct)
            .iter()
            .filter_map(|appearance| registry.intern(appearance).ok())
            .collect();
        let snapshot = registry.snapshot_all();
        drop(queue);

        group.bench_with_input(BenchmarkId::new("snapshot", distinct), &snapshot, |b, snapshot| {
            b.iter_batched(
                || (ClientAppearanceCache::default(), snapshot.clone()),
                |(mut cache, snapshot)| {
                    cache.apply_message(AppearanceMessage::Snapshot(snapshot));
                    cache
                },
                BatchSize::SmallInput,
            )
        });
        drop(held);
    }

    group.finish();
}

criterion_group!(intern_benches, bench_intern, bench_client_apply);
criterion_main!(intern_benches);
