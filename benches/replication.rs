//! Replication benchmarks.
//!
//! Measures full tick processing at various entity and viewer counts.
//!
//! Run with: cargo bench --bench replication

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::Rng;
use uuid::Uuid;
use viewscope::core::ReplicationCore;
use viewscope::util::vec2::Vec2;
use viewscope::world::mem::MemWorld;
use viewscope::world::VisMask;
use viewscope::{NetworkId, ReplicationConfig, Tick, ViewerId};

const ARENA_HALF: f32 = 400.0;

/// World with `entities` scattered over one map and `viewers` attached to
/// random bodies among them.
fn build_scene(
    entities: usize,
    viewers: usize,
) -> (MemWorld, ReplicationCore, Vec<ViewerId>, Vec<NetworkId>) {
    let mut world = MemWorld::new();
    let mut core = ReplicationCore::new(ReplicationConfig::default()).unwrap();
    let mut rng = rand::thread_rng();

    let (map_net, _) = world.spawn_map();
    let mut ids = Vec::with_capacity(entities);
    for _ in 0..entities {
        let position = Vec2::new(
            rng.gen_range(-ARENA_HALF..ARENA_HALF),
            rng.gen_range(-ARENA_HALF..ARENA_HALF),
        );
        let id = world.spawn(map_net, VisMask::NONE, position);
        core.entity_spawned(&world, id);
        ids.push(id);
    }

    let mut viewer_ids = Vec::with_capacity(viewers);
    for _ in 0..viewers {
        let viewer = Uuid::new_v4();
        core.on_viewer_join(viewer);
        core.set_attached_entity(viewer, Some(ids[rng.gen_range(0..ids.len())]));
        viewer_ids.push(viewer);
    }

    (world, core, viewer_ids, ids)
}

/// Benchmark a full replication tick with a stable world: tree reuse and
/// delta computation dominate.
fn bench_steady_tick(c: &mut Criterion) {
    let mut group = c.benchmark_group("steady_tick");
    group.sample_size(50);

    for viewers in [16, 64, 256] {
        let (world, mut core, viewer_ids, _) = build_scene(4000, viewers);
        // Warm the tree cache and baseline every viewer.
        let output = core.process_tick(&world, Tick::new(1));
        for viewer in &viewer_ids {
            core.queue_ack(*viewer, output.deltas[0].to_tick);
        }
        let mut tick = 1u32;

        group.throughput(Throughput::Elements(viewers as u64));
        group.bench_with_input(BenchmarkId::new("viewers", viewers), &viewers, |b, _| {
            b.iter(|| {
                tick += 1;
                let output = core.process_tick(&world, Tick::new(tick));
                for delta in &output.deltas {
                    core.queue_ack(delta.viewer, delta.to_tick);
                }
                black_box(output.stats.viewers)
            })
        });
    }
    group.finish();
}

/// Benchmark ticks where a slice of entities moves every tick, forcing
/// tree rebuilds along their paths.
fn bench_churn_tick(c: &mut Criterion) {
    let mut group = c.benchmark_group("churn_tick");
    group.sample_size(30);

    for entities in [1000, 4000, 16000] {
        let (mut world, mut core, _, ids) = build_scene(entities, 64);
        core.process_tick(&world, Tick::new(1));
        let mut rng = rand::thread_rng();
        let mut tick = 1u32;

        group.throughput(Throughput::Elements(entities as u64));
        group.bench_with_input(BenchmarkId::new("entities", entities), &entities, |b, _| {
            b.iter(|| {
                tick += 1;
                // Move 5% of entities each tick.
                for _ in 0..entities / 20 {
                    let id = ids[rng.gen_range(0..ids.len())];
                    let position = Vec2::new(
                        rng.gen_range(-ARENA_HALF..ARENA_HALF),
                        rng.gen_range(-ARENA_HALF..ARENA_HALF),
                    );
                    world.set_position(id, position);
                    core.entity_moved(&world, id, false);
                }
                black_box(core.process_tick(&world, Tick::new(tick)).stats.jobs)
            })
        });
    }
    group.finish();
}

/// Benchmark the cost of joining viewers cold: first tick sends full state.
fn bench_cold_join(c: &mut Criterion) {
    let mut group = c.benchmark_group("cold_join");
    group.sample_size(30);

    for viewers in [16, 64] {
        group.throughput(Throughput::Elements(viewers as u64));
        group.bench_with_input(BenchmarkId::new("viewers", viewers), &viewers, |b, &count| {
            b.iter_with_setup(
                || build_scene(4000, count),
                |(world, mut core, _, _)| {
                    black_box(core.process_tick(&world, Tick::new(1)).stats.viewers)
                },
            )
        });
    }
    group.finish();
}

criterion_group!(benches, bench_steady_tick, bench_churn_tick, bench_cold_join);
criterion_main!(benches);
