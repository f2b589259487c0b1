use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use mergetree_core::{MergeTreeChunk, Operation, Replica, SequencedOp};

fn sequenced(seq: u64, client: &str, ref_seq: u64, op: Operation) -> SequencedOp {
    SequencedOp::new(seq, client, ref_seq, op)
}

/// Benchmark applying a single sequenced insert
fn bench_single_apply(c: &mut Criterion) {
    c.bench_function("mergetree_single_insert_apply", |b| {
        b.iter(|| {
            let mut replica = Replica::new("bench".to_string());
            replica
                .apply(&sequenced(1, "a", 0, Operation::insert_text(0, "a")))
                .unwrap();
            black_box(replica.visible_len());
        });
    });
}

/// Benchmark sequential typing applied through the sequenced stream
fn bench_sequential_typing(c: &mut Criterion) {
    let mut group = c.benchmark_group("mergetree_sequential_typing");

    for size in [100, 1000, 10000].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            b.iter(|| {
                let mut replica = Replica::new("bench".to_string());
                for i in 0..size {
                    replica
                        .apply(&sequenced(
                            (i + 1) as u64,
                            "a",
                            i as u64,
                            Operation::insert_text(i, "a"),
                        ))
                        .unwrap();
                }
                assert_eq!(replica.visible_len(), size);
            });
        });
    }

    group.finish();
}

/// Benchmark interleaved edits from two clients at stale reference points
fn bench_concurrent_interleave(c: &mut Criterion) {
    c.bench_function("mergetree_concurrent_interleave_1k", |b| {
        b.iter(|| {
            let mut replica = Replica::new("bench".to_string());
            let mut seq = 0u64;
            for i in 0..500usize {
                seq += 1;
                replica
                    .apply(&sequenced(seq, "a", seq - 1, Operation::insert_text(i, "a")))
                    .unwrap();
                // b is one sequence number behind a on every edit
                seq += 1;
                replica
                    .apply(&sequenced(seq, "b", seq - 2, Operation::insert_text(i, "b")))
                    .unwrap();
            }
            black_box(replica.visible_len());
        });
    });
}

/// Benchmark removal with tombstone accumulation and garbage collection
fn bench_remove_and_gc(c: &mut Criterion) {
    c.bench_function("mergetree_remove_and_gc_1k", |b| {
        b.iter_batched(
            || {
                let mut replica = Replica::new("bench".to_string());
                let text = "a".repeat(1000);
                replica
                    .apply(&sequenced(1, "a", 0, Operation::insert_text(0, text)))
                    .unwrap();
                replica
            },
            |mut replica| {
                let mut seq = 1u64;
                for _ in 0..500usize {
                    seq += 1;
                    replica
                        .apply(&sequenced(seq, "a", seq - 1, Operation::remove(0, 2)))
                        .unwrap();
                }
                replica.observe_ack("a".to_string(), seq);
                black_box(replica.collect_garbage());
            },
            criterion::BatchSize::SmallInput,
        );
    });
}

/// Benchmark chunk snapshot and reload
fn bench_chunk_round_trip(c: &mut Criterion) {
    let mut replica = Replica::new("bench".to_string());
    for i in 0..1000usize {
        replica
            .apply(&sequenced(
                (i + 1) as u64,
                "a",
                i as u64,
                Operation::insert_text(i, "a"),
            ))
            .unwrap();
    }
    let chunk = replica.snapshot();
    let json = chunk.encode().unwrap();

    c.bench_function("mergetree_chunk_snapshot_1k", |b| {
        b.iter(|| black_box(replica.snapshot()));
    });

    c.bench_function("mergetree_chunk_load_1k", |b| {
        b.iter(|| {
            let chunk = MergeTreeChunk::decode(&json).unwrap();
            black_box(Replica::from_chunk("fresh".to_string(), &chunk).unwrap());
        });
    });
}

/// Benchmark the optimistic local path with acknowledgment promotion
fn bench_optimistic_round_trip(c: &mut Criterion) {
    c.bench_function("mergetree_optimistic_1k_round_trips", |b| {
        b.iter(|| {
            let mut replica = Replica::new("author".to_string());
            for i in 0..1000usize {
                let ref_seq = replica.last_applied_seq();
                let wire = replica
                    .submit_local(Operation::insert_text(i, "a"))
                    .unwrap();
                replica
                    .apply(&sequenced((i + 1) as u64, "author", ref_seq, wire))
                    .unwrap();
            }
            assert_eq!(replica.visible_len(), 1000);
        });
    });
}

criterion_group!(
    benches,
    bench_single_apply,
    bench_sequential_typing,
    bench_concurrent_interleave,
    bench_remove_and_gc,
    bench_chunk_round_trip,
    bench_optimistic_round_trip,
);

criterion_main!(benches);
