//! Criterion benchmarks for the postings codecs.
//!
//! Covers building and encoding postings, sequential iteration, skip-table
//! seeks and the append used by merges.

use std::hint::black_box;

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tessera::postings::{IteratorFeatures, Occurrence, Postings, PostingsType};

/// Sorted document IDs with random gaps, each with a frequency and positions.
fn generate_documents(count: usize) -> Vec<(u32, Vec<u32>)> {
    let mut rng = StdRng::seed_from_u64(1234);
    let mut id = 0;
    (0..count)
        .map(|_| {
            id += rng.random_range(1..16);
            let mut position = 0;
            let positions = (0..rng.random_range(1..6))
                .map(|_| {
                    position += rng.random_range(1..40);
                    position
                })
                .collect();
            (id, positions)
        })
        .collect()
}

fn build(postings_type: PostingsType, docs: &[(u32, Vec<u32>)]) -> Postings {
    let mut postings = Postings::new(postings_type, 64);
    for (id, positions) in docs {
        for &position in positions {
            postings.add(&Occurrence::new(*id, 1).at(position));
        }
    }
    postings.finish();
    postings
}

const TYPES: [PostingsType; 3] = [PostingsType::Id, PostingsType::IdFreq, PostingsType::Positions];

fn bench_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("postings_build");
    let docs = generate_documents(10_000);
    group.throughput(Throughput::Elements(docs.len() as u64));

    for postings_type in TYPES {
        group.bench_with_input(
            BenchmarkId::new("build_and_encode", format!("{postings_type:?}")),
            &docs,
            |b, docs| {
                b.iter(|| {
                    let mut postings = build(postings_type, black_box(docs));
                    black_box(postings.encode().unwrap())
                })
            },
        );
    }

    group.finish();
}

fn bench_iterate(c: &mut Criterion) {
    let mut group = c.benchmark_group("postings_iterate");
    let docs = generate_documents(10_000);
    group.throughput(Throughput::Elements(docs.len() as u64));

    for postings_type in TYPES {
        let postings = build(postings_type, &docs);
        let features = if postings_type.has_positions() {
            IteratorFeatures::default().with_positions()
        } else {
            IteratorFeatures::default()
        };
        group.bench_function(BenchmarkId::new("next", format!("{postings_type:?}")), |b| {
            b.iter(|| {
                let mut it = postings.iterator(&features).unwrap();
                let mut sum = 0u64;
                while it.next() {
                    sum += it.freq() as u64 + it.positions().len() as u64;
                }
                black_box(sum)
            })
        });
    }

    group.finish();
}

fn bench_find_id(c: &mut Criterion) {
    let mut group = c.benchmark_group("postings_find_id");
    let docs = generate_documents(100_000);
    let postings = build(PostingsType::IdFreq, &docs);
    let targets: Vec<u32> = docs.iter().step_by(97).map(|(id, _)| id + 1).collect();
    group.throughput(Throughput::Elements(targets.len() as u64));

    group.bench_function("increasing_targets", |b| {
        b.iter(|| {
            let mut it = postings.iterator(&IteratorFeatures::default()).unwrap();
            let mut found = 0;
            for &target in &targets {
                if it.find_id(black_box(target)) {
                    found += 1;
                }
            }
            black_box(found)
        })
    });

    group.finish();
}

fn bench_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("postings_append");
    let docs = generate_documents(10_000);
    let source = build(PostingsType::Positions, &docs);
    let start = docs.last().map(|(id, _)| id + 1).unwrap_or(1);

    group.bench_function("append_positions", |b| {
        b.iter_with_setup(
            || source.clone(),
            |mut target| {
                target.append(black_box(&source), start).unwrap();
                black_box(target)
            },
        )
    });

    group.finish();
}

criterion_group!(benches, bench_build, bench_iterate, bench_find_id, bench_append);

criterion_main!(benches);
