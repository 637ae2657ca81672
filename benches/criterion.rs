// Copyright 2024-2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
#[cfg(feature = "rayon")]
use ::paraloop::TaskArena;
use ::paraloop::ThreadTeam;
use std::mem::size_of;

const NUM_THREADS: &[usize] = &[1, 2, 4, 8];
const LENGTHS: &[usize] = &[10_000, 100_000, 1_000_000, 10_000_000];
const UNEVEN_LENGTHS: &[usize] = &[1_000, 10_000];

fn sum(c: &mut Criterion) {
    let mut group = c.benchmark_group("sum");
    for len in LENGTHS {
        group.throughput(Throughput::Bytes((len * size_of::<u64>()) as u64));
        group.bench_with_input(BenchmarkId::new("serial", len), len, serial::sum);
        for &num_threads in NUM_THREADS {
            group.bench_with_input(
                BenchmarkId::new(format!("rayon@{num_threads}"), len),
                len,
                |bencher, len| rayon::sum(bencher, num_threads, len),
            );
            group.bench_with_input(
                BenchmarkId::new(format!("paraloop_team@{num_threads}"), len),
                len,
                |bencher, len| paraloop::sum::<ThreadTeam>(bencher, num_threads, len),
            );
            #[cfg(feature = "rayon")]
            group.bench_with_input(
                BenchmarkId::new(format!("paraloop_arena@{num_threads}"), len),
                len,
                |bencher, len| paraloop::sum::<TaskArena>(bencher, num_threads, len),
            );
        }
    }
    group.finish();
}

fn uneven(c: &mut Criterion) {
    let mut group = c.benchmark_group("uneven");
    for len in UNEVEN_LENGTHS {
        group.throughput(Throughput::Elements(*len as u64));
        group.bench_with_input(BenchmarkId::new("serial", len), len, serial::uneven);
        for &num_threads in NUM_THREADS {
            group.bench_with_input(
                BenchmarkId::new(format!("rayon@{num_threads}"), len),
                len,
                |bencher, len| rayon::uneven(bencher, num_threads, len),
            );
            group.bench_with_input(
                BenchmarkId::new(format!("paraloop_team@{num_threads}"), len),
                len,
                |bencher, len| paraloop::uneven::<ThreadTeam>(bencher, num_threads, len),
            );
            #[cfg(feature = "rayon")]
            group.bench_with_input(
                BenchmarkId::new(format!("paraloop_arena@{num_threads}"), len),
                len,
                |bencher, len| paraloop::uneven::<TaskArena>(bencher, num_threads, len),
            );
        }
    }
    group.finish();
}

/// Work whose cost grows with the index, so that a static split of the range
/// leaves the first threads idle.
fn spin(index: u64) -> u64 {
    (0..index).fold(index, |acc, i| criterion::black_box(acc.rotate_left(5) ^ i))
}

/// Baseline benchmarks using serial iterators (without any multi-threading
/// involved).
mod serial {
    use super::spin;
    use criterion::{black_box, Bencher};

    pub fn sum(bencher: &mut Bencher, len: &usize) {
        let input = (0..*len as u64).collect::<Vec<u64>>();
        let input_slice = input.as_slice();
        bencher.iter(|| black_box(input_slice).iter().sum::<u64>());
    }

    pub fn uneven(bencher: &mut Bencher, len: &usize) {
        bencher.iter(|| {
            (0..black_box(*len as u64))
                .map(spin)
                .fold(0, u64::wrapping_add)
        });
    }
}

/// Benchmarks using Rayon.
mod rayon {
    use super::spin;
    use criterion::{black_box, Bencher};
    use rayon::iter::{IntoParallelIterator, IntoParallelRefIterator, ParallelIterator};

    pub fn sum(bencher: &mut Bencher, num_threads: usize, len: &usize) {
        let input = (0..*len as u64).collect::<Vec<u64>>();
        let input_slice = input.as_slice();
        let thread_pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .build()
            .unwrap();
        thread_pool.install(|| bencher.iter(|| black_box(input_slice).par_iter().sum::<u64>()));
    }

    pub fn uneven(bencher: &mut Bencher, num_threads: usize, len: &usize) {
        let thread_pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .build()
            .unwrap();
        thread_pool.install(|| {
            bencher.iter(|| {
                (0..black_box(*len as u64))
                    .into_par_iter()
                    .map(spin)
                    .reduce(|| 0, u64::wrapping_add)
            })
        });
    }
}

/// Benchmarks using Paraloop backends.
mod paraloop {
    use super::spin;
    use criterion::{black_box, Bencher};
    use paraloop::{Backend, Index};
    use std::sync::atomic::{AtomicU64, Ordering};

    fn backend<B: Backend>(num_threads: usize) -> B {
        let backend = B::new();
        backend.initialize_with(num_threads, None);
        backend
    }

    pub fn sum<B: Backend>(bencher: &mut Bencher, num_threads: usize, len: &usize) {
        let input = (0..*len as u64).collect::<Vec<u64>>();
        let input_slice = input.as_slice();
        let backend = backend::<B>(num_threads);

        bencher.iter(|| {
            let sum = AtomicU64::new(0);
            backend.parallel_for(
                0,
                *len as Index,
                0,
                &|from: Index, grain: Index, last: Index| {
                    let end = (from + grain).min(last);
                    let partial: u64 = black_box(&input_slice[from as usize..end as usize])
                        .iter()
                        .sum();
                    sum.fetch_add(partial, Ordering::Relaxed);
                },
                false,
            );
            sum.into_inner()
        });
    }

    pub fn uneven<B: Backend>(bencher: &mut Bencher, num_threads: usize, len: &usize) {
        let backend = backend::<B>(num_threads);

        bencher.iter(|| {
            let total = AtomicU64::new(0);
            backend.parallel_for(
                0,
                black_box(*len as Index),
                0,
                &|from: Index, grain: Index, last: Index| {
                    let end = (from + grain).min(last);
                    let partial = (from as u64..end as u64)
                        .map(spin)
                        .fold(0, u64::wrapping_add);
                    total.fetch_add(partial, Ordering::Relaxed);
                },
                false,
            );
            total.into_inner()
        });
    }
}

criterion_group!(benches, sum, uneven);
criterion_main!(benches);
