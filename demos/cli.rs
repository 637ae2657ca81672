// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! CLI tool to run parallel loops on the available backends.

use clap::{Parser, ValueEnum};
use paraloop::{BackendKind, Index, SmpTools};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha12Rng;
use std::hint::black_box;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let mut tools = match cli.backend {
        Some(backend) => {
            let kind = backend.kind();
            match SmpTools::with_backend(kind) {
                Some(tools) => tools,
                None => {
                    eprintln!(
                        "The {} backend isn't compiled in, enable the corresponding feature",
                        kind.name()
                    );
                    std::process::exit(1);
                }
            }
        }
        None => SmpTools::new(),
    };
    tools.initialize(cli.num_threads);
    if let Some(nested) = cli.nested {
        tools.set_nested_parallelism(nested);
    }
    println!(
        "backend = {}, threads <= {}, nested = {}",
        tools.backend().name(),
        tools.estimated_thread_count(),
        tools.nested_parallelism()
    );

    let start = Instant::now();
    match cli.scenario {
        Scenario::Sum => {
            let input = (0..cli.input_size).collect::<Vec<u64>>();
            let sum = AtomicU64::new(0);
            tools.for_each_range(0, cli.input_size as Index, cli.grain, |range| {
                let slice = &input[range.start as usize..range.end as usize];
                sum.fetch_add(black_box(slice).iter().sum::<u64>(), Ordering::Relaxed);
            });
            println!("sum = {}", sum.into_inner());
        }
        Scenario::Add => {
            let left = (0..cli.input_size).collect::<Vec<u64>>();
            let right = (0..cli.input_size).collect::<Vec<u64>>();
            let output = (0..cli.input_size)
                .map(|_| AtomicU64::new(0))
                .collect::<Vec<_>>();
            tools.for_each_range(0, cli.input_size as Index, cli.grain, |range| {
                for i in range.start as usize..range.end as usize {
                    output[i].store(left[i] + right[i], Ordering::Relaxed);
                }
            });
            println!("added {} elements", black_box(output).len());
        }
        Scenario::Heterogeneous => {
            let costs = random_costs(cli.input_size as usize, cli.max_cost);
            let done = AtomicU64::new(0);
            let checksum = AtomicU64::new(0);
            tools.for_each_range(0, cli.input_size as Index, cli.grain, |range| {
                let mut local = 0u64;
                for i in range.start as usize..range.end as usize {
                    local = local.wrapping_add(spin(costs[i]));
                }
                checksum.fetch_add(local, Ordering::Relaxed);

                let done = done.fetch_add(range.count() as u64, Ordering::Relaxed);
                // Only the thread that started the loop reports progress.
                if tools.is_calling_thread() {
                    eprint!("\rprogress: {done}/{}", cli.input_size);
                }
            });
            eprintln!();
            println!("checksum = {}", checksum.into_inner());
        }
        Scenario::Nested => {
            let rows = (cli.input_size as f64).sqrt() as Index;
            let sum = AtomicU64::new(0);
            tools.for_each_range(0, rows, 1, |outer| {
                for row in outer {
                    tools.for_each_range(0, rows, cli.grain, |inner| {
                        let partial: u64 = inner.map(|col| (row * rows + col) as u64).sum();
                        sum.fetch_add(partial, Ordering::Relaxed);
                    });
                }
            });
            println!("sum of {rows}x{rows} = {}", sum.into_inner());
        }
    }
    println!("elapsed = {:?}", start.elapsed());
}

/// Draws a random cost for each item. The costs follow a uniform
/// distribution, but are fixed by a constant seed for reproducibility.
fn random_costs(input_size: usize, max_cost: u64) -> Vec<u64> {
    let mut rng = ChaCha12Rng::seed_from_u64(42);
    (0..input_size)
        .map(|_| rng.random_range(0..=max_cost))
        .collect()
}

/// Burns a number of iterations proportional to the cost.
fn spin(cost: u64) -> u64 {
    (0..cost).fold(cost, |acc, i| black_box(acc.rotate_left(5) ^ i))
}

/// CLI tool to run parallel loops on the available backends.
#[derive(Parser, Debug, PartialEq, Eq)]
#[command(version)]
struct Cli {
    /// Backend to use. Default to the PARALOOP_BACKEND variable, or the
    /// default backend.
    #[arg(long, value_enum)]
    backend: Option<BackendCli>,

    /// Maximum number of threads, 0 for the default. The PARALOOP_MAX_THREADS
    /// variable takes precedence.
    #[arg(long, default_value_t = 0)]
    num_threads: usize,

    /// Whether loops started from inside another loop run in parallel.
    /// Default to the backend's policy.
    #[arg(long)]
    nested: Option<bool>,

    /// Scenario to run in parallel.
    #[arg(long, value_enum)]
    scenario: Scenario,

    /// Number of items in the input.
    #[arg(long, default_value_t = 1_000_000)]
    input_size: u64,

    /// Number of items per chunk, 0 to compute it automatically.
    #[arg(long, default_value_t = 0)]
    grain: Index,

    /// Maximum cost of an item. Used only for the heterogeneous scenario.
    #[arg(long, default_value_t = 1_000)]
    max_cost: u64,
}

/// Backend to run loops on.
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum BackendCli {
    /// Every chunk runs on the calling thread.
    Sequential,
    /// A persistent team of threads.
    Team,
    /// A work-stealing arena (requires the `rayon` feature).
    Arena,
}

impl BackendCli {
    fn kind(self) -> BackendKind {
        match self {
            BackendCli::Sequential => BackendKind::Sequential,
            BackendCli::Team => BackendKind::ThreadTeam,
            BackendCli::Arena => BackendKind::TaskArena,
        }
    }
}

/// Scenario to run.
#[derive(ValueEnum, Clone, Debug, PartialEq, Eq)]
enum Scenario {
    /// Sum a slice of numbers.
    Sum,
    /// Add two slices element-wise.
    Add,
    /// Process items of random cost, reporting progress.
    Heterogeneous,
    /// Sum a square of numbers with nested loops.
    Nested,
}
