// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Chunked dispatch of an index range over the participants of a region.

use crate::backend::{ChunkExecutor, Index};
use crate::identity::{IdentityStack, RegionContext, RegionScope};
use crate::macros::log_debug;
#[cfg(feature = "log_parallelism")]
use crate::macros::{log_info, log_trace};
use crossbeam_utils::CachePadded;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Number of chunks to aim for per thread when the grain is computed
/// automatically, so that faster threads pick up work from slower ones.
const CHUNKS_PER_THREAD: i128 = 4;

/// Computes the grain used when the caller doesn't provide a positive one:
/// `max(1, (last - first) / (num_threads * 4))`.
pub(crate) fn auto_grain(first: Index, last: Index, num_threads: NonZeroUsize) -> Index {
    let len = i128::from(last) - i128::from(first);
    let num_threads = i128::try_from(num_threads.get()).unwrap_or(i128::MAX);
    let grain = len / num_threads.saturating_mul(CHUNKS_PER_THREAD);
    // The grain never exceeds the length of the range, which fits an `Index`
    // unless the range spans more than half of the index space.
    Index::try_from(grain.max(1)).unwrap_or(Index::MAX)
}

/// Split of `[first, last)` into chunks `[first + k * grain, first + (k + 1) *
/// grain)`, the last one being truncated at `last` by the executor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct ChunkPlan {
    first: Index,
    last: Index,
    grain: Index,
    num_chunks: u64,
}

impl ChunkPlan {
    /// Plans the chunks of `[first, last)`, computing the grain if `grain <= 0`.
    /// Returns [`None`] if the range is empty.
    pub(crate) fn new(
        first: Index,
        last: Index,
        grain: Index,
        num_threads: NonZeroUsize,
    ) -> Option<Self> {
        if first >= last {
            return None;
        }
        let grain = if grain > 0 {
            grain
        } else {
            auto_grain(first, last, num_threads)
        };
        let len = i128::from(last) - i128::from(first);
        let grain_wide = i128::from(grain);
        let num_chunks = (len + grain_wide - 1) / grain_wide;
        Some(Self {
            first,
            last,
            grain,
            num_chunks: u64::try_from(num_chunks).unwrap_or(u64::MAX),
        })
    }

    /// Grain of the chunks.
    pub(crate) fn grain(&self) -> Index {
        self.grain
    }

    /// Number of chunks.
    pub(crate) fn num_chunks(&self) -> u64 {
        self.num_chunks
    }

    /// Start of the chunk of the given index, which must be below
    /// [`num_chunks()`](Self::num_chunks).
    fn chunk_start(&self, index: u64) -> Index {
        let start = i128::from(self.first) + i128::from(index) * i128::from(self.grain);
        // Chunk starts are below `last`, so they fit an `Index`.
        Index::try_from(start).unwrap_or(self.last)
    }
}

/// One dynamic invocation of `parallel_for()`, from the moment the entering
/// thread opened it until it is dropped after every participant rejoined.
///
/// Participants claim chunks from a shared cursor, so chunks execute in no
/// particular order and each one exactly once.
pub(crate) struct Region<'a> {
    plan: ChunkPlan,
    next_chunk: CachePadded<AtomicU64>,
    executor: &'a dyn ChunkExecutor,
    stack: &'a IdentityStack,
    context: RegionContext,
}

impl<'a> Region<'a> {
    /// Opens a region over `[first, last)` on the given stack, entered by the
    /// current thread.
    ///
    /// Returns [`None`] without touching the stack if the range is empty, as
    /// there is no chunk from which to ask for the calling thread.
    pub(crate) fn open(
        stack: &'a IdentityStack,
        first: Index,
        last: Index,
        grain: Index,
        num_threads: NonZeroUsize,
        executor: &'a dyn ChunkExecutor,
    ) -> Option<Self> {
        let plan = ChunkPlan::new(first, last, grain, num_threads)?;
        let context = stack.push();
        log_debug!(
            "[region {}] Opened over [{first}, {last}) with grain {} ({} chunks)",
            context.id(),
            plan.grain(),
            plan.num_chunks()
        );
        Some(Self {
            plan,
            next_chunk: CachePadded::new(AtomicU64::new(0)),
            executor,
            stack,
            context,
        })
    }

    /// Number of chunks of this region.
    pub(crate) fn num_chunks(&self) -> u64 {
        self.plan.num_chunks()
    }

    /// Executes chunks from the current thread until none is left.
    pub(crate) fn participate(&self) {
        let _scope = RegionScope::enter(self.context);
        #[cfg(feature = "log_parallelism")]
        let mut processed = 0u64;
        loop {
            let index = self.next_chunk.fetch_add(1, Ordering::Relaxed);
            if index >= self.plan.num_chunks {
                break;
            }
            self.executor
                .execute(self.plan.chunk_start(index), self.plan.grain, self.plan.last);
            #[cfg(feature = "log_parallelism")]
            {
                processed += 1;
            }
        }
        #[cfg(feature = "log_parallelism")]
        log_trace!(
            "[region {}] {:?} processed {processed} chunk(s)",
            self.context.id(),
            crate::identity::ThreadToken::current()
        );
    }
}

impl Drop for Region<'_> {
    fn drop(&mut self) {
        #[cfg(feature = "log_parallelism")]
        log_info!(
            "[region {}] Closed after {} chunk(s)",
            self.context.id(),
            self.plan.num_chunks()
        );
        self.stack.pop(self.context);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Mutex;

    fn n(count: usize) -> NonZeroUsize {
        NonZeroUsize::new(count).unwrap()
    }

    /// Collects the `[from, end)` sub-ranges, clamped like an executor must do.
    fn collect_chunks(region: &Region<'_>, chunks: &Mutex<Vec<(Index, Index)>>) {
        region.participate();
        let mut chunks = chunks.lock().unwrap();
        chunks.sort_unstable();
    }

    #[test]
    fn test_auto_grain() {
        assert_eq!(auto_grain(0, 1000, n(4)), 62);
        assert_eq!(auto_grain(0, 10, n(4)), 1);
        assert_eq!(auto_grain(0, 16, n(4)), 1);
        assert_eq!(auto_grain(0, 32, n(4)), 2);
        assert_eq!(auto_grain(-500, 500, n(1)), 250);
        assert_eq!(auto_grain(Index::MIN, Index::MAX, n(1)), Index::MAX / 2);
    }

    #[test]
    fn test_plan_empty() {
        assert_eq!(ChunkPlan::new(0, 0, 1, n(4)), None);
        assert_eq!(ChunkPlan::new(10, 3, 0, n(4)), None);
    }

    #[test]
    fn test_plan_auto_grain_scenario() {
        let plan = ChunkPlan::new(0, 1000, 0, n(4)).unwrap();
        assert_eq!(plan.grain(), 62);
        // 16 full chunks of 62 elements, then [992, 1000).
        assert_eq!(plan.num_chunks(), 17);
        assert_eq!(plan.chunk_start(0), 0);
        assert_eq!(plan.chunk_start(15), 930);
        assert_eq!(plan.chunk_start(16), 992);
    }

    #[test]
    fn test_plan_explicit_grain() {
        let plan = ChunkPlan::new(-7, 8, 5, n(2)).unwrap();
        assert_eq!(plan.num_chunks(), 3);
        assert_eq!(
            (0..3).map(|i| plan.chunk_start(i)).collect::<Vec<_>>(),
            [-7, -2, 3]
        );

        let plan = ChunkPlan::new(0, 3, 100, n(2)).unwrap();
        assert_eq!(plan.num_chunks(), 1);
    }

    #[test]
    fn test_plan_extreme_range() {
        let plan = ChunkPlan::new(Index::MIN, Index::MAX, Index::MAX, n(1)).unwrap();
        assert_eq!(plan.num_chunks(), 3);
        assert_eq!(plan.chunk_start(2), Index::MAX - 1);
    }

    #[test]
    fn test_region_covers_range() {
        let stack = IdentityStack::new();
        let chunks = Mutex::new(Vec::new());
        let executor = |from: Index, grain: Index, last: Index| {
            let end = from.saturating_add(grain).min(last);
            chunks.lock().unwrap().push((from, end));
        };

        let region = Region::open(&stack, 3, 100, 7, n(4), &executor).unwrap();
        assert_eq!(stack.depth(), 1);
        collect_chunks(&region, &chunks);
        drop(region);
        assert_eq!(stack.depth(), 0);

        let chunks = chunks.into_inner().unwrap();
        assert_eq!(chunks.first().unwrap().0, 3);
        assert_eq!(chunks.last().unwrap().1, 100);
        for pair in chunks.windows(2) {
            assert_eq!(pair[0].1, pair[1].0);
        }
    }

    #[test]
    fn test_region_shared_by_threads() {
        let stack = IdentityStack::new();
        let seen = (0..10_000).map(|_| AtomicU64::new(0)).collect::<Vec<_>>();
        let executor = |from: Index, grain: Index, last: Index| {
            for i in from..from.saturating_add(grain).min(last) {
                seen[i as usize].fetch_add(1, Ordering::Relaxed);
            }
        };

        let region = Region::open(&stack, 0, 10_000, 0, n(4), &executor).unwrap();
        std::thread::scope(|scope| {
            for _ in 0..3 {
                scope.spawn(|| region.participate());
            }
            region.participate();
        });
        drop(region);

        assert!(seen.iter().all(|count| count.load(Ordering::Relaxed) == 1));
    }

    #[test]
    fn test_empty_region_leaves_stack_alone() {
        let stack = IdentityStack::new();
        let executor = |_: Index, _: Index, _: Index| panic!("no chunk expected");
        assert!(Region::open(&stack, 5, 5, 1, n(4), &executor).is_none());
        assert_eq!(stack.depth(), 0);
    }

    #[test]
    fn test_region_pops_on_panic() {
        let stack = IdentityStack::new();
        let executor = |_: Index, _: Index, _: Index| panic!("chunk failure");
        let result = std::panic::catch_unwind(|| {
            let region = Region::open(&stack, 0, 10, 1, n(4), &executor).unwrap();
            region.participate();
        });
        assert!(result.is_err());
        assert_eq!(stack.depth(), 0);
        assert!(!crate::identity::is_parallel_scope());
    }
}
