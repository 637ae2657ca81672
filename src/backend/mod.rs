// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The capability set shared by all parallel backends, and its
//! implementations.

#[cfg(feature = "rayon")]
mod arena;
mod sequential;
mod team;

use crate::config::{self, BackendKind};
use crate::state::ProcessState;
#[cfg(feature = "rayon")]
pub use arena::TaskArena;
pub use sequential::Sequential;
use std::num::NonZeroUsize;
pub use team::ThreadTeam;

/// Signed index type of the ranges processed by
/// [`parallel_for()`](Backend::parallel_for).
pub type Index = i64;

/// Work to execute on each chunk of a range.
///
/// [`execute()`](Self::execute) receives the start of the chunk, the grain and
/// the end of the whole range. The chunk covers `from..min(from + grain, last)`,
/// and computing that end is the executor's job.
///
/// Any closure `Fn(Index, Index, Index) + Sync` is an executor.
///
/// ```
/// # use paraloop::{Backend, Index, Initializer, Sequential};
/// use std::sync::atomic::{AtomicI64, Ordering};
///
/// let backend = Initializer::<Sequential>::acquire();
/// let sum = AtomicI64::new(0);
/// backend.parallel_for(0, 10, 3, &|from: Index, grain: Index, last: Index| {
///     let end = (from + grain).min(last);
///     sum.fetch_add((from..end).sum::<Index>(), Ordering::Relaxed);
/// }, false);
/// assert_eq!(sum.into_inner(), 45);
/// ```
pub trait ChunkExecutor: Sync {
    /// Processes the chunk starting at `from`.
    fn execute(&self, from: Index, grain: Index, last: Index);
}

impl<F> ChunkExecutor for F
where
    F: Fn(Index, Index, Index) + Sync,
{
    fn execute(&self, from: Index, grain: Index, last: Index) {
        self(from, grain, last)
    }
}

/// A threading runtime able to run a parallel for loop.
///
/// Each backend keeps its resources in a process-wide state, shared through
/// [`Initializer`](crate::Initializer) handles.
pub trait Backend: Send + Sync + Sized + 'static {
    /// Which backend this is.
    const KIND: BackendKind;

    /// Whether regions entered from inside a chunk of another region are
    /// parallelized, unless the caller says otherwise.
    const NESTED_BY_DEFAULT: bool;

    /// Creates the backend's resources, with the default thread count.
    fn new() -> Self;

    /// Process-wide state of this backend.
    fn process_state() -> &'static ProcessState<Self>;

    /// Applies a thread count request, given the override read from the
    /// environment. See [`resolve_thread_count()`](config::resolve_thread_count)
    /// for the rules.
    ///
    /// The request is clamped to the hardware concurrency, and a request of 0
    /// goes back to the default concurrency.
    fn initialize_with(&self, requested: usize, env_override: Option<NonZeroUsize>);

    /// Applies a thread count request, subject to the
    /// [`MAX_THREADS_ENV`](config::MAX_THREADS_ENV) override.
    fn initialize(&self, requested: usize) {
        self.initialize_with(requested, config::max_threads_from_env())
    }

    /// Number of threads that the next region will use at most.
    fn estimated_thread_count(&self) -> NonZeroUsize;

    /// Whether the current thread is the one that entered the innermost region
    /// it is taking part in.
    ///
    /// This is only meaningful while a region is open. Outside of any region,
    /// backends other than [`Sequential`] answer `false`.
    fn is_calling_thread(&self) -> bool;

    /// Runs `executor` on chunks of `grain` indices covering `first..last`,
    /// and returns once every chunk has been processed.
    ///
    /// - If `grain <= 0`, a grain is computed to give each thread several
    ///   chunks.
    /// - If `first >= last`, nothing runs.
    /// - If `nested` is false and the current thread is already executing a
    ///   chunk of another region, the chunks run on the current thread only.
    ///
    /// The current thread always executes chunks itself. A panic in the
    /// executor is propagated once every participating thread is done.
    fn parallel_for(
        &self,
        first: Index,
        last: Index,
        grain: Index,
        executor: &dyn ChunkExecutor,
        nested: bool,
    );

    /// Number of regions currently open on this backend.
    fn open_regions(&self) -> usize;
}
