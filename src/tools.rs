// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! A uniform entry point over the compiled-in backends.

#[cfg(feature = "rayon")]
use crate::backend::TaskArena;
use crate::backend::{Backend, ChunkExecutor, Index, Sequential, ThreadTeam};
use crate::config::BackendKind;
use crate::macros::log_debug;
use crate::state::Initializer;
use std::num::NonZeroUsize;
use std::ops::Range;

/// Handle on the selected backend, keeping its process-wide state alive.
#[derive(Clone)]
enum BackendHandle {
    Sequential(Initializer<Sequential>),
    ThreadTeam(Initializer<ThreadTeam>),
    #[cfg(feature = "rayon")]
    TaskArena(Initializer<TaskArena>),
}

/// Forwards a call to the selected backend.
macro_rules! dispatch {
    ( $handle:expr, $backend:ident => $call:expr ) => {
        match $handle {
            BackendHandle::Sequential($backend) => $call,
            BackendHandle::ThreadTeam($backend) => $call,
            #[cfg(feature = "rayon")]
            BackendHandle::TaskArena($backend) => $call,
        }
    };
}

impl BackendHandle {
    /// Acquires the given backend, or returns [`None`] if it isn't compiled
    /// in.
    fn acquire(kind: BackendKind) -> Option<Self> {
        match kind {
            BackendKind::Sequential => Some(BackendHandle::Sequential(Initializer::acquire())),
            BackendKind::ThreadTeam => Some(BackendHandle::ThreadTeam(Initializer::acquire())),
            #[cfg(feature = "rayon")]
            BackendKind::TaskArena => Some(BackendHandle::TaskArena(Initializer::acquire())),
            #[cfg(not(feature = "rayon"))]
            BackendKind::TaskArena => None,
        }
    }

    fn kind(&self) -> BackendKind {
        match self {
            BackendHandle::Sequential(_) => BackendKind::Sequential,
            BackendHandle::ThreadTeam(_) => BackendKind::ThreadTeam,
            #[cfg(feature = "rayon")]
            BackendHandle::TaskArena(_) => BackendKind::TaskArena,
        }
    }

    fn nested_by_default(&self) -> bool {
        fn nested<B: Backend>(_: &Initializer<B>) -> bool {
            B::NESTED_BY_DEFAULT
        }
        dispatch!(self, backend => nested(backend))
    }
}

/// Parallel loops over one backend, selected at construction.
///
/// Each `SmpTools` holds a handle on its backend's process-wide state, so that
/// thread teams and arenas live as long as some `SmpTools` uses them. All the
/// `SmpTools` of a process that use the same backend share its settings.
///
/// ```
/// # use paraloop::{BackendKind, SmpTools};
/// use std::sync::atomic::{AtomicUsize, Ordering};
///
/// let tools = SmpTools::with_backend(BackendKind::ThreadTeam).unwrap();
/// let input: Vec<usize> = (0..1_000).collect();
/// let sum = AtomicUsize::new(0);
/// let reports = AtomicUsize::new(0);
/// tools.for_each_range(0, 1_000, 0, |range| {
///     let partial: usize = input[range.start as usize..range.end as usize].iter().sum();
///     sum.fetch_add(partial, Ordering::Relaxed);
///     if tools.is_calling_thread() {
///         reports.fetch_add(1, Ordering::Relaxed);
///     }
/// });
/// assert_eq!(sum.into_inner(), 499_500);
/// assert!(reports.into_inner() >= 1);
/// ```
#[derive(Clone)]
pub struct SmpTools {
    handle: BackendHandle,
    /// Nested parallelism requested by the user, if any.
    nested: Option<bool>,
}

impl SmpTools {
    /// Uses the backend named by the [`BACKEND_ENV`](crate::config::BACKEND_ENV)
    /// variable, or the default backend.
    pub fn new() -> Self {
        let kind = BackendKind::from_env();
        log_debug!("Using the {} backend", kind.name());
        // `from_env()` only returns compiled-in backends.
        Self::with_backend(kind).unwrap_or_else(|| Self {
            handle: BackendHandle::ThreadTeam(Initializer::acquire()),
            nested: None,
        })
    }

    /// Uses the given backend, or returns [`None`] if it isn't compiled in.
    pub fn with_backend(kind: BackendKind) -> Option<Self> {
        let handle = BackendHandle::acquire(kind)?;
        Some(Self {
            handle,
            nested: None,
        })
    }

    /// Switches to the given backend. Returns false, keeping the current
    /// backend, if the requested one isn't compiled in.
    pub fn set_backend(&mut self, kind: BackendKind) -> bool {
        if kind == self.handle.kind() {
            return true;
        }
        match BackendHandle::acquire(kind) {
            Some(handle) => {
                log_debug!(
                    "Switching from the {} backend to the {} backend",
                    self.handle.kind().name(),
                    kind.name()
                );
                self.handle = handle;
                true
            }
            None => false,
        }
    }

    /// Backend in use.
    pub fn backend(&self) -> BackendKind {
        self.handle.kind()
    }

    /// Requests a number of threads, 0 meaning the default. The
    /// [`MAX_THREADS_ENV`](crate::config::MAX_THREADS_ENV) variable, if set,
    /// takes precedence. See [`Backend::initialize()`].
    pub fn initialize(&self, requested: usize) {
        dispatch!(&self.handle, backend => backend.initialize(requested))
    }

    /// Number of threads that the next loop will use at most.
    pub fn estimated_thread_count(&self) -> NonZeroUsize {
        dispatch!(&self.handle, backend => backend.estimated_thread_count())
    }

    /// Whether the current thread is the one that started the innermost loop
    /// it is taking part in. Use it to perform a side effect once per loop,
    /// such as reporting progress.
    ///
    /// Only meaningful from inside a loop.
    pub fn is_calling_thread(&self) -> bool {
        dispatch!(&self.handle, backend => backend.is_calling_thread())
    }

    /// Enables or disables parallelism of loops started from inside another
    /// loop. When disabled, such loops run on the thread that starts them.
    pub fn set_nested_parallelism(&mut self, nested: bool) {
        self.nested = Some(nested);
    }

    /// Whether loops started from inside another loop run in parallel. Unless
    /// set, this depends on the backend.
    pub fn nested_parallelism(&self) -> bool {
        self.nested
            .unwrap_or_else(|| self.handle.nested_by_default())
    }

    /// Runs `executor` on chunks of `first..last`. See
    /// [`Backend::parallel_for()`].
    pub fn parallel_for(
        &self,
        first: Index,
        last: Index,
        grain: Index,
        executor: &dyn ChunkExecutor,
    ) {
        let nested = self.nested_parallelism();
        dispatch!(&self.handle, backend => backend.parallel_for(first, last, grain, executor, nested))
    }

    /// Runs `f` on sub-ranges covering `first..last`, of `grain` indices
    /// except for the last one. A `grain <= 0` is computed automatically.
    pub fn for_each_range(
        &self,
        first: Index,
        last: Index,
        grain: Index,
        f: impl Fn(Range<Index>) + Sync,
    ) {
        self.parallel_for(first, last, grain, &|from: Index, grain: Index, last: Index| {
            f(from..from.saturating_add(grain).min(last))
        })
    }
}

impl Default for SmpTools {
    fn default() -> Self {
        Self::new()
    }
}
