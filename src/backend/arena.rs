// Copyright 2025-2026 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use super::{Backend, ChunkExecutor, Index};
use crate::config::{self, BackendKind, ThreadCountUpdate};
use crate::core::region::Region;
use crate::identity::{is_parallel_scope, IdentityStack};
use crate::macros::{log_debug, log_error};
use crate::state::ProcessState;
use rayon_core::{Scope, ThreadPool, ThreadPoolBuilder};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

static STATE: ProcessState<TaskArena> = ProcessState::new();

/// Backend running each region as tasks of a
/// [Rayon](https://docs.rs/rayon) work-stealing thread pool.
///
/// By default, regions run on Rayon's global thread pool. Requesting a thread
/// count different from the current concurrency terminates the arena and
/// builds a dedicated one of the requested size. Regions nested inside chunks
/// of other regions are parallelized by default.
///
/// ```
/// # #[cfg(not(miri))]
/// # {
/// # use paraloop::{Backend, Index, Initializer, TaskArena};
/// use std::sync::atomic::{AtomicI64, Ordering};
///
/// let arena = Initializer::<TaskArena>::acquire();
/// let sum = AtomicI64::new(0);
/// arena.parallel_for(1, 101, 0, &|from: Index, grain: Index, last: Index| {
///     let end = (from + grain).min(last);
///     sum.fetch_add((from..end).sum::<Index>(), Ordering::Relaxed);
/// }, true);
/// assert_eq!(sum.into_inner(), 5_050);
/// # }
/// ```
pub struct TaskArena {
    settings: Mutex<ArenaSettings>,
    identities: IdentityStack,
}

struct ArenaSettings {
    /// Thread count applied by [`TaskArena::initialize()`], if any.
    specified: Option<NonZeroUsize>,
    /// Dedicated arena, or [`None`] to use Rayon's global thread pool.
    arena: Option<Arc<ThreadPool>>,
}

/// Number of threads of the given arena, or of Rayon's global pool.
fn concurrency(arena: Option<&ThreadPool>) -> NonZeroUsize {
    let count = match arena {
        None => rayon_core::current_num_threads(),
        Some(arena) => arena.current_num_threads(),
    };
    NonZeroUsize::new(count).unwrap_or(NonZeroUsize::MIN)
}

/// Creates a fork-join scope on the given arena, or on Rayon's global thread
/// pool, and invokes the closure on the current thread.
fn in_place_scope<'scope, OP, R>(arena: Option<&ThreadPool>, op: OP) -> R
where
    OP: FnOnce(&Scope<'scope>) -> R,
{
    match arena {
        None => rayon_core::in_place_scope(op),
        Some(arena) => arena.in_place_scope(op),
    }
}

impl ArenaSettings {
    /// Replaces the arena by one of the given size, unless the current one
    /// already has that many threads. Returns whether the arena now has `count`
    /// threads.
    fn rebuild(&mut self, count: NonZeroUsize) -> bool {
        let current = concurrency(self.arena.as_deref());
        if current == count {
            return true;
        }
        log_debug!("Reinitializing the task arena: {current} -> {count} threads");
        let built = ThreadPoolBuilder::new()
            .num_threads(count.get())
            .thread_name(|i| format!("paraloop-arena-{i}"))
            .build();
        match built {
            Ok(arena) => {
                // Regions still running on the previous arena keep it alive.
                self.arena = Some(Arc::new(arena));
                true
            }
            Err(_e) => {
                log_error!("Failed to build a task arena of {count} threads: {_e}");
                false
            }
        }
    }

    /// Applies an explicit thread count.
    fn resize(&mut self, count: NonZeroUsize) {
        if self.rebuild(count) {
            self.specified = Some(count);
        }
    }

    /// Clears the explicit thread count and goes back to the hardware
    /// concurrency, on Rayon's global pool when it has that size.
    fn reset(&mut self) {
        self.specified = None;
        let hardware = config::hardware_concurrency();
        if concurrency(None) == hardware {
            if self.arena.take().is_some() {
                log_debug!("Terminated the task arena, back to the global thread pool");
            }
        } else {
            // The global pool follows RAYON_NUM_THREADS instead.
            self.rebuild(hardware);
        }
    }
}

impl Backend for TaskArena {
    const KIND: BackendKind = BackendKind::TaskArena;
    const NESTED_BY_DEFAULT: bool = true;

    fn new() -> Self {
        Self {
            settings: Mutex::new(ArenaSettings {
                specified: None,
                arena: None,
            }),
            identities: IdentityStack::new(),
        }
    }

    fn process_state() -> &'static ProcessState<Self> {
        &STATE
    }

    fn initialize_with(&self, requested: usize, env_override: Option<NonZeroUsize>) {
        let mut settings = self.settings.lock().unwrap();
        let update = config::resolve_thread_count(
            requested,
            env_override,
            config::hardware_concurrency(),
            settings.specified.is_some(),
        );
        match update {
            ThreadCountUpdate::Keep => (),
            ThreadCountUpdate::Reset => settings.reset(),
            ThreadCountUpdate::Set(count) => settings.resize(count),
        }
    }

    fn estimated_thread_count(&self) -> NonZeroUsize {
        concurrency(self.settings.lock().unwrap().arena.as_deref())
    }

    fn is_calling_thread(&self) -> bool {
        self.identities.is_calling_thread()
    }

    fn parallel_for(
        &self,
        first: Index,
        last: Index,
        grain: Index,
        executor: &dyn ChunkExecutor,
        nested: bool,
    ) {
        let arena = self.settings.lock().unwrap().arena.clone();
        let num_threads = concurrency(arena.as_deref());
        let serialized = is_parallel_scope() && !nested;
        let Some(region) =
            Region::open(&self.identities, first, last, grain, num_threads, executor)
        else {
            return;
        };

        let num_chunks = usize::try_from(region.num_chunks()).unwrap_or(usize::MAX);
        // The current thread takes one share of the work itself.
        let num_tasks = (num_threads.get() - 1).min(num_chunks - 1);
        if serialized || num_tasks == 0 {
            region.participate();
            return;
        }

        let region = &region;
        in_place_scope(arena.as_deref(), |scope| {
            for _ in 0..num_tasks {
                scope.spawn(move |_| region.participate());
            }
            region.participate();
        });
    }

    fn open_regions(&self) -> usize {
        self.identities.depth()
    }
}
