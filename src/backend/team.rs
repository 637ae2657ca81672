// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use super::{Backend, ChunkExecutor, Index};
use crate::config::{self, BackendKind, CpuPinningPolicy, ThreadCountUpdate};
use crate::core::region::Region;
use crate::core::team::TeamPool;
use crate::identity::{is_parallel_scope, IdentityStack};
use crate::macros::{log_debug, log_warn};
use crate::state::ProcessState;
use std::num::NonZeroUsize;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::{Mutex, TryLockError};

static STATE: ProcessState<ThreadTeam> = ProcessState::new();

/// Backend running each region on a team of threads that the calling thread
/// joins at region entry.
///
/// The thread count is a setting read when a region starts: changing it with
/// [`initialize()`](Backend::initialize) respawns the team at the next
/// region. Regions opened from inside a chunk of another region run on the
/// thread that opened them, unless nested parallelism is requested.
///
/// ```
/// # use paraloop::{Backend, Index, Initializer, ThreadTeam};
/// use std::sync::atomic::{AtomicU64, Ordering};
///
/// let team = Initializer::<ThreadTeam>::acquire();
/// let reports = AtomicU64::new(0);
/// team.parallel_for(0, 1_000, 0, &|_: Index, _: Index, _: Index| {
///     if team.is_calling_thread() {
///         reports.fetch_add(1, Ordering::Relaxed);
///     }
/// }, false);
/// assert!(reports.into_inner() >= 1);
/// ```
pub struct ThreadTeam {
    settings: Mutex<TeamSettings>,
    /// Team reused by successive regions, spawned lazily.
    pool: Mutex<Option<TeamPool>>,
    identities: IdentityStack,
}

struct TeamSettings {
    /// Thread count applied by [`ThreadTeam::initialize()`], if any.
    specified: Option<NonZeroUsize>,
    cpu_pinning: CpuPinningPolicy,
}

impl ThreadTeam {
    /// Sets the CPU pinning policy of the team threads. It applies to teams
    /// spawned from now on.
    pub fn set_cpu_pinning(&self, cpu_pinning: CpuPinningPolicy) {
        self.settings.lock().unwrap().cpu_pinning = cpu_pinning;
    }

    /// Current CPU pinning policy of the team threads.
    pub fn cpu_pinning(&self) -> CpuPinningPolicy {
        self.settings.lock().unwrap().cpu_pinning
    }

    /// Runs the region on the persistent team, respawning it if its size or
    /// pinning policy is out of date.
    fn run_pooled(&self, pool: &mut Option<TeamPool>, size: NonZeroUsize, region: &Region<'_>) {
        let cpu_pinning = self.cpu_pinning();
        let team = match pool.take() {
            Some(team) if team.size() == size && team.cpu_pinning() == cpu_pinning => {
                pool.insert(team)
            }
            stale => {
                if let Some(_stale) = &stale {
                    log_debug!(
                        "Respawning the team: {} -> {size} threads",
                        _stale.size()
                    );
                }
                // The previous team is joined before spawning the new one.
                drop(stale);
                pool.insert(TeamPool::new(size, cpu_pinning))
            }
        };
        team.run(region);
    }
}

/// Runs the region on threads spawned for its duration, for when the
/// persistent team is busy with another region.
fn run_transient(size: NonZeroUsize, region: &Region<'_>) {
    log_debug!("Persistent team busy, spawning {size} transient threads");
    std::thread::scope(|scope| {
        let helpers: Vec<_> = (1..size.get())
            .map(|id| {
                std::thread::Builder::new()
                    .name(format!("paraloop-helper-{id}"))
                    .spawn_scoped(scope, || region.participate())
                    .unwrap_or_else(|e| panic!("Failed to spawn helper thread #{id}: {e}"))
            })
            .collect();

        let own = catch_unwind(AssertUnwindSafe(|| region.participate()));
        let num_panicked = helpers
            .into_iter()
            .map(|helper| helper.join())
            .filter(Result::is_err)
            .count();

        if let Err(payload) = own {
            resume_unwind(payload);
        }
        if num_panicked != 0 {
            panic!("{num_panicked} worker thread(s) panicked!");
        }
    });
}

impl Backend for ThreadTeam {
    const KIND: BackendKind = BackendKind::ThreadTeam;
    const NESTED_BY_DEFAULT: bool = false;

    fn new() -> Self {
        Self {
            settings: Mutex::new(TeamSettings {
                specified: None,
                cpu_pinning: CpuPinningPolicy::default(),
            }),
            pool: Mutex::new(None),
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
            ThreadCountUpdate::Reset => {
                log_debug!("Team thread count reset to the hardware concurrency");
                settings.specified = None;
            }
            ThreadCountUpdate::Set(count) => {
                if settings.specified != Some(count) {
                    log_debug!("Team thread count set to {count}");
                }
                settings.specified = Some(count);
            }
        }
    }

    fn estimated_thread_count(&self) -> NonZeroUsize {
        self.settings
            .lock()
            .unwrap()
            .specified
            .unwrap_or_else(config::hardware_concurrency)
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
        // The grain follows the configured thread count, even when the region
        // ends up serialized.
        let num_threads = self.estimated_thread_count();
        let serialized = is_parallel_scope() && !nested;
        let Some(region) =
            Region::open(&self.identities, first, last, grain, num_threads, executor)
        else {
            return;
        };
        if serialized || num_threads == NonZeroUsize::MIN || region.num_chunks() == 1 {
            region.participate();
            return;
        }

        match self.pool.try_lock() {
            Ok(mut pool) => self.run_pooled(&mut pool, num_threads, &region),
            Err(TryLockError::Poisoned(poisoned)) => {
                log_warn!("A previous region panicked while holding the team, respawning it");
                let mut pool = poisoned.into_inner();
                self.pool.clear_poison();
                *pool = None;
                self.run_pooled(&mut pool, num_threads, &region);
            }
            Err(TryLockError::WouldBlock) => run_transient(num_threads, &region),
        }
    }

    fn open_regions(&self) -> usize {
        self.identities.depth()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Barrier;
    use std::thread::ThreadId;

    fn n(count: usize) -> NonZeroUsize {
        NonZeroUsize::new(count).unwrap()
    }

    #[test]
    fn test_initialize_table() {
        let team = ThreadTeam::new();
        let hardware = config::hardware_concurrency();
        assert_eq!(team.estimated_thread_count(), hardware);

        team.initialize_with(1, None);
        assert_eq!(team.estimated_thread_count(), n(1));

        team.initialize_with(usize::MAX, None);
        assert_eq!(team.estimated_thread_count(), hardware);

        team.initialize_with(1, None);
        team.initialize_with(0, None);
        assert_eq!(team.estimated_thread_count(), hardware);

        team.initialize_with(0, Some(n(1)));
        assert_eq!(team.estimated_thread_count(), n(1));
    }

    #[test]
    fn test_uses_several_threads() {
        let team = ThreadTeam::new();
        team.initialize_with(2, None);
        if team.estimated_thread_count() < n(2) {
            return;
        }

        // Both team members must be inside a chunk for it to complete.
        let barrier = Barrier::new(2);
        let threads = Mutex::new(HashSet::<ThreadId>::new());
        team.parallel_for(
            0,
            2,
            1,
            &|_: Index, _: Index, _: Index| {
                threads.lock().unwrap().insert(std::thread::current().id());
                barrier.wait();
            },
            false,
        );
        assert_eq!(threads.into_inner().unwrap().len(), 2);
    }

    #[test]
    fn test_team_respawned_on_resize() {
        let team = ThreadTeam::new();
        let sum = |team: &ThreadTeam| {
            let total = AtomicU64::new(0);
            team.parallel_for(
                0,
                1_000,
                0,
                &|from: Index, grain: Index, last: Index| {
                    let end = (from + grain).min(last);
                    total.fetch_add((from..end).sum::<Index>() as u64, Ordering::Relaxed);
                },
                false,
            );
            total.into_inner()
        };

        team.initialize_with(2, None);
        assert_eq!(sum(&team), 499_500);
        team.initialize_with(1, None);
        assert_eq!(sum(&team), 499_500);
        team.initialize_with(0, None);
        assert_eq!(sum(&team), 499_500);
    }

    #[test]
    fn test_recovers_after_panic() {
        let team = ThreadTeam::new();
        let result = catch_unwind(AssertUnwindSafe(|| {
            team.parallel_for(
                0,
                100,
                1,
                &|from: Index, _: Index, _: Index| {
                    if from == 42 {
                        panic!("chunk 42");
                    }
                },
                false,
            )
        }));
        assert!(result.is_err());
        assert_eq!(team.open_regions(), 0);

        let count = AtomicU64::new(0);
        team.parallel_for(
            0,
            100,
            1,
            &|_: Index, _: Index, _: Index| {
                count.fetch_add(1, Ordering::Relaxed);
            },
            false,
        );
        assert_eq!(count.into_inner(), 100);
    }

    #[test]
    fn test_concurrent_regions_share_the_team() {
        let team = ThreadTeam::new();
        team.initialize_with(2, None);
        let count = AtomicU64::new(0);
        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    for _ in 0..10 {
                        team.parallel_for(
                            0,
                            100,
                            0,
                            &|from: Index, grain: Index, last: Index| {
                                let end = (from + grain).min(last);
                                count.fetch_add((end - from) as u64, Ordering::Relaxed);
                            },
                            false,
                        );
                    }
                });
            }
        });
        assert_eq!(count.into_inner(), 4 * 10 * 100);
        assert_eq!(team.open_regions(), 0);
    }

    #[test]
    fn test_serialized_nested_region_grain() {
        let team = ThreadTeam::new();
        // A team of 4 threads, regardless of the hardware concurrency.
        team.settings.lock().unwrap().specified = Some(n(4));

        let grains = Mutex::new(HashSet::<Index>::new());
        let threads = Mutex::new(HashSet::<ThreadId>::new());
        team.parallel_for(
            0,
            1,
            1,
            &|_: Index, _: Index, _: Index| {
                team.parallel_for(
                    0,
                    1_000,
                    0,
                    &|_: Index, grain: Index, _: Index| {
                        grains.lock().unwrap().insert(grain);
                        threads.lock().unwrap().insert(std::thread::current().id());
                    },
                    false,
                );
            },
            false,
        );
        assert_eq!(grains.into_inner().unwrap(), HashSet::from([62]));
        assert_eq!(
            threads.into_inner().unwrap(),
            HashSet::from([std::thread::current().id()])
        );
        assert_eq!(team.open_regions(), 0);
    }
}
