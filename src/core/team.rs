// Copyright 2024-2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! A persistent team of threads that the calling thread leads through
//! successive regions.

use super::region::Region;
use super::sync::{make_team, Follower, FollowerState, Leader};
use super::util::LifetimeFamily;
use crate::config::CpuPinningPolicy;
use crate::macros::{log_debug, log_error, log_warn};
// Platforms that support `libc::sched_setaffinity()`.
#[cfg(all(
    not(miri),
    any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "linux"
    )
))]
use nix::{
    sched::{sched_setaffinity, CpuSet},
    unistd::Pid,
};
use std::num::NonZeroUsize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread::JoinHandle;

/// [`Region`] seen as a family of types over its lifetime, so that a region
/// borrowed by the leader can be lent to the followers.
struct RegionFamily;

impl LifetimeFamily for RegionFamily {
    type Of<'a> = Region<'a>;
}

/// A team of `size` threads: the thread that runs a region, plus `size - 1`
/// follower threads spawned once and reused for every region.
pub(crate) struct TeamPool {
    followers: Vec<JoinHandle<()>>,
    leader: Leader<RegionFamily>,
    cpu_pinning: CpuPinningPolicy,
}

impl TeamPool {
    /// Spawns the follower threads of a team of the given size.
    pub(crate) fn new(size: NonZeroUsize, cpu_pinning: CpuPinningPolicy) -> Self {
        let (leader, followers) = make_team(size.get() - 1);

        #[cfg(any(
            miri,
            not(any(
                target_os = "android",
                target_os = "dragonfly",
                target_os = "freebsd",
                target_os = "linux"
            ))
        ))]
        match cpu_pinning {
            CpuPinningPolicy::No => (),
            CpuPinningPolicy::IfSupported => {
                log_warn!("Pinning threads to CPUs is not implemented on this platform.")
            }
            CpuPinningPolicy::Always => {
                panic!("Pinning threads to CPUs is not implemented on this platform.")
            }
        }

        let followers = followers
            .into_iter()
            .enumerate()
            .map(|(index, follower)| {
                // The leader is member #0.
                let id = index + 1;
                std::thread::Builder::new()
                    .name(format!("paraloop-team-{id}"))
                    .spawn(move || {
                        pin_to_cpu(id, cpu_pinning);
                        follow_until_disbanded(follower)
                    })
                    .unwrap_or_else(|e| panic!("Failed to spawn team thread #{id}: {e}"))
            })
            .collect();
        log_debug!("[leader] Spawned a team of {size} threads");

        Self {
            followers,
            leader,
            cpu_pinning,
        }
    }

    /// Pinning policy that the team was spawned with.
    pub(crate) fn cpu_pinning(&self) -> CpuPinningPolicy {
        self.cpu_pinning
    }

    /// Number of threads in the team, including the leader.
    pub(crate) fn size(&self) -> NonZeroUsize {
        NonZeroUsize::MIN.saturating_add(self.followers.len())
    }

    /// Runs the region with the whole team, led by the current thread.
    pub(crate) fn run(&mut self, region: &Region<'_>) {
        self.leader.lead(region, |region| region.participate());
    }
}

impl Drop for TeamPool {
    /// Joins all the follower threads.
    fn drop(&mut self) {
        self.leader.disband();

        log_debug!("[leader] Joining team threads...");
        for (_i, handle) in self.followers.drain(..).enumerate() {
            match handle.join() {
                Ok(()) => log_debug!("[leader] Team thread #{} joined", _i + 1),
                Err(_e) => log_error!("[leader] Team thread #{} joined with {_e:?}", _i + 1),
            }
        }
        log_debug!("[leader] Joined team threads.");
    }
}

/// Main function of a follower thread.
fn follow_until_disbanded(mut follower: Follower<RegionFamily>) {
    loop {
        // A panicking chunk has already been reported to the leader, and the
        // follower stays available for the next region.
        let state = catch_unwind(AssertUnwindSafe(|| {
            follower.follow(|region| region.participate())
        }));
        match state {
            Ok(FollowerState::Finished) => break,
            Ok(FollowerState::Ready) | Err(_) => continue,
        }
    }
}

#[cfg(all(
    not(miri),
    any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "linux"
    )
))]
fn pin_to_cpu(id: usize, cpu_pinning: CpuPinningPolicy) {
    match cpu_pinning {
        CpuPinningPolicy::No => (),
        CpuPinningPolicy::IfSupported => {
            let mut cpu_set = CpuSet::new();
            if let Err(_e) = cpu_set.set(id) {
                log_warn!("Failed to set CPU affinity for team thread #{id}: {_e}");
            } else if let Err(_e) = sched_setaffinity(Pid::from_raw(0), &cpu_set) {
                log_warn!("Failed to set CPU affinity for team thread #{id}: {_e}");
            } else {
                log_debug!("Pinned team thread #{id} to CPU #{id}");
            }
        }
        CpuPinningPolicy::Always => {
            let mut cpu_set = CpuSet::new();
            if let Err(e) = cpu_set.set(id) {
                panic!("Failed to set CPU affinity for team thread #{id}: {e}");
            } else if let Err(e) = sched_setaffinity(Pid::from_raw(0), &cpu_set) {
                panic!("Failed to set CPU affinity for team thread #{id}: {e}");
            } else {
                log_debug!("Pinned team thread #{id} to CPU #{id}");
            }
        }
    }
}

#[cfg(any(
    miri,
    not(any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "linux"
    ))
))]
fn pin_to_cpu(_id: usize, _cpu_pinning: CpuPinningPolicy) {}
