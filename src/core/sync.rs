// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Hand-off of borrowed work between the thread that leads a team and the
//! team's follower threads.

use super::util::{ErasedRef, LifetimeFamily, Signal};
use crate::macros::{log_debug, log_error};
use crossbeam_utils::CachePadded;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

/// What a follower thread should do after a call to [`Follower::follow()`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FollowerState {
    /// Wait for the next round.
    Ready,
    /// The team is being disbanded, exit.
    Finished,
}

/// Progress of the leader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LeaderStatus {
    /// Followers are still working on the current round.
    Waiting,
    /// The last follower is done with the current round.
    Done,
}

/// Instruction published to the followers.
#[derive(Clone, Copy, PartialEq, Eq)]
enum FollowerStatus {
    /// Work on the round of the given parity.
    Round(Parity),
    /// Exit.
    Finished,
}

/// Distinguishes a round from the previous one, so that a fast follower doesn't
/// run the same round twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Parity {
    Even,
    Odd,
}

impl Parity {
    fn flip(&mut self) {
        *self = match self {
            Parity::Even => Parity::Odd,
            Parity::Odd => Parity::Even,
        }
    }
}

/// Creates a [`Leader`] together with `num_followers` [`Follower`]s.
pub fn make_team<F: LifetimeFamily>(num_followers: usize) -> (Leader<F>, Vec<Follower<F>>) {
    let parity = Parity::Even;
    let shared = Arc::new(Shared {
        num_busy: CachePadded::new(AtomicUsize::new(0)),
        num_panicked: CachePadded::new(AtomicUsize::new(0)),
        follower_status: Signal::new(FollowerStatus::Round(parity)),
        leader_status: Signal::new(LeaderStatus::Waiting),
        work: RwLock::new(ErasedRef::empty()),
    });

    let followers = (0..num_followers)
        .map(|id| Follower {
            id: id + 1,
            parity,
            shared: shared.clone(),
        })
        .collect();

    let leader = Leader {
        num_followers,
        parity,
        shared,
    };

    (leader, followers)
}

/// State shared by the leader and its followers.
struct Shared<F: LifetimeFamily> {
    /// Followers that haven't finished the current round.
    num_busy: CachePadded<AtomicUsize>,
    /// Followers that panicked during the current round.
    num_panicked: CachePadded<AtomicUsize>,
    follower_status: Signal<FollowerStatus>,
    leader_status: Signal<LeaderStatus>,
    /// Work lent for the current round.
    work: RwLock<ErasedRef<F>>,
}

/// The thread that hands out work to the team and takes part in it.
pub struct Leader<F: LifetimeFamily> {
    num_followers: usize,
    parity: Parity,
    shared: Arc<Shared<F>>,
}

impl<F: LifetimeFamily> Leader<F> {
    /// Lends `work` to every follower and runs `participate` on it from the
    /// current thread, then waits until all the followers are done.
    ///
    /// A panic of `participate` is resumed once the followers are done. A
    /// panic of any follower is reported by a new panic, and leaves the team
    /// ready for the next round.
    pub fn lead(&mut self, work: &F::Of<'_>, participate: impl FnOnce(&F::Of<'_>)) {
        if self.num_followers == 0 {
            participate(work);
            return;
        }

        self.shared
            .num_busy
            .store(self.num_followers, Ordering::SeqCst);

        self.parity.flip();
        let parity = self.parity;

        // Safety note: the reference set here stays valid until the `clear()`
        // below, which happens after every follower has signaled that it's done
        // with it (via `leader_status`).
        self.shared.work.write().unwrap().set(work);
        log_debug!("[leader, round {parity:?}] Lending work to the team.");

        self.shared
            .follower_status
            .publish_all(FollowerStatus::Round(parity));

        let own = catch_unwind(AssertUnwindSafe(|| participate(work)));

        log_debug!("[leader, round {parity:?}] Waiting for the followers.");
        let mut guard = self
            .shared
            .leader_status
            .wait_while(|status| *status == LeaderStatus::Waiting);
        debug_assert_eq!(*guard, LeaderStatus::Done);
        *guard = LeaderStatus::Waiting;
        drop(guard);

        // Safety note: every follower is done with the reference, see above.
        self.shared.work.write().unwrap().clear();
        log_debug!("[leader, round {parity:?}] All followers are done.");

        let num_panicked = self.shared.num_panicked.swap(0, Ordering::SeqCst);
        if let Err(payload) = own {
            log_error!("[leader, round {parity:?}] The leading thread panicked!");
            resume_unwind(payload);
        }
        if num_panicked != 0 {
            log_error!("[leader, round {parity:?}] {num_panicked} worker thread(s) panicked!");
            panic!("{num_panicked} worker thread(s) panicked!");
        }
    }

    /// Tells the followers to exit.
    pub fn disband(&mut self) {
        log_debug!("[leader] Notifying followers to finish...");
        self.shared
            .follower_status
            .publish_all(FollowerStatus::Finished);
    }
}

/// A team thread that runs the work lent by its [`Leader`].
pub struct Follower<F: LifetimeFamily> {
    /// Index of this thread in the team (the leader being #0).
    id: usize,
    parity: Parity,
    shared: Arc<Shared<F>>,
}

impl<F: LifetimeFamily> Follower<F> {
    /// Waits for the leader to lend work, and runs `f` on it.
    ///
    /// - If the leader calls [`Leader::lead()`], this returns
    ///   [`FollowerState::Ready`] after running `f`.
    /// - If the leader calls [`Leader::disband()`], this returns
    ///   [`FollowerState::Finished`] without running `f`.
    ///
    /// If `f` panics, the leader is notified before the panic unwinds out of
    /// this function.
    pub fn follow(&mut self, f: impl FnOnce(&F::Of<'_>)) -> FollowerState {
        self.parity.flip();
        let parity = self.parity;

        log_debug!("[thread {}, round {parity:?}] Waiting for work", self.id);

        let status: FollowerStatus = *self
            .shared
            .follower_status
            .wait_while(|status| match status {
                FollowerStatus::Finished => false,
                FollowerStatus::Round(p) => *p != parity,
            });
        match status {
            FollowerStatus::Finished => {
                log_debug!("[thread {}, round {parity:?}] Disbanded", self.id);
                FollowerState::Finished
            }
            FollowerStatus::Round(p) => {
                debug_assert_eq!(parity, p);
                log_debug!("[thread {}, round {parity:?}] Received work", self.id);

                // Notifies the leader when dropped, on success as well as on unwind.
                let done = DoneNotifier {
                    id: self.id,
                    shared: &self.shared,
                };

                {
                    let guard = self.shared.work.read().unwrap();
                    // SAFETY:
                    // - The reference doesn't outlive the underlying work, as the leader
                    //   waits for every `DoneNotifier` to be dropped before returning from
                    //   `lead()`.
                    // - The work isn't mutated meanwhile: the whole team only has shared
                    //   references to it.
                    if let Some(work) = unsafe { guard.get() } {
                        f(work);
                    }
                }

                drop(done);
                FollowerState::Ready
            }
        }
    }
}

/// Object whose destructor tells the leader that a follower is done with the
/// current round, whether it completed or panicked.
struct DoneNotifier<'a, F: LifetimeFamily> {
    id: usize,
    shared: &'a Shared<F>,
}

impl<F: LifetimeFamily> Drop for DoneNotifier<'_, F> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            log_error!("[thread {}] Panicked, notifying the leader", self.id);
            self.shared.num_panicked.fetch_add(1, Ordering::SeqCst);
        }

        let busy = self.shared.num_busy.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(busy > 0);
        if busy == 1 {
            log_debug!("[thread {}] Last follower done, waking up the leader.", self.id);
            if let Err(_e) = self.shared.leader_status.try_publish_one(LeaderStatus::Done) {
                log_error!(
                    "[thread {}] Failed to wake up the leader, the mutex was poisoned: {_e:?}",
                    self.id
                );
            }
        }
    }
}
