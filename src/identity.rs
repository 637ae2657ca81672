// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Tracking of the thread that entered each parallel region.
//!
//! Algorithm code sometimes wants exactly one thread per region to perform a
//! side effect, such as reporting progress. The natural candidate is the thread
//! that called `parallel_for()`, which always participates in its own region.
//!
//! Each backend owns an [`IdentityStack`] with one entry per open region. The
//! entering thread pushes an entry before fanning out and pops it after all the
//! participants have rejoined. In addition, every participating thread records
//! the entry of the region whose chunks it is currently executing, so that
//! regions opened concurrently by unrelated threads, or nested inside each
//! other, each answer with their own entering thread.

use crate::macros::log_debug;
use std::cell::Cell;
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Process-unique identifier of an OS thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ThreadToken(NonZeroU64);

/// Next token to hand out. Starts at 1 so that tokens are never zero.
static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);
/// Next region identifier to hand out.
static NEXT_REGION: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static TOKEN: Cell<Option<ThreadToken>> = const { Cell::new(None) };
    static CURRENT_REGION: Cell<Option<RegionContext>> = const { Cell::new(None) };
}

impl ThreadToken {
    /// Returns the token of the current thread, assigning one on first use.
    pub fn current() -> Self {
        TOKEN.with(|token| match token.get() {
            Some(token) => token,
            None => {
                let fresh = NEXT_TOKEN.fetch_add(1, Ordering::Relaxed);
                // 2^64 thread creations aren't a practical concern.
                let fresh = ThreadToken(NonZeroU64::new(fresh).unwrap_or(NonZeroU64::MAX));
                token.set(Some(fresh));
                fresh
            }
        })
    }
}

/// An entry of the [`IdentityStack`]: one open region and the thread that
/// entered it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct RegionContext {
    id: u64,
    caller: ThreadToken,
}

impl RegionContext {
    /// Thread that entered this region.
    pub(crate) fn caller(&self) -> ThreadToken {
        self.caller
    }

    /// Process-unique identifier of this region.
    pub(crate) fn id(&self) -> u64 {
        self.id
    }
}

/// Stack of the regions currently open on a backend, in the order they were
/// entered.
///
/// Pushes and pops are serialized by a mutex held only for the duration of
/// the mutation, so that a region opened from inside a chunk of another region
/// never waits on its parent.
pub(crate) struct IdentityStack {
    entries: Mutex<Vec<RegionContext>>,
}

impl IdentityStack {
    pub(crate) fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Opens a region entered by the current thread.
    pub(crate) fn push(&self) -> RegionContext {
        let context = RegionContext {
            id: NEXT_REGION.fetch_add(1, Ordering::Relaxed),
            caller: ThreadToken::current(),
        };
        self.entries.lock().unwrap().push(context);
        context
    }

    /// Closes the given region.
    ///
    /// Regions opened by unrelated threads may close in any order, so the entry
    /// is searched from the top rather than assumed to be there.
    pub(crate) fn pop(&self, context: RegionContext) {
        let mut entries = self.entries.lock().unwrap();
        match entries.iter().rposition(|entry| *entry == context) {
            Some(position) => {
                entries.remove(position);
            }
            None => log_debug!("Region {context:?} was already closed"),
        }
    }

    /// Entering thread of the most recently opened region, if any.
    pub(crate) fn top(&self) -> Option<ThreadToken> {
        self.entries.lock().unwrap().last().map(RegionContext::caller)
    }

    /// Number of regions currently open.
    pub(crate) fn depth(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    /// Whether the current thread entered the region it is executing.
    ///
    /// Outside of any chunk, falls back to the innermost open region of this
    /// stack. Asking outside of any open region is a precondition violation,
    /// answered with `false`.
    pub(crate) fn is_calling_thread(&self) -> bool {
        let me = ThreadToken::current();
        match CURRENT_REGION.with(Cell::get) {
            Some(context) => context.caller == me,
            None => match self.top() {
                Some(caller) => caller == me,
                None => {
                    log_debug!("Asked for the calling thread outside of any parallel region");
                    false
                }
            },
        }
    }
}

/// Marks the current thread as executing chunks of a region, until dropped.
///
/// Scopes nest: dropping a scope restores the region the thread was executing
/// before, if any.
pub(crate) struct RegionScope {
    previous: Option<RegionContext>,
}

impl RegionScope {
    pub(crate) fn enter(context: RegionContext) -> Self {
        let previous = CURRENT_REGION.with(|current| current.replace(Some(context)));
        Self { previous }
    }
}

impl Drop for RegionScope {
    fn drop(&mut self) {
        CURRENT_REGION.with(|current| current.set(self.previous));
    }
}

/// Returns whether the current thread is executing chunks of a parallel region,
/// on any backend.
pub fn is_parallel_scope() -> bool {
    CURRENT_REGION.with(Cell::get).is_some()
}
