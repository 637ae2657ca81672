// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Process-wide backend state, shared by reference counting.

use crate::backend::Backend;
use crate::macros::log_debug;
use std::ops::Deref;
use std::sync::{Arc, Mutex};

/// A process-wide value created when the first handle is acquired and dropped
/// when the last handle is released.
///
/// Every backend keeps its global resources (thread team or arena, identity
/// stack, configuration lock) in one of these, in a `static`.
pub struct ProcessState<T> {
    slot: Mutex<Slot<T>>,
}

struct Slot<T> {
    /// Number of outstanding handles.
    count: usize,
    /// The shared value, present iff `count > 0`.
    value: Option<Arc<T>>,
}

impl<T> ProcessState<T> {
    /// Creates an empty state, suitable for a `static`.
    pub const fn new() -> Self {
        Self {
            slot: Mutex::new(Slot {
                count: 0,
                value: None,
            }),
        }
    }

    /// Acquires a handle to the shared value, creating it with `init` if there
    /// is no outstanding handle.
    ///
    /// Every call must be balanced by a call to [`release()`](Self::release).
    pub fn acquire(&self, init: impl FnOnce() -> T) -> Arc<T> {
        let mut slot = self.slot.lock().unwrap();
        slot.count += 1;
        match &slot.value {
            Some(value) => value.clone(),
            None => {
                debug_assert_eq!(slot.count, 1);
                let value = Arc::new(init());
                slot.value = Some(value.clone());
                value
            }
        }
    }

    /// Releases a handle. The shared value is dropped once the last handle
    /// (and the last [`Arc`] obtained from [`acquire()`](Self::acquire)) is
    /// gone.
    pub fn release(&self) {
        // The value is moved out of the critical section, so that a backend
        // joining its threads on drop doesn't block other acquisitions.
        let released = {
            let mut slot = self.slot.lock().unwrap();
            debug_assert!(slot.count > 0, "unbalanced release of a process state");
            slot.count = slot.count.saturating_sub(1);
            if slot.count == 0 {
                slot.value.take()
            } else {
                None
            }
        };
        drop(released);
    }

    /// Number of outstanding handles.
    pub fn handle_count(&self) -> usize {
        self.slot.lock().unwrap().count
    }
}

impl<T> Default for ProcessState<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Reference-counted handle keeping a backend's process-wide state alive.
///
/// The first handle of a backend allocates its state, and dropping the last
/// one tears it down. Cloning a handle acquires the state again.
///
/// ```
/// # use paraloop::{Backend, Initializer, Sequential};
/// let first = Initializer::<Sequential>::acquire();
/// let second = first.clone();
/// assert!(Initializer::ptr_eq(&first, &second));
/// assert_eq!(second.estimated_thread_count().get(), 1);
/// ```
pub struct Initializer<B: Backend> {
    backend: Arc<B>,
}

impl<B: Backend> Initializer<B> {
    /// Acquires the process-wide state of backend `B`.
    pub fn acquire() -> Self {
        let backend = B::process_state().acquire(|| {
            log_debug!("Allocating the process-wide state of the {:?} backend", B::KIND);
            B::new()
        });
        Self { backend }
    }

    /// Whether two handles refer to the same state.
    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        Arc::ptr_eq(&this.backend, &other.backend)
    }
}

impl<B: Backend> Clone for Initializer<B> {
    fn clone(&self) -> Self {
        let backend = B::process_state().acquire(B::new);
        debug_assert!(Arc::ptr_eq(&backend, &self.backend));
        Self { backend }
    }
}

impl<B: Backend> Drop for Initializer<B> {
    fn drop(&mut self) {
        B::process_state().release();
    }
}

impl<B: Backend> Deref for Initializer<B> {
    type Target = B;

    fn deref(&self) -> &B {
        &self.backend
    }
}
