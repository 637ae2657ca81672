// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::ptr::NonNull;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

/// A value guarded by a [`Mutex`], paired with a [`Condvar`] to wait for
/// changes of the value.
pub struct Signal<T> {
    mutex: Mutex<T>,
    condvar: Condvar,
}

impl<T> Signal<T> {
    /// Creates a new signal holding the given value.
    pub fn new(t: T) -> Self {
        Self {
            mutex: Mutex::new(t),
            condvar: Condvar::new(),
        }
    }

    /// Attempts to publish the given value and wakes up one waiting thread.
    ///
    /// Fails if the [`Mutex`] is poisoned.
    pub fn try_publish_one(&self, t: T) -> Result<(), PoisonError<MutexGuard<'_, T>>> {
        *self.mutex.lock()? = t;
        self.condvar.notify_one();
        Ok(())
    }

    /// Publishes the given value and wakes up all waiting threads.
    pub fn publish_all(&self, t: T) {
        *self.mutex.lock().unwrap() = t;
        self.condvar.notify_all();
    }

    /// Blocks until the predicate returns false on the current value, and
    /// returns a guard to inspect or update it.
    pub fn wait_while(&self, predicate: impl FnMut(&mut T) -> bool) -> MutexGuard<'_, T> {
        self.condvar
            .wait_while(self.mutex.lock().unwrap(), predicate)
            .unwrap()
    }
}

/// A family of types indexed by a lifetime.
///
/// Rust has no higher-kinded types, so a generic associated type stands in
/// for "`Of<'a>` for any `'a`".
pub trait LifetimeFamily {
    type Of<'a>: ?Sized;
}

/// A reference whose lifetime has been erased. It behaves as a
/// [`&'a F::Of<'a>`](reference) whose lifetime is chosen by the `unsafe`
/// [`get()`](Self::get) function.
pub struct ErasedRef<F: LifetimeFamily> {
    ptr: Option<NonNull<F::Of<'static>>>,
}

impl<F: LifetimeFamily> ErasedRef<F> {
    /// Creates an empty reference.
    pub fn empty() -> Self {
        Self { ptr: None }
    }

    /// Points to the given value. Callers of [`get()`](Self::get) must not let
    /// the obtained reference outlive the value set here.
    // The cast extends the lifetime to 'static.
    #[allow(clippy::unnecessary_cast)]
    pub fn set(&mut self, value: &F::Of<'_>) {
        self.ptr = NonNull::new(NonNull::from(value).as_ptr() as *mut F::Of<'static>);
    }

    /// Forgets the current value.
    pub fn clear(&mut self) {
        self.ptr = None;
    }

    /// Returns the value last passed to [`set()`](Self::set), or [`None`] if
    /// it was cleared since.
    ///
    /// # Safety
    ///
    /// The underlying value must stay alive and unmodified during the whole
    /// output lifetime.
    // The cast shrinks the lifetime back to 'a.
    #[allow(clippy::unnecessary_cast)]
    pub unsafe fn get<'a>(&self) -> Option<&'a F::Of<'a>> {
        self.ptr.map(|static_ptr| {
            let ptr = static_ptr.as_ptr() as *mut F::Of<'a>;
            // SAFETY:
            // - The pointer was derived from a valid reference in `set()`.
            // - The caller guarantees that the value outlives 'a and isn't mutated
            //   meanwhile.
            unsafe { &*ptr }
        })
    }
}

/// SAFETY:
///
/// An [`ErasedRef`] acts as a shared reference, so it can be sent to another
/// thread exactly when the referenced type is [`Sync`].
unsafe impl<F: LifetimeFamily> Send for ErasedRef<F> where for<'a> F::Of<'a>: Sync {}
/// SAFETY:
///
/// An [`ErasedRef`] acts as a shared reference, so it can be shared between
/// threads exactly when the referenced type is [`Sync`].
unsafe impl<F: LifetimeFamily> Sync for ErasedRef<F> where for<'a> F::Of<'a>: Sync {}
