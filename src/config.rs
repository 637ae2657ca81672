// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Thread-count configuration and backend selection.
//!
//! The effective number of threads of a backend derives from three inputs: an
//! explicit request passed to [`Backend::initialize()`](crate::Backend::initialize),
//! an optional override read from the [`MAX_THREADS_ENV`] environment variable,
//! and the hardware concurrency. The resolution rules live in
//! [`resolve_thread_count()`], which all backends share.

use crate::macros::log_warn;
use std::num::NonZeroUsize;

/// Environment variable holding the maximum number of threads. When set to a
/// positive integer, it overrides any explicit thread count request.
pub const MAX_THREADS_ENV: &str = "PARALOOP_MAX_THREADS";

/// Environment variable naming the backend used by
/// [`SmpTools::new()`](crate::SmpTools::new). See [`BackendKind::from_name()`]
/// for the accepted names.
pub const BACKEND_ENV: &str = "PARALOOP_BACKEND";

/// Change to apply to a backend's thread count, as computed by
/// [`resolve_thread_count()`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadCountUpdate {
    /// Leave the current configuration untouched.
    Keep,
    /// Forget any explicit thread count and go back to the backend's default
    /// concurrency.
    Reset,
    /// Use the given number of threads, already clamped to the hardware
    /// concurrency.
    Set(NonZeroUsize),
}

/// Resolves a thread count request into an update of the backend's
/// configuration.
///
/// - If `env_override` is present, it wins over the explicit request.
/// - Otherwise a non-zero `requested` count is used.
/// - Otherwise (`requested == 0`), an explicit count previously applied is
///   cleared, and nothing happens if there was none.
///
/// Any count that ends up being applied is clamped to `hardware_max`.
///
/// ```
/// # use paraloop::config::{resolve_thread_count, ThreadCountUpdate};
/// # use std::num::NonZeroUsize;
/// let four = NonZeroUsize::new(4).unwrap();
/// assert_eq!(
///     resolve_thread_count(8, None, four, false),
///     ThreadCountUpdate::Set(four)
/// );
/// assert_eq!(
///     resolve_thread_count(8, NonZeroUsize::new(2), four, false),
///     ThreadCountUpdate::Set(NonZeroUsize::new(2).unwrap())
/// );
/// assert_eq!(resolve_thread_count(0, None, four, true), ThreadCountUpdate::Reset);
/// ```
pub fn resolve_thread_count(
    requested: usize,
    env_override: Option<NonZeroUsize>,
    hardware_max: NonZeroUsize,
    explicit_already_set: bool,
) -> ThreadCountUpdate {
    let wanted = match (env_override, NonZeroUsize::new(requested)) {
        (Some(from_env), _) => from_env,
        (None, Some(requested)) => requested,
        (None, None) => {
            return if explicit_already_set {
                ThreadCountUpdate::Reset
            } else {
                ThreadCountUpdate::Keep
            };
        }
    };
    ThreadCountUpdate::Set(wanted.min(hardware_max))
}

/// Parses the value of the [`MAX_THREADS_ENV`] variable.
///
/// Values that aren't a positive integer are treated as absent.
pub fn parse_max_threads(value: &str) -> Option<NonZeroUsize> {
    match value.trim().parse::<i64>() {
        Ok(count) if count > 0 => {
            // Counts beyond the address space are clamped like any other
            // excessive request.
            let count = usize::try_from(count).unwrap_or(usize::MAX);
            NonZeroUsize::new(count)
        }
        Ok(_count) => {
            log_warn!("Ignoring non-positive {MAX_THREADS_ENV}={_count}");
            None
        }
        Err(_e) => {
            log_warn!("Ignoring unparsable {MAX_THREADS_ENV}={value:?}: {_e}");
            None
        }
    }
}

/// Reads the thread count override from the environment.
pub fn max_threads_from_env() -> Option<NonZeroUsize> {
    std::env::var(MAX_THREADS_ENV)
        .ok()
        .and_then(|value| parse_max_threads(&value))
}

/// Returns the number of threads the hardware can run concurrently, as
/// reported by [`std::thread::available_parallelism()`], or 1 if it cannot be
/// determined.
pub fn hardware_concurrency() -> NonZeroUsize {
    std::thread::available_parallelism().unwrap_or_else(|_e| {
        log_warn!("Getting the available parallelism failed, assuming a single thread: {_e}");
        NonZeroUsize::MIN
    })
}

/// Policy to pin the threads of a [`ThreadTeam`](crate::ThreadTeam) to CPUs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CpuPinningPolicy {
    /// Don't pin team threads to CPUs.
    #[default]
    No,
    /// Pin each team thread to a CPU, if CPU pinning is supported and
    /// implemented on this platform.
    IfSupported,
    /// Pin each team thread to a CPU. If CPU pinning isn't supported on this
    /// platform (or not implemented), spawning a team will panic.
    Always,
}

/// The available parallel backends.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// Runs every region on the calling thread.
    Sequential,
    /// Runs regions on a team of threads entered at the start of each region.
    ThreadTeam,
    /// Runs regions as tasks of a work-stealing arena. Requires the `rayon`
    /// feature.
    TaskArena,
}

impl BackendKind {
    /// All backend kinds, whether they are compiled in or not.
    pub const ALL: [BackendKind; 3] = [
        BackendKind::Sequential,
        BackendKind::ThreadTeam,
        BackendKind::TaskArena,
    ];

    /// Parses a backend name, case-insensitively.
    ///
    /// ```
    /// # use paraloop::BackendKind;
    /// assert_eq!(BackendKind::from_name("team"), Some(BackendKind::ThreadTeam));
    /// assert_eq!(BackendKind::from_name(" Arena "), Some(BackendKind::TaskArena));
    /// assert_eq!(BackendKind::from_name("gpu"), None);
    /// ```
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "sequential" | "serial" => Some(BackendKind::Sequential),
            "team" | "thread-team" | "threadteam" => Some(BackendKind::ThreadTeam),
            "arena" | "task-arena" | "taskarena" => Some(BackendKind::TaskArena),
            _ => None,
        }
    }

    /// Canonical name of this backend, accepted by [`from_name()`](Self::from_name).
    pub fn name(self) -> &'static str {
        match self {
            BackendKind::Sequential => "sequential",
            BackendKind::ThreadTeam => "team",
            BackendKind::TaskArena => "arena",
        }
    }

    /// Whether this backend was compiled in.
    pub fn is_available(self) -> bool {
        match self {
            BackendKind::Sequential | BackendKind::ThreadTeam => true,
            BackendKind::TaskArena => cfg!(feature = "rayon"),
        }
    }

    /// The backend used when none is requested: the task arena if compiled in,
    /// the thread team otherwise.
    pub fn default_kind() -> Self {
        if BackendKind::TaskArena.is_available() {
            BackendKind::TaskArena
        } else {
            BackendKind::ThreadTeam
        }
    }

    /// Reads the backend requested by the [`BACKEND_ENV`] variable, falling
    /// back to [`default_kind()`](Self::default_kind) when the variable is
    /// absent, unknown, or names a backend that wasn't compiled in.
    pub fn from_env() -> Self {
        let Ok(value) = std::env::var(BACKEND_ENV) else {
            return Self::default_kind();
        };
        match Self::from_name(&value) {
            Some(kind) if kind.is_available() => kind,
            Some(_kind) => {
                log_warn!(
                    "Backend {:?} requested by {BACKEND_ENV} isn't compiled in, using the default",
                    _kind.name()
                );
                Self::default_kind()
            }
            None => {
                log_warn!("Unknown backend {value:?} requested by {BACKEND_ENV}, using the default");
                Self::default_kind()
            }
        }
    }
}
