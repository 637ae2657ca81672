// Copyright 2024-2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

#![doc = include_str!("../README.md")]
#![forbid(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

mod backend;
pub mod config;
mod core;
mod identity;
mod macros;
mod state;
mod tools;

#[cfg(feature = "rayon")]
#[cfg_attr(docsrs, doc(cfg(feature = "rayon")))]
pub use backend::TaskArena;
pub use backend::{Backend, ChunkExecutor, Index, Sequential, ThreadTeam};
pub use config::{BackendKind, CpuPinningPolicy};
pub use identity::{is_parallel_scope, ThreadToken};
pub use state::{Initializer, ProcessState};
pub use tools::SmpTools;
