// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use super::{Backend, ChunkExecutor, Index};
use crate::config::BackendKind;
use crate::core::region::Region;
use crate::identity::IdentityStack;
use crate::state::ProcessState;
use std::num::NonZeroUsize;

static STATE: ProcessState<Sequential> = ProcessState::new();

/// Backend running every chunk on the calling thread, in order.
pub struct Sequential {
    identities: IdentityStack,
}

impl Backend for Sequential {
    const KIND: BackendKind = BackendKind::Sequential;
    const NESTED_BY_DEFAULT: bool = false;

    fn new() -> Self {
        Self {
            identities: IdentityStack::new(),
        }
    }

    fn process_state() -> &'static ProcessState<Self> {
        &STATE
    }

    fn initialize_with(&self, _requested: usize, _env_override: Option<NonZeroUsize>) {}

    fn estimated_thread_count(&self) -> NonZeroUsize {
        NonZeroUsize::MIN
    }

    fn is_calling_thread(&self) -> bool {
        true
    }

    fn parallel_for(
        &self,
        first: Index,
        last: Index,
        grain: Index,
        executor: &dyn ChunkExecutor,
        _nested: bool,
    ) {
        if let Some(region) =
            Region::open(&self.identities, first, last, grain, NonZeroUsize::MIN, executor)
        {
            region.participate();
        }
    }

    fn open_regions(&self) -> usize {
        self.identities.depth()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_chunks_run_in_order() {
        let backend = Sequential::new();
        let starts = Mutex::new(Vec::new());
        backend.parallel_for(
            0,
            1000,
            0,
            &|from: Index, _: Index, _: Index| starts.lock().unwrap().push(from),
            false,
        );
        // A single thread gets 4 chunks of 250 indices.
        assert_eq!(starts.into_inner().unwrap(), [0, 250, 500, 750]);
    }

    #[test]
    fn test_thread_count_is_one() {
        let backend = Sequential::new();
        backend.initialize_with(8, NonZeroUsize::new(2));
        assert_eq!(backend.estimated_thread_count(), NonZeroUsize::MIN);
        assert!(backend.is_calling_thread());
    }

    #[test]
    fn test_region_is_open_during_chunks() {
        let backend = Sequential::new();
        backend.parallel_for(
            0,
            3,
            1,
            &|_: Index, _: Index, _: Index| assert_eq!(backend.open_regions(), 1),
            false,
        );
        assert_eq!(backend.open_regions(), 0);
    }
}
