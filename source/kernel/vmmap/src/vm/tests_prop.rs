// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg(test)]
//! CONTEXT: Property-based tests for the mapping registry and demand paging
//! OWNERS: @kernel-mm-team
//! NOTE: Tests only; random map/unmap/touch sequences against a page-set model.
//!
//! TEST_SCOPE:
//!   - Registry stays ordered, disjoint and page granular
//!   - Mapped pages in the registry equal the model's mapped pages
//!   - Frames in use equal the model's resident pages (no leaks, no early frees)

extern crate alloc;

use alloc::{sync::Arc, vec::Vec};

use proptest::prelude::*;

use super::*;
use crate::config::VmConfig;
use crate::mm::{AddressSpace, FramePool, PAGE_SIZE};

const WINDOW: usize = 0x2000_0000;
const PAGES: usize = 16;
const FRAMES: usize = 32;

#[derive(Clone, Copy, Debug)]
enum Op {
    Map { page: usize, len: usize },
    Unmap { page: usize, len: usize },
    Touch { page: usize },
}

fn arb_span() -> impl Strategy<Value = (usize, usize)> {
    (0..PAGES).prop_flat_map(|page| (Just(page), 1..=PAGES - page))
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        arb_span().prop_map(|(page, len)| Op::Map { page, len }),
        arb_span().prop_map(|(page, len)| Op::Unmap { page, len }),
        (0..PAGES).prop_map(|page| Op::Touch { page }),
    ]
}

#[derive(Default)]
struct Model {
    mapped: [bool; PAGES],
    resident: [bool; PAGES],
}

proptest! {
    #[test]
    fn registry_matches_page_model(ops in proptest::collection::vec(arb_op(), 1..40)) {
        let pool = Arc::new(FramePool::new(0x8000_0000, FRAMES));
        let config = VmConfig::new(0x4000_0000, 0x8000_0000, 1, 64).unwrap();
        let space = AddressSpace::new(1, config, pool.clone());
        let mut model = Model::default();
        let flags = MapFlags::PRIVATE | MapFlags::ANONYMOUS | MapFlags::FIXED;

        for op in ops {
            match op {
                Op::Map { page, len } => {
                    let base = create_mapping(
                        &space,
                        WINDOW + page * PAGE_SIZE,
                        len * PAGE_SIZE,
                        Prot::READ | Prot::WRITE,
                        flags,
                        None,
                        0,
                    );
                    prop_assert_eq!(base, Ok(WINDOW + page * PAGE_SIZE));
                    for p in page..page + len {
                        model.mapped[p] = true;
                        model.resident[p] = false;
                    }
                }
                Op::Unmap { page, len } => {
                    prop_assert_eq!(
                        remove_mapping(&space, WINDOW + page * PAGE_SIZE, len * PAGE_SIZE),
                        Ok(())
                    );
                    for p in page..page + len {
                        model.mapped[p] = false;
                        model.resident[p] = false;
                    }
                }
                Op::Touch { page } => {
                    let outcome = resolve(
                        &space,
                        PageFault::new(WINDOW + page * PAGE_SIZE, FaultKind::NotPresent, Access::Write),
                    );
                    let expected = if model.mapped[page] {
                        FaultOutcome::Resolved
                    } else {
                        FaultOutcome::NotMine
                    };
                    prop_assert_eq!(outcome, expected);
                    if model.mapped[page] {
                        model.resident[page] = true;
                    }
                }
            }

            let state = space.lock();
            prop_assert_eq!(state.ranges().verify(), Ok(()));
            for p in 0..PAGES {
                let va = WINDOW + p * PAGE_SIZE;
                prop_assert_eq!(state.ranges().locate(va).is_some(), model.mapped[p]);
                prop_assert_eq!(state.page_table().translate(va).is_some(), model.resident[p]);
            }
            drop(state);
            let resident = model.resident.iter().filter(|r| **r).count();
            prop_assert_eq!(pool.free_count(), FRAMES - resident);
        }

        let listed: Vec<RangeInfo> = list_ranges(&space);
        let covered: usize = listed.iter().map(|r| r.length / PAGE_SIZE).sum();
        prop_assert_eq!(covered, model.mapped.iter().filter(|m| **m).count());
    }
}
