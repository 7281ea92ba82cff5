// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Physical frame allocation contract and a bitmap-backed pool
//! OWNERS: @kernel-mm-team
//! PUBLIC API: FrameAllocator, FramePool
//! INVARIANTS: Frames are PAGE_SIZE aligned; a frame is owned by at most one caller;
//!             freeing an unowned frame is ignored and reported

extern crate alloc;

use alloc::{vec, vec::Vec};
use spin::Mutex;

use super::page_table::PAGE_SIZE;
use crate::log_warn;

const WORD_BITS: usize = u64::BITS as usize;

/// Source of physical page frames.
///
/// Frames handed out for anonymous memory must read as zero once mapped; the pool
/// calls its scrub hook (if any) before returning them.
pub trait FrameAllocator: Send + Sync {
    /// Allocates `count` physically contiguous frames and returns the first address.
    fn allocate_frames(&self, count: usize) -> Option<usize>;

    /// Returns `count` frames starting at `pa` to the allocator.
    fn free_frames(&self, pa: usize, count: usize);
}

/// Bitmap allocator over the physical window `[base, base + frames * PAGE_SIZE)`.
pub struct FramePool {
    base: usize,
    frames: usize,
    scrub: Option<fn(usize, usize)>,
    state: Mutex<PoolState>,
}

struct PoolState {
    bitmap: Vec<u64>,
    next: usize,
    free: usize,
}

impl PoolState {
    fn is_used(&self, index: usize) -> bool {
        self.bitmap[index / WORD_BITS] & (1 << (index % WORD_BITS)) != 0
    }

    fn set(&mut self, index: usize, used: bool) {
        let word = &mut self.bitmap[index / WORD_BITS];
        let bit = 1u64 << (index % WORD_BITS);
        if used {
            *word |= bit;
        } else {
            *word &= !bit;
        }
    }
}

impl FramePool {
    /// Creates a pool managing `frames` frames starting at the page-aligned `base`.
    pub fn new(base: usize, frames: usize) -> Self {
        debug_assert!(base % PAGE_SIZE == 0, "frame pool base must be page aligned");
        let words = frames.div_ceil(WORD_BITS);
        Self {
            base,
            frames,
            scrub: None,
            state: Mutex::new(PoolState { bitmap: vec![0; words], next: 0, free: frames }),
        }
    }

    /// Installs a hook called with `(pa, len)` for every allocation before it is returned.
    pub fn with_scrub(mut self, scrub: fn(usize, usize)) -> Self {
        self.scrub = Some(scrub);
        self
    }

    /// Number of frames currently available.
    pub fn free_count(&self) -> usize {
        self.state.lock().free
    }

    /// Total number of frames managed by the pool.
    pub fn capacity(&self) -> usize {
        self.frames
    }

    /// Returns true if the frame at `pa` is currently handed out.
    pub fn is_allocated(&self, pa: usize) -> bool {
        match self.index_of(pa) {
            Some(index) => self.state.lock().is_used(index),
            None => false,
        }
    }

    fn index_of(&self, pa: usize) -> Option<usize> {
        if pa < self.base || (pa - self.base) % PAGE_SIZE != 0 {
            return None;
        }
        let index = (pa - self.base) / PAGE_SIZE;
        (index < self.frames).then_some(index)
    }
}

impl FrameAllocator for FramePool {
    fn allocate_frames(&self, count: usize) -> Option<usize> {
        if count == 0 || count > self.frames {
            return None;
        }
        let pa = {
            let mut state = self.state.lock();
            if state.free < count {
                return None;
            }
            // Next-fit scan, wrapping once around the window.
            let mut found = None;
            let mut scanned = 0;
            let mut start = state.next % self.frames;
            while scanned < self.frames {
                if start + count > self.frames {
                    scanned += self.frames - start;
                    start = 0;
                    continue;
                }
                match (start..start + count).find(|&i| state.is_used(i)) {
                    Some(used) => {
                        scanned += used + 1 - start;
                        start = (used + 1) % self.frames;
                    }
                    None => {
                        found = Some(start);
                        break;
                    }
                }
            }
            let first = found?;
            for index in first..first + count {
                state.set(index, true);
            }
            state.free -= count;
            state.next = (first + count) % self.frames;
            self.base + first * PAGE_SIZE
        };
        if let Some(scrub) = self.scrub {
            scrub(pa, count * PAGE_SIZE);
        }
        Some(pa)
    }

    fn free_frames(&self, pa: usize, count: usize) {
        let mut state = self.state.lock();
        for n in 0..count {
            let Some(index) = self.index_of(pa + n * PAGE_SIZE) else {
                log_warn!(target: "frame", "free of foreign frame {:#x}", pa + n * PAGE_SIZE);
                continue;
            };
            if !state.is_used(index) {
                log_warn!(target: "frame", "double free of frame {:#x}", pa + n * PAGE_SIZE);
                continue;
            }
            state.set(index, false);
            state.free += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicUsize, Ordering};

    const BASE: usize = 0x8000_0000;

    #[test]
    fn hands_out_distinct_aligned_frames() {
        let pool = FramePool::new(BASE, 4);
        let a = pool.allocate_frames(1).unwrap();
        let b = pool.allocate_frames(1).unwrap();
        assert_ne!(a, b);
        assert_eq!(a % PAGE_SIZE, 0);
        assert!(pool.is_allocated(a) && pool.is_allocated(b));
        assert_eq!(pool.free_count(), 2);
    }

    #[test]
    fn exhaustion_and_reuse() {
        let pool = FramePool::new(BASE, 2);
        let a = pool.allocate_frames(1).unwrap();
        let _b = pool.allocate_frames(1).unwrap();
        assert_eq!(pool.allocate_frames(1), None);
        pool.free_frames(a, 1);
        assert_eq!(pool.allocate_frames(1), Some(a));
    }

    #[test]
    fn contiguous_runs_skip_holes() {
        let pool = FramePool::new(BASE, 8);
        let first = pool.allocate_frames(3).unwrap();
        assert_eq!(first, BASE);
        pool.free_frames(first + PAGE_SIZE, 1);
        // The single-frame hole cannot satisfy a two-frame request.
        let run = pool.allocate_frames(2).unwrap();
        assert_eq!(run, BASE + 3 * PAGE_SIZE);
        assert_eq!(pool.allocate_frames(4), None);
        assert_eq!(pool.free_count(), 4);
    }

    #[test]
    fn double_and_foreign_frees_are_ignored() {
        let pool = FramePool::new(BASE, 2);
        let a = pool.allocate_frames(1).unwrap();
        pool.free_frames(a, 1);
        pool.free_frames(a, 1);
        pool.free_frames(0x1000, 1);
        assert_eq!(pool.free_count(), 2);
    }

    #[test]
    fn scrub_hook_sees_every_allocation() {
        static SCRUBBED: AtomicUsize = AtomicUsize::new(0);
        fn scrub(_pa: usize, len: usize) {
            SCRUBBED.fetch_add(len, Ordering::SeqCst);
        }
        let pool = FramePool::new(BASE, 4).with_scrub(scrub);
        pool.allocate_frames(2).unwrap();
        pool.allocate_frames(1).unwrap();
        assert_eq!(SCRUBBED.load(Ordering::SeqCst), 3 * PAGE_SIZE);
    }
}
