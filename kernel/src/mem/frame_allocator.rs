pub mod placement_algorithms;

use self::placement_algorithms::{NextFit, PlacementAlgorithm};
use super::{Frame, FrameAllocator, PageBuf};
use crate::sync::{Mutex, MutexGuard};
use alloc::boxed::Box;
use bitbybit::bitfield;
use kidneyos_shared::mem::PAGE_FRAME_SIZE;

#[bitfield(u8, default = 0)]
pub struct CoreMapEntry {
    #[bit(0, rw)]
    allocated: bool,
    // Set while the frame is known to hold only zeroes.
    #[bit(1, rw)]
    scrubbed: bool,
}

struct CoreMap<P> {
    entries: Box<[CoreMapEntry]>,
    placement_algorithm: P,
    frames_allocated: usize,
}

/// The user frame pool: a core map over a fixed array of frames.
pub struct UserPool<P: PlacementAlgorithm = NextFit> {
    core_map: Mutex<CoreMap<P>>,
    memory: Box<[Mutex<PageBuf>]>,
}

impl UserPool {
    /// A pool of `frame_count` zeroed frames using next-fit placement.
    pub fn new(frame_count: usize) -> Self {
        Self::with_placement(frame_count, NextFit::default())
    }
}

impl<P: PlacementAlgorithm> UserPool<P> {
    pub fn with_placement(frame_count: usize, placement_algorithm: P) -> Self {
        let entries = (0..frame_count)
            .map(|_| CoreMapEntry::DEFAULT.with_scrubbed(true))
            .collect();
        let memory = (0..frame_count)
            .map(|_| Mutex::new([0; PAGE_FRAME_SIZE]))
            .collect();

        Self {
            core_map: Mutex::new(CoreMap {
                entries,
                placement_algorithm,
                frames_allocated: 0,
            }),
            memory,
        }
    }
}

impl<P: PlacementAlgorithm + Send> FrameAllocator for UserPool<P> {
    fn try_allocate(&self, zero: bool) -> Option<Frame> {
        let mut core_map = self.core_map.lock();
        if core_map.frames_allocated == core_map.entries.len() {
            return None;
        }

        let CoreMap {
            entries,
            placement_algorithm,
            ..
        } = &mut *core_map;
        let range = placement_algorithm.place(&entries[..], 1)?;
        let index = range.start;

        let entry = entries[index];
        assert!(!entry.allocated());
        if zero && !entry.scrubbed() {
            self.memory[index].lock().fill(0);
        }
        entries[index] = entry.with_allocated(true).with_scrubbed(false);
        core_map.frames_allocated += 1;

        Some(Frame::new(index))
    }

    fn free(&self, frame: Frame) {
        let mut core_map = self.core_map.lock();
        let index = frame.number();
        assert!(index < core_map.entries.len(), "{frame} is not a user frame");
        assert!(core_map.entries[index].allocated(), "{frame} freed twice");

        core_map.entries[index] = core_map.entries[index].with_allocated(false);
        core_map.frames_allocated -= 1;
    }

    fn frame_count(&self) -> usize {
        self.memory.len()
    }

    fn free_count(&self) -> usize {
        let core_map = self.core_map.lock();
        core_map.entries.len() - core_map.frames_allocated
    }

    fn contents(&self, frame: Frame) -> MutexGuard<'_, PageBuf> {
        self.memory[frame.number()].lock()
    }
}

#[cfg(test)]
mod tests {
    use super::placement_algorithms::FirstFit;
    use super::*;

    #[test]
    fn allocate_until_exhausted() {
        let pool = UserPool::new(3);
        let frames: alloc::vec::Vec<_> = (0..3).map(|_| pool.try_allocate(false).unwrap()).collect();
        assert_eq!(frames, [Frame::new(0), Frame::new(1), Frame::new(2)]);
        assert_eq!(pool.free_count(), 0);
        assert!(pool.try_allocate(false).is_none());

        pool.free(Frame::new(1));
        assert_eq!(pool.free_count(), 1);
        assert_eq!(pool.try_allocate(false), Some(Frame::new(1)));
    }

    #[test]
    fn zeroing_dirty_frame() {
        let pool = UserPool::with_placement(1, FirstFit);
        let frame = pool.try_allocate(false).unwrap();
        pool.contents(frame).fill(0x5A);
        pool.free(frame);

        let frame = pool.try_allocate(false).unwrap();
        assert!(pool.contents(frame).iter().all(|&b| b == 0x5A));
        pool.free(frame);

        let frame = pool.try_allocate(true).unwrap();
        assert!(pool.contents(frame).iter().all(|&b| b == 0));
    }

    #[test]
    #[should_panic(expected = "freed twice")]
    fn double_free() {
        let pool = UserPool::new(2);
        let frame = pool.try_allocate(false).unwrap();
        pool.free(frame);
        pool.free(frame);
    }

    #[test]
    #[should_panic(expected = "is not a user frame")]
    fn free_out_of_range() {
        let pool = UserPool::new(2);
        pool.free(Frame::new(7));
    }
}
