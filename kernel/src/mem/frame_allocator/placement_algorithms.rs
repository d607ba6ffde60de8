//! Frame placement policies for the user pool.

use super::CoreMapEntry;
use core::ops::Range;

/// A placement algorithm for allocating frames.
pub trait PlacementAlgorithm: Default {
    /// Returns a range indicating the frame numbers to be allocated, or `None`
    /// if a sufficiently large range of free frames cannot be found.
    fn place(&mut self, core_map: &[CoreMapEntry], frames_requested: usize)
        -> Option<Range<usize>>;
}

/// Resume searching where the previous allocation ended.
///
/// Spreads user pages over the pool, so a freshly freed frame is not handed
/// straight back out.
#[derive(Default)]
pub struct NextFit {
    /// The next frame number to start searching for free frames.
    position: usize,
}

// No internal state. Zero-sized.
#[derive(Default)]
pub struct FirstFit;

/// Counts free frames starting at `start`, stopping once `frames_requested`
/// have been found.
fn free_run(core_map: &[CoreMapEntry], start: usize, frames_requested: usize) -> usize {
    let mut block_size = 0;
    while block_size < frames_requested && !core_map[start + block_size].allocated() {
        block_size += 1;
    }
    block_size
}

impl PlacementAlgorithm for NextFit {
    fn place(
        &mut self,
        core_map: &[CoreMapEntry],
        frames_requested: usize,
    ) -> Option<Range<usize>> {
        let total_frames = core_map.len();
        if total_frames == 0 {
            return None;
        }

        let mut block_start_ind = self.position;
        let mut wrapped_around = false;

        while !(wrapped_around && block_start_ind >= self.position) {
            if block_start_ind + frames_requested > total_frames {
                // A second wrap would loop forever on oversized requests.
                if wrapped_around {
                    break;
                }
                block_start_ind = 0;
                wrapped_around = true;
                continue;
            }

            let block_size = free_run(core_map, block_start_ind, frames_requested);
            if block_size == frames_requested {
                self.position = (block_start_ind + block_size) % total_frames;
                return Some(block_start_ind..(block_start_ind + block_size));
            }
            // Previous block too small, keep searching starting from one past the allocated frame
            block_start_ind += block_size + 1;
        }

        None
    }
}

impl PlacementAlgorithm for FirstFit {
    fn place(
        &mut self,
        core_map: &[CoreMapEntry],
        frames_requested: usize,
    ) -> Option<Range<usize>> {
        let total_frames = core_map.len();

        let mut block_start_ind = 0;

        while block_start_ind + frames_requested <= total_frames {
            let block_size = free_run(core_map, block_start_ind, frames_requested);
            if block_size == frames_requested {
                return Some(block_start_ind..(block_start_ind + block_size));
            }
            block_start_ind += block_size + 1;
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Fills the coremap entries in `range` to indicate they are allocated.
    fn fill_coremap_range(core_map: &mut [CoreMapEntry], range: &Range<usize>) {
        for i in range.clone() {
            assert!(!core_map[i].allocated());
            core_map[i] = core_map[i].with_allocated(true);
        }
    }

    #[test]
    fn test_next_fit() {
        let mut core_map = [CoreMapEntry::default(); 16];
        fill_coremap_range(&mut core_map, &(1..4));
        fill_coremap_range(&mut core_map, &(8..12));
        fill_coremap_range(&mut core_map, &(14..16));

        // Frames left are 0, 4-7, 12-13 (inclusive)

        let mut algorithm: NextFit = Default::default();
        assert_eq!(algorithm.place(&core_map, 4), Some(4..8));
        fill_coremap_range(&mut core_map, &(4..8));

        // Next allocation should start from position 8
        assert_eq!(algorithm.place(&core_map, 1), Some(12..13));
        fill_coremap_range(&mut core_map, &(12..13));

        assert_eq!(algorithm.place(&core_map, 2), None);
    }

    #[test]
    fn test_next_fit_wrap_around() {
        let mut core_map = [CoreMapEntry::default(); 16];
        let mut algorithm = NextFit { position: 8 };
        fill_coremap_range(&mut core_map, &(0..1));
        assert_eq!(algorithm.place(&core_map, 16), None);
        assert_eq!(algorithm.place(&core_map, 15), Some(1..16));
    }

    #[test]
    fn test_next_fit_single_frames_cycle() {
        let mut core_map = [CoreMapEntry::default(); 3];
        let mut algorithm = NextFit::default();
        assert_eq!(algorithm.place(&core_map, 1), Some(0..1));
        fill_coremap_range(&mut core_map, &(0..1));
        assert_eq!(algorithm.place(&core_map, 1), Some(1..2));
        fill_coremap_range(&mut core_map, &(1..2));
        assert_eq!(algorithm.place(&core_map, 1), Some(2..3));
        fill_coremap_range(&mut core_map, &(2..3));
        assert_eq!(algorithm.place(&core_map, 1), None);

        core_map[1] = core_map[1].with_allocated(false);
        assert_eq!(algorithm.place(&core_map, 1), Some(1..2));
    }

    #[test]
    fn test_first_fit() {
        let mut core_map = [CoreMapEntry::default(); 16];
        fill_coremap_range(&mut core_map, &(2..4));
        fill_coremap_range(&mut core_map, &(8..13));
        fill_coremap_range(&mut core_map, &(15..16));

        // Frames left are 0-1, 4-7, 13-14 (inclusive)

        let mut algorithm = FirstFit;
        assert_eq!(algorithm.place(&core_map, 4), Some(4..8));
        fill_coremap_range(&mut core_map, &(4..8));

        // If we want 2 frames, the algo should pick first fit, i.e. 0-1
        assert_eq!(algorithm.place(&core_map, 2), Some(0..2));
        fill_coremap_range(&mut core_map, &(0..2));

        assert_eq!(algorithm.place(&core_map, 3), None);
    }
}
