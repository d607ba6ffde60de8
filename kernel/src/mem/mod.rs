//! Physical memory handed to user processes.
//!
//! Frames are identified by number. The bytes of a frame are reached through
//! [`FrameAllocator::contents`], which hands out a lock on the frame so that
//! hosted builds can model physical memory without raw pointers.

pub mod frame_allocator;
pub mod user;

pub use frame_allocator::{CoreMapEntry, UserPool};

use crate::sync::MutexGuard;
use core::fmt;
use kidneyos_shared::mem::PAGE_FRAME_SIZE;

/// The contents of one physical frame.
pub type PageBuf = [u8; PAGE_FRAME_SIZE];

/// A physical frame number.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Frame(usize);

impl Frame {
    pub const fn new(number: usize) -> Self {
        Self(number)
    }

    pub const fn number(self) -> usize {
        self.0
    }

    /// The frame after this one, used to advance the eviction hand.
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "frame #{}", self.0)
    }
}

/// Source of physical frames for user pages.
pub trait FrameAllocator: Send + Sync {
    /// Takes a free frame, zeroing it first if `zero` is set. Returns `None`
    /// when physical memory is exhausted; never blocks.
    fn try_allocate(&self, zero: bool) -> Option<Frame>;

    /// Returns `frame` to the free pool.
    ///
    /// Panics if `frame` is out of range or not allocated.
    fn free(&self, frame: Frame);

    /// Total frames managed.
    fn frame_count(&self) -> usize;

    /// Frames currently free.
    fn free_count(&self) -> usize;

    /// Locked access to the bytes of `frame`.
    fn contents(&self, frame: Frame) -> MutexGuard<'_, PageBuf>;
}
