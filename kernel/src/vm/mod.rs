//! Demand paging.
//!
//! User pages are materialised on first touch from a file, a swap slot or
//! zero-fill, and reclaimed by clock eviction when the user pool runs dry.
//!
//! - [`swap`]: slot allocation on the swap block device.
//! - [`frame`]: the frame table and the eviction scan.
//! - [`page`]: supplemental page table entries and where their bytes live.
//! - [`address_space`]: one process's tables, pinning and teardown.
//! - [`fault`]: page-fault resolution and stack growth.
//! - [`mmap`]: memory-mapped files.
//!
//! # Lock order
//!
//! Locks are always taken in this order, never the reverse:
//!
//! 1. the frame table
//! 2. an address space's memory-map table
//! 3. an address space's supplemental page table
//! 4. an address space's page table
//! 5. frame contents, the swap device, the file system lock
//!
//! The eviction scan holds the frame table while it inspects and flushes
//! another process's page, so nothing may wait on the frame table while
//! holding a supplemental page table. The fault path pins its page and drops
//! the supplemental page table before asking for a frame.

pub mod address_space;
pub mod fault;
pub mod frame;
pub mod mmap;
pub mod page;
pub mod swap;

pub use self::address_space::{AddressSpace, PinGuard};
pub use self::fault::{grow_stack, handle_page_fault, pin_and_resolve, resolve_fault};
pub use self::frame::{FrameStats, FrameTable};
pub use self::mmap::{mmap, munmap, MapId};
pub use self::page::{FileRegion, PageSource, Spte, SupplementalPageTable};
pub use self::swap::{SwapSlot, SwapSpace};
pub use crate::paging::VirtPage;

use crate::block::BlockError;
use thiserror::Error;

pub type Pid = u16;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    #[error("address {0:#x} is not a valid user address")]
    InvalidAddress(usize),
    #[error("access rights violation at {0:#x}")]
    ProtectionViolation(usize),
    #[error("write to read-only page {0}")]
    ReadOnly(VirtPage),
    #[error("stack would grow past its limit at {0:#x}")]
    StackLimit(usize),
    #[error("page {0} is already registered")]
    AlreadyMapped(VirtPage),
    #[error("short file read: wanted {wanted} bytes, got {got}")]
    ShortRead { wanted: usize, got: usize },
    #[error("short file write: wanted {wanted} bytes, wrote {wrote}")]
    ShortWrite { wanted: usize, wrote: usize },
    #[error("block I/O failed: {0}")]
    Block(#[from] BlockError),
    #[error("every resident frame is pinned")]
    FramesExhausted,
    #[error("invalid mmap request at {0:#x}")]
    BadMmap(usize),
    #[error("no memory mapping with id {0}")]
    NoSuchMapping(MapId),
    #[error("user string is longer than {0} bytes")]
    StringTooLong(usize),
    #[error("user string is not valid UTF-8")]
    BadUtf8,
}

pub type Result<T> = core::result::Result<T, VmError>;
