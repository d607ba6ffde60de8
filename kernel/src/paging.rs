//! Per-process page tables.
//!
//! The VM core treats the page table as an index it can install into, clear
//! and query. Entries use the hardware [`PageTableEntry`] layout so the
//! accessed and dirty bits behave the way the MMU reports them.

use crate::mem::Frame;
use alloc::collections::BTreeMap;
use core::fmt;
use kidneyos_shared::{
    mem::{is_page_aligned, is_user_vaddr, page_round_down, PAGE_FRAME_SIZE},
    paging::PageTableEntry,
};

/// A page-aligned user virtual address.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VirtPage(usize);

impl VirtPage {
    /// The page containing `addr`.
    pub const fn containing(addr: usize) -> Self {
        Self(page_round_down(addr))
    }

    /// `addr` as a page, if it is page-aligned.
    pub const fn from_aligned(addr: usize) -> Option<Self> {
        if is_page_aligned(addr) {
            Some(Self(addr))
        } else {
            None
        }
    }

    pub const fn addr(self) -> usize {
        self.0
    }

    /// The page `n` pages above this one.
    pub fn add(self, n: usize) -> Option<Self> {
        n.checked_mul(PAGE_FRAME_SIZE)
            .and_then(|bytes| self.0.checked_add(bytes))
            .map(Self)
    }

    pub const fn is_user(self) -> bool {
        is_user_vaddr(self.0)
    }
}

impl fmt::Display for VirtPage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// A software page table for one address space.
#[derive(Default)]
pub struct PageManager {
    entries: BTreeMap<VirtPage, PageTableEntry>,
}

impl PageManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps `page` to `frame`. Returns `false`, leaving the table unchanged,
    /// if `page` is already mapped.
    pub fn install(&mut self, page: VirtPage, frame: Frame, writable: bool) -> bool {
        if self.entries.get(&page).is_some_and(|pte| pte.present()) {
            return false;
        }
        self.entries
            .insert(page, PageTableEntry::user_mapping(frame.number(), writable));
        true
    }

    /// Removes the mapping for `page`, if any.
    pub fn clear(&mut self, page: VirtPage) {
        self.entries.remove(&page);
    }

    fn present(&self, page: VirtPage) -> Option<&PageTableEntry> {
        self.entries.get(&page).filter(|pte| pte.present())
    }

    fn update(&mut self, page: VirtPage, f: impl FnOnce(PageTableEntry) -> PageTableEntry) {
        if let Some(pte) = self.entries.get_mut(&page) {
            *pte = f(*pte);
        }
    }

    pub fn translate(&self, page: VirtPage) -> Option<Frame> {
        self.present(page).map(|pte| Frame::new(pte.frame_number()))
    }

    pub fn is_writable(&self, page: VirtPage) -> bool {
        self.present(page).is_some_and(|pte| pte.read_write())
    }

    pub fn is_accessed(&self, page: VirtPage) -> bool {
        self.present(page).is_some_and(|pte| pte.accessed())
    }

    pub fn set_accessed(&mut self, page: VirtPage, accessed: bool) {
        self.update(page, |pte| pte.with_accessed(accessed));
    }

    pub fn clear_accessed(&mut self, page: VirtPage) {
        self.set_accessed(page, false);
    }

    pub fn is_dirty(&self, page: VirtPage) -> bool {
        self.present(page).is_some_and(|pte| pte.dirty())
    }

    pub fn set_dirty(&mut self, page: VirtPage, dirty: bool) {
        self.update(page, |pte| pte.with_dirty(dirty));
    }

    /// Number of present mappings.
    pub fn mapped_count(&self) -> usize {
        self.entries.values().filter(|pte| pte.present()).count()
    }
}
