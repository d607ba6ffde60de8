//! Supplemental page table.
//!
//! One entry per user page the process knows about but the hardware may not
//! map: where the bytes come from, whether the page may be written, whether a
//! frame currently holds it and how many pins keep it from being evicted.

use super::{MapId, Result, SwapSlot, VirtPage, VmError};
use crate::fs::FileHandle;
use crate::mem::PageBuf;
use crate::sync::Mutex;
use alloc::collections::BTreeMap;
use core::fmt;
use kidneyos_shared::mem::PAGE_FRAME_SIZE;

/// A page-sized window onto a file.
#[derive(Clone)]
pub struct FileRegion {
    pub file: FileHandle,
    pub offset: usize,
    /// Bytes read from the file at `offset`.
    pub read_len: usize,
    /// Bytes zeroed after the file data. Loading always zeroes the rest of
    /// the page, so this is informational.
    pub zero_len: usize,
}

impl FileRegion {
    /// Fills `page` from the file, zeroing everything past `read_len`.
    pub fn load(&self, page: &mut PageBuf, filesys_lock: &Mutex<()>) -> Result<()> {
        if self.read_len > 0 {
            let got = {
                let _fs = filesys_lock.lock();
                self.file.read_at(&mut page[..self.read_len], self.offset)
            };
            if got != self.read_len {
                return Err(VmError::ShortRead {
                    wanted: self.read_len,
                    got,
                });
            }
        }
        page[self.read_len..].fill(0);
        Ok(())
    }

    /// Writes the file-backed part of `page` back to the file.
    pub fn write_back(&self, page: &PageBuf, filesys_lock: &Mutex<()>) -> Result<()> {
        let wrote = {
            let _fs = filesys_lock.lock();
            self.file.write_at(&page[..self.read_len], self.offset)
        };
        if wrote != self.read_len {
            return Err(VmError::ShortWrite {
                wanted: self.read_len,
                wrote,
            });
        }
        Ok(())
    }
}

/// Where a page's contents live while it is not resident.
#[derive(Clone)]
pub enum PageSource {
    /// A segment of an executable. Reloaded from the file while clean; a
    /// dirty page becomes [`PageSource::SwapBacked`] when evicted.
    FileBacked(FileRegion),
    /// A memory-mapped file. Dirty pages are written back to the file.
    Mmapped { region: FileRegion, map: MapId },
    /// Anonymous memory. `slot` holds the page while it is swapped out;
    /// `None` means it has never left memory and loads as zeroes.
    SwapBacked { slot: Option<SwapSlot> },
}

impl PageSource {
    pub fn region(&self) -> Option<&FileRegion> {
        match self {
            PageSource::FileBacked(region) | PageSource::Mmapped { region, .. } => Some(region),
            PageSource::SwapBacked { .. } => None,
        }
    }

    pub fn swap_slot(&self) -> Option<SwapSlot> {
        match self {
            PageSource::SwapBacked { slot } => *slot,
            _ => None,
        }
    }

    /// Whether loading this page needs a zeroed frame rather than one that
    /// will be fully overwritten.
    pub fn needs_zeroed_frame(&self) -> bool {
        match self {
            PageSource::FileBacked(region) | PageSource::Mmapped { region, .. } => {
                region.read_len == 0
            }
            PageSource::SwapBacked { slot } => slot.is_none(),
        }
    }
}

impl fmt::Display for PageSource {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PageSource::FileBacked(region) => write!(f, "file@{:#x}", region.offset),
            PageSource::Mmapped { region, map } => write!(f, "mmap {}@{:#x}", map, region.offset),
            PageSource::SwapBacked { slot: Some(slot) } => write!(f, "swap slot {}", slot),
            PageSource::SwapBacked { slot: None } => write!(f, "anonymous"),
        }
    }
}

/// A supplemental page table entry.
#[derive(Clone)]
pub struct Spte {
    pub(crate) source: PageSource,
    pub(crate) writable: bool,
    /// A frame holds this page and the page table maps it.
    pub(crate) loaded: bool,
    /// A fault is filling a frame for this page. Other faults on the page
    /// wait for it instead of loading a second copy.
    pub(crate) loading: bool,
    pub(crate) pins: u32,
}

impl Spte {
    pub fn new(source: PageSource, writable: bool) -> Self {
        Self {
            source,
            writable,
            loaded: false,
            loading: false,
            pins: 0,
        }
    }

    pub fn source(&self) -> &PageSource {
        &self.source
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn is_loading(&self) -> bool {
        self.loading
    }

    pub fn is_pinned(&self) -> bool {
        self.pins > 0
    }

    pub(crate) fn pin(&mut self) {
        self.pins += 1;
    }

    pub(crate) fn unpin(&mut self) {
        assert!(self.pins > 0, "page: unpinning an unpinned page");
        self.pins -= 1;
    }
}

/// Per-process map from user page to [`Spte`].
#[derive(Default)]
pub struct SupplementalPageTable {
    entries: BTreeMap<VirtPage, Spte>,
}

impl SupplementalPageTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, page: VirtPage) -> Option<&Spte> {
        self.entries.get(&page)
    }

    pub fn lookup_mut(&mut self, page: VirtPage) -> Option<&mut Spte> {
        self.entries.get_mut(&page)
    }

    pub fn contains(&self, page: VirtPage) -> bool {
        self.entries.contains_key(&page)
    }

    /// Adds `spte` for `page`. Fails if `page` already has an entry.
    ///
    /// Panics if `page` is not a user page.
    pub fn insert(&mut self, page: VirtPage, spte: Spte) -> Result<()> {
        assert!(page.is_user(), "page: {page} is not a user page");
        if self.entries.contains_key(&page) {
            return Err(VmError::AlreadyMapped(page));
        }
        log::trace!("page: registered {} ({})", page, spte.source);
        self.entries.insert(page, spte);
        Ok(())
    }

    /// Registers a lazily loaded page of an executable segment.
    ///
    /// Panics if `read_len` exceeds a page.
    pub fn register_file_backed(
        &mut self,
        file: FileHandle,
        offset: usize,
        page: VirtPage,
        read_len: usize,
        zero_len: usize,
        writable: bool,
    ) -> Result<()> {
        assert!(read_len <= PAGE_FRAME_SIZE, "page: read length {read_len}");
        let region = FileRegion {
            file,
            offset,
            read_len,
            zero_len,
        };
        self.insert(page, Spte::new(PageSource::FileBacked(region), writable))
    }

    /// Registers one page of memory-mapped file `map`. Mapped pages are
    /// always writable.
    ///
    /// Panics if `read_len` exceeds a page.
    pub fn register_mmap(
        &mut self,
        file: FileHandle,
        offset: usize,
        page: VirtPage,
        read_len: usize,
        zero_len: usize,
        map: MapId,
    ) -> Result<()> {
        assert!(read_len <= PAGE_FRAME_SIZE, "page: read length {read_len}");
        let region = FileRegion {
            file,
            offset,
            read_len,
            zero_len,
        };
        self.insert(page, Spte::new(PageSource::Mmapped { region, map }, true))
    }

    /// Registers an anonymous page that loads as zeroes.
    pub fn register_anonymous(&mut self, page: VirtPage, writable: bool) -> Result<()> {
        self.insert(page, Spte::new(PageSource::SwapBacked { slot: None }, writable))
    }

    pub fn remove(&mut self, page: VirtPage) -> Option<Spte> {
        self.entries.remove(&page)
    }

    /// Empties the table, returning every entry.
    pub fn drain(&mut self) -> BTreeMap<VirtPage, Spte> {
        core::mem::take(&mut self.entries)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (VirtPage, &Spte)> {
        self.entries.iter().map(|(page, spte)| (*page, spte))
    }
}
