use super::mmap::{self, MmapTable};
use super::page::{Spte, SupplementalPageTable};
use super::{Pid, Result, VirtPage};
use crate::fs::FileHandle;
use crate::paging::PageManager;
use crate::sync::{Mutex, MutexGuard};
use crate::system::VmSystem;
use alloc::{sync::Arc, vec::Vec};

/// The paging state of one process.
///
/// Shared as an `Arc` so that frame table entries can refer back to their
/// owner weakly.
pub struct AddressSpace {
    pid: Pid,
    pub(crate) mmaps: Mutex<MmapTable>,
    pub(crate) spt: Mutex<SupplementalPageTable>,
    pub(crate) page_table: Mutex<PageManager>,
}

impl AddressSpace {
    pub fn new(pid: Pid) -> Arc<Self> {
        Arc::new(Self {
            pid,
            mmaps: Mutex::new(MmapTable::default()),
            spt: Mutex::new(SupplementalPageTable::new()),
            page_table: Mutex::new(PageManager::new()),
        })
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn spt(&self) -> MutexGuard<'_, SupplementalPageTable> {
        self.spt.lock()
    }

    pub fn page_table(&self) -> MutexGuard<'_, PageManager> {
        self.page_table.lock()
    }

    pub fn mmaps(&self) -> MutexGuard<'_, MmapTable> {
        self.mmaps.lock()
    }

    /// Registers a lazily loaded page of an executable segment. See
    /// [`SupplementalPageTable::register_file_backed`].
    pub fn register_file_backed(
        &self,
        file: FileHandle,
        offset: usize,
        page: VirtPage,
        read_len: usize,
        zero_len: usize,
        writable: bool,
    ) -> Result<()> {
        self.spt
            .lock()
            .register_file_backed(file, offset, page, read_len, zero_len, writable)
    }

    pub fn contains(&self, page: VirtPage) -> bool {
        self.spt.lock().contains(page)
    }

    pub fn is_loaded(&self, page: VirtPage) -> bool {
        self.spt.lock().lookup(page).is_some_and(Spte::is_loaded)
    }

    pub fn is_pinned(&self, page: VirtPage) -> bool {
        self.spt.lock().lookup(page).is_some_and(Spte::is_pinned)
    }

    /// Keeps `page` from being evicted until the guard is dropped. Returns
    /// `None` if the page is unknown.
    pub fn pin(&self, page: VirtPage) -> Option<PinGuard<'_>> {
        self.spt.lock().lookup_mut(page)?.pin();
        Some(PinGuard { space: self, page })
    }

    fn unpin(&self, page: VirtPage) {
        // The entry is gone if the page was unmapped while pinned.
        if let Some(spte) = self.spt.lock().lookup_mut(page) {
            spte.unpin();
        }
    }

    /// Releases everything the process holds: live memory maps are written
    /// back and unmapped, then every remaining frame and swap slot is freed.
    ///
    /// Must run before the last reference is dropped. Eviction reclaims the
    /// frames of a space dropped without it, but its swap slots stay
    /// allocated for the life of the [`VmSystem`].
    pub fn teardown(&self, sys: &VmSystem) {
        let maps = self.mmaps.lock().take_all();
        for (id, map) in maps.iter() {
            if let Err(e) = mmap::unmap_region(sys, self, map) {
                log::warn!("mmap: pid {} lost writes to mapping {}: {}", self.pid, id, e);
            }
        }

        let mut frames = Vec::new();
        let mut slots = Vec::new();
        {
            let mut spt = self.spt.lock();
            let mut page_table = self.page_table.lock();
            for (page, spte) in spt.drain() {
                if spte.is_loaded() {
                    let Some(frame) = page_table.translate(page) else {
                        panic!("page: loaded page {page} of pid {} is not mapped", self.pid);
                    };
                    page_table.clear(page);
                    frames.push(frame);
                } else if !spte.is_loading() {
                    // A page mid-load has its slot freed by the loading fault.
                    slots.extend(spte.source().swap_slot());
                }
            }
        }

        log::debug!(
            "page: pid {} torn down, {} frames and {} swap slots released",
            self.pid,
            frames.len(),
            slots.len()
        );
        for frame in frames {
            sys.frames.release(frame);
        }
        for slot in slots {
            sys.swap.free_slot(slot);
        }
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        let spt = self.spt.get_mut();
        if spt.is_empty() {
            return;
        }
        let slots = spt
            .iter()
            .filter(|(_, spte)| spte.source().swap_slot().is_some())
            .count();
        log::warn!(
            "page: pid {} dropped without teardown, leaking {} pages and {} swap slots",
            self.pid,
            spt.len(),
            slots
        );
    }
}

/// A pin on one page. Unpins when dropped.
#[must_use = "the page is unpinned as soon as the guard is dropped"]
pub struct PinGuard<'a> {
    space: &'a AddressSpace,
    page: VirtPage,
}

impl PinGuard<'_> {
    pub fn page(&self) -> VirtPage {
        self.page
    }
}

impl Drop for PinGuard<'_> {
    fn drop(&mut self) {
        self.space.unpin(self.page);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::{File, MemFile};
    use crate::system::test_util::system;
    use crate::vm::resolve_fault;
    use alloc::vec;
    use kidneyos_shared::mem::PAGE_FRAME_SIZE;

    const CODE: VirtPage = VirtPage::containing(0x0804_8000);

    #[test]
    fn pins_are_counted_and_scoped() {
        let space = AddressSpace::new(1);
        assert!(space.pin(CODE).is_none());
        space.spt().register_anonymous(CODE, true).unwrap();

        let outer = space.pin(CODE).unwrap();
        {
            let _inner = space.pin(CODE).unwrap();
            assert!(space.is_pinned(CODE));
        }
        assert!(space.is_pinned(CODE));
        drop(outer);
        assert!(!space.is_pinned(CODE));
    }

    #[test]
    fn pin_survives_removal() {
        let space = AddressSpace::new(1);
        space.spt().register_anonymous(CODE, true).unwrap();
        let guard = space.pin(CODE).unwrap();
        space.spt().remove(CODE);
        drop(guard);
        assert!(!space.contains(CODE));
    }

    #[test]
    fn teardown_frees_frames_and_slots() {
        let sys = system(2, 8);
        let space = AddressSpace::new(3);
        let pages: Vec<_> = (0..4).map(|i| CODE.add(i).unwrap()).collect();
        for &page in &pages {
            space.spt().register_anonymous(page, true).unwrap();
        }
        for &page in &pages {
            resolve_fault(&sys, &space, page).unwrap();
        }
        // Two frames: two of the four pages went to swap.
        assert_eq!(sys.swap.used_slots(), 2);
        assert_eq!(sys.frames.len(), 2);

        space.teardown(&sys);
        assert!(space.spt().is_empty());
        assert_eq!(space.page_table().mapped_count(), 0);
        assert_eq!(sys.swap.used_slots(), 0);
        assert!(sys.frames.is_empty());
        assert_eq!(sys.frames.allocator().free_count(), 2);
    }

    #[test]
    fn teardown_writes_back_mappings() {
        let sys = system(4, 8);
        let space = AddressSpace::new(4);
        let file = MemFile::handle(vec![b'a'; PAGE_FRAME_SIZE + 10]);
        let id = crate::vm::mmap(&sys, &space, &file, 0x1000_0000).unwrap();
        assert_eq!(id, 0);

        let addr = 0x1000_0000 + PAGE_FRAME_SIZE + 5;
        crate::mem::user::copy_to_user(&sys, &space, addr, b"Z", 0).unwrap();

        space.teardown(&sys);
        let mut byte = [0u8];
        file.read_at(&mut byte, PAGE_FRAME_SIZE + 5);
        assert_eq!(&byte, b"Z");
        assert!(space.mmaps().is_empty());
        assert!(sys.frames.is_empty());
    }

    #[test]
    fn swap_slots_need_teardown() {
        let sys = system(1, 8);
        let dropped = AddressSpace::new(5);
        let torn_down = AddressSpace::new(6);
        for space in [&torn_down, &dropped] {
            let pages: Vec<_> = (0..2).map(|i| CODE.add(i).unwrap()).collect();
            for &page in &pages {
                space.spt().register_anonymous(page, true).unwrap();
                resolve_fault(&sys, space, page).unwrap();
            }
        }
        // One frame: three of the four pages are in swap.
        assert_eq!(sys.swap.used_slots(), 3);

        torn_down.teardown(&sys);
        drop(torn_down);
        // `dropped` owns the resident page and one slot.
        assert_eq!(sys.swap.used_slots(), 1);
        assert_eq!(sys.frames.len(), 1);

        drop(dropped);
        let live = AddressSpace::new(7);
        live.spt().register_anonymous(CODE, true).unwrap();
        resolve_fault(&sys, &live, CODE).unwrap();
        // The orphaned frame is reclaimed; the orphaned slot is not.
        assert_eq!(sys.frames.stats().drops, 1);
        let frame = live.page_table().translate(CODE).unwrap();
        assert_eq!(sys.frames.owner_of(frame), Some((7, CODE)));
        assert_eq!(sys.swap.used_slots(), 1);
        live.teardown(&sys);
    }
}
