//! Memory-mapped files.
//!
//! A mapping covers a whole file starting at a page-aligned address. Its
//! pages load lazily like any other file page; dirty pages go back to the
//! file on eviction, on `munmap` and at teardown.

use super::page::FileRegion;
use super::{AddressSpace, Result, VirtPage, VmError};
use crate::fs::FileHandle;
use crate::system::VmSystem;
use alloc::{collections::BTreeMap, vec::Vec};
use core::cmp::min;
use kidneyos_shared::mem::{is_page_aligned, OFFSET, PAGE_FRAME_SIZE};

/// Identifies a mapping within one process.
pub type MapId = usize;

pub struct MemoryMap {
    file: FileHandle,
    base: VirtPage,
    pages: usize,
}

impl MemoryMap {
    pub fn base(&self) -> VirtPage {
        self.base
    }

    pub fn page_count(&self) -> usize {
        self.pages
    }

    pub fn file(&self) -> &FileHandle {
        &self.file
    }

    fn pages(&self) -> impl Iterator<Item = VirtPage> {
        let base = self.base.addr();
        (0..self.pages).map(move |i| VirtPage::containing(base + i * PAGE_FRAME_SIZE))
    }
}

/// The live mappings of one process.
#[derive(Default)]
pub struct MmapTable {
    maps: BTreeMap<MapId, MemoryMap>,
    next_id: MapId,
}

impl MmapTable {
    pub fn get(&self, id: MapId) -> Option<&MemoryMap> {
        self.maps.get(&id)
    }

    pub fn len(&self) -> usize {
        self.maps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }

    pub(crate) fn take_all(&mut self) -> BTreeMap<MapId, MemoryMap> {
        core::mem::take(&mut self.maps)
    }
}

/// Maps all of `file` at `addr`.
///
/// Fails if `addr` is zero or unaligned, if the file is empty, if the range
/// reaches the stack region or kernel space, or if it overlaps a page the
/// process already has.
pub fn mmap(sys: &VmSystem, space: &AddressSpace, file: &FileHandle, addr: usize) -> Result<MapId> {
    let bad = VmError::BadMmap(addr);
    if addr == 0 || !is_page_aligned(addr) {
        return Err(bad);
    }

    let (file, len) = {
        let _fs = sys.filesys_lock.lock();
        let file = file.reopen();
        let len = file.length();
        (file, len)
    };
    if len == 0 {
        return Err(bad);
    }

    let pages = len.div_ceil(PAGE_FRAME_SIZE);
    let stack_bottom = OFFSET.saturating_sub(sys.config.max_stack_size);
    let end = pages
        .checked_mul(PAGE_FRAME_SIZE)
        .and_then(|bytes| addr.checked_add(bytes));
    if !end.is_some_and(|end| end <= stack_bottom) {
        return Err(bad);
    }

    let map = MemoryMap {
        file,
        base: VirtPage::containing(addr),
        pages,
    };

    let mut mmaps = space.mmaps.lock();
    let id = mmaps.next_id;
    {
        let mut spt = space.spt.lock();
        if map.pages().any(|page| spt.contains(page)) {
            return Err(bad);
        }
        for (i, page) in map.pages().enumerate() {
            let offset = i * PAGE_FRAME_SIZE;
            let read_len = min(PAGE_FRAME_SIZE, len - offset);
            spt.register_mmap(
                map.file.clone(),
                offset,
                page,
                read_len,
                PAGE_FRAME_SIZE - read_len,
                id,
            )?;
        }
    }

    log::debug!(
        "mmap: pid {} mapped {} pages at {} as {}",
        space.pid(),
        pages,
        map.base,
        id
    );
    mmaps.maps.insert(id, map);
    mmaps.next_id += 1;
    Ok(id)
}

/// Removes mapping `id`, writing dirty pages back to the file.
pub fn munmap(sys: &VmSystem, space: &AddressSpace, id: MapId) -> Result<()> {
    let map = space
        .mmaps
        .lock()
        .maps
        .remove(&id)
        .ok_or(VmError::NoSuchMapping(id))?;

    log::debug!("mmap: pid {} unmapping {}", space.pid(), id);
    unmap_region(sys, space, &map)
}

/// Drops every page of `map` from the tables, then writes back the dirty
/// ones and frees their frames. Every frame is released even if a write-back
/// fails; the first failure is returned.
pub(crate) fn unmap_region(sys: &VmSystem, space: &AddressSpace, map: &MemoryMap) -> Result<()> {
    let mut resident: Vec<(crate::mem::Frame, Option<FileRegion>)> = Vec::new();
    {
        let mut spt = space.spt.lock();
        let mut page_table = space.page_table.lock();
        for page in map.pages() {
            let Some(spte) = spt.remove(page) else {
                continue;
            };
            if !spte.is_loaded() {
                continue;
            }
            let Some(frame) = page_table.translate(page) else {
                panic!("mmap: loaded page {page} of pid {} is not mapped", space.pid());
            };
            let dirty = page_table.is_dirty(page);
            page_table.clear(page);
            let region = spte.source().region().filter(|_| dirty).cloned();
            resident.push((frame, region));
        }
    }

    let mut result = Ok(());
    for (frame, region) in resident {
        if let Some(region) = region {
            let written = region.write_back(&sys.frames.allocator().contents(frame), &sys.filesys_lock);
            result = result.and(written);
        }
        sys.frames.release(frame);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::{File, MemFile};
    use crate::mem::user;
    use crate::system::test_util::system;
    use crate::vm::resolve_fault;
    use alloc::vec;
    use kidneyos_shared::mem::MAX_STACK_SIZE;

    const ADDR: usize = 0x1000_0000;

    fn file_of(len: usize) -> FileHandle {
        MemFile::handle((0..len).map(|i| (i % 251) as u8).collect::<Vec<u8>>())
    }

    #[test]
    fn maps_whole_file_lazily() {
        let sys = system(4, 4);
        let space = AddressSpace::new(1);
        let file = file_of(PAGE_FRAME_SIZE + 100);

        let id = mmap(&sys, &space, &file, ADDR).unwrap();
        assert_eq!(id, 0);
        assert_eq!(space.mmaps().get(id).unwrap().page_count(), 2);
        assert_eq!(space.spt().len(), 2);
        assert!(sys.frames.is_empty());

        let mut buf = vec![0; 200];
        user::copy_from_user(&sys, &space, ADDR + PAGE_FRAME_SIZE - 100, &mut buf, 0).unwrap();
        let mut expected = vec![0; 200];
        file.read_at(&mut expected, PAGE_FRAME_SIZE - 100);
        assert_eq!(buf, expected);

        // Past end of file reads as zero.
        let mut tail = [0xFFu8; 16];
        user::copy_from_user(&sys, &space, ADDR + PAGE_FRAME_SIZE + 100, &mut tail, 0).unwrap();
        assert_eq!(tail, [0; 16]);
    }

    #[test]
    fn rejects_bad_requests() {
        let sys = system(4, 4);
        let space = AddressSpace::new(1);
        let file = file_of(10);

        assert_eq!(mmap(&sys, &space, &file, 0), Err(VmError::BadMmap(0)));
        assert_eq!(
            mmap(&sys, &space, &file, ADDR + 1),
            Err(VmError::BadMmap(ADDR + 1))
        );
        assert_eq!(
            mmap(&sys, &space, &file_of(0), ADDR),
            Err(VmError::BadMmap(ADDR))
        );

        let stack_page = OFFSET - MAX_STACK_SIZE;
        assert_eq!(
            mmap(&sys, &space, &file, stack_page),
            Err(VmError::BadMmap(stack_page))
        );
        assert_eq!(
            mmap(&sys, &space, &file, OFFSET),
            Err(VmError::BadMmap(OFFSET))
        );

        space
            .spt()
            .register_anonymous(VirtPage::containing(ADDR + PAGE_FRAME_SIZE), true)
            .unwrap();
        assert_eq!(
            mmap(&sys, &space, &file_of(2 * PAGE_FRAME_SIZE), ADDR),
            Err(VmError::BadMmap(ADDR))
        );
        assert_eq!(space.spt().len(), 1);
        assert!(space.mmaps().is_empty());
    }

    #[test]
    fn ids_increase_per_process() {
        let sys = system(4, 4);
        let a = AddressSpace::new(1);
        let b = AddressSpace::new(2);
        let file = file_of(10);
        assert_eq!(mmap(&sys, &a, &file, ADDR), Ok(0));
        assert_eq!(mmap(&sys, &a, &file, ADDR + PAGE_FRAME_SIZE), Ok(1));
        assert_eq!(mmap(&sys, &b, &file, ADDR), Ok(0));
    }

    #[test]
    fn munmap_writes_back_dirty_pages() {
        let sys = system(4, 4);
        let space = AddressSpace::new(1);
        let file = file_of(3 * PAGE_FRAME_SIZE);
        let original = {
            let mut buf = vec![0; 3 * PAGE_FRAME_SIZE];
            file.read_at(&mut buf, 0);
            buf
        };
        let id = mmap(&sys, &space, &file, ADDR).unwrap();

        user::copy_to_user(&sys, &space, ADDR + 10, b"hello", 0).unwrap();
        // Clean resident page: must not be written.
        resolve_fault(&sys, &space, VirtPage::containing(ADDR + PAGE_FRAME_SIZE)).unwrap();
        assert_eq!(sys.frames.len(), 2);

        munmap(&sys, &space, id).unwrap();
        assert!(space.spt().is_empty());
        assert_eq!(space.page_table().mapped_count(), 0);
        assert!(sys.frames.is_empty());

        let mut now = vec![0; 3 * PAGE_FRAME_SIZE];
        file.read_at(&mut now, 0);
        assert_eq!(&now[10..15], b"hello");
        assert_eq!(now[..10], original[..10]);
        assert_eq!(now[15..], original[15..]);

        assert_eq!(munmap(&sys, &space, id), Err(VmError::NoSuchMapping(id)));
    }

    #[test]
    fn dirty_mapped_page_evicted_to_file() {
        let sys = system(1, 4);
        let space = AddressSpace::new(1);
        let file = file_of(PAGE_FRAME_SIZE);
        mmap(&sys, &space, &file, ADDR).unwrap();
        let other = VirtPage::containing(ADDR + 16 * PAGE_FRAME_SIZE);
        space.spt().register_anonymous(other, true).unwrap();

        user::copy_to_user(&sys, &space, ADDR, b"evicted", 0).unwrap();
        resolve_fault(&sys, &space, other).unwrap();

        let page = VirtPage::containing(ADDR);
        assert!(!space.is_loaded(page));
        assert_eq!(sys.swap.used_slots(), 0);
        assert_eq!(sys.frames.stats().write_backs, 1);
        let mut head = [0u8; 7];
        file.read_at(&mut head, 0);
        assert_eq!(&head, b"evicted");

        // Reload comes from the file.
        let mut back = [0u8; 7];
        user::copy_from_user(&sys, &space, ADDR, &mut back, 0).unwrap();
        assert_eq!(&back, b"evicted");
    }
}
