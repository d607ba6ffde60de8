//! The frame table.
//!
//! Every user frame in use is registered here against the page it backs.
//! When the pool runs dry a clock hand sweeps the table in frame order,
//! giving recently accessed pages a second chance and flushing the first
//! unpinned page it finds.

use super::page::{FileRegion, PageSource};
use super::{AddressSpace, Pid, Result, SwapSpace, VirtPage, VmError};
use crate::mem::{Frame, FrameAllocator};
use crate::sync::Mutex;
use alloc::{
    boxed::Box,
    collections::BTreeMap,
    sync::{Arc, Weak},
    vec::Vec,
};

struct FrameTableEntry {
    owner: Weak<AddressSpace>,
    pid: Pid,
    page: VirtPage,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameStats {
    /// Frames currently registered.
    pub registered: usize,
    pub evictions: usize,
    pub swap_outs: usize,
    /// Dirty mapped pages written back to their file.
    pub write_backs: usize,
    /// Clean file pages and orphaned frames reclaimed without I/O.
    pub drops: usize,
    /// Frames inspected by the clock hand.
    pub scan_steps: usize,
}

struct FrameTableInner {
    entries: BTreeMap<Frame, FrameTableEntry>,
    hand: Frame,
    stats: FrameStats,
}

/// What eviction does with a victim's contents.
enum Flush {
    Swap,
    WriteBack(FileRegion),
    Drop,
}

pub struct FrameTable {
    allocator: Box<dyn FrameAllocator>,
    inner: Mutex<FrameTableInner>,
    eviction_retries: usize,
}

impl FrameTable {
    /// A frame table over `allocator`. When every resident page is pinned,
    /// [`FrameTable::acquire`] rescans up to `eviction_retries` more times
    /// before giving up.
    pub fn new(allocator: Box<dyn FrameAllocator>, eviction_retries: usize) -> Self {
        Self {
            allocator,
            inner: Mutex::new(FrameTableInner {
                entries: BTreeMap::new(),
                hand: Frame::new(0),
                stats: FrameStats::default(),
            }),
            eviction_retries,
        }
    }

    pub fn allocator(&self) -> &dyn FrameAllocator {
        &*self.allocator
    }

    /// Takes a frame for `page` of `owner`, evicting another page if the pool
    /// is empty, and registers it.
    ///
    /// The caller must have pinned `page` and must not hold any supplemental
    /// page table lock. Panics if the pool has no frames at all.
    pub fn acquire(
        &self,
        zero: bool,
        owner: &Arc<AddressSpace>,
        page: VirtPage,
        swap: &SwapSpace,
        filesys_lock: &Mutex<()>,
    ) -> Result<Frame> {
        assert!(
            self.allocator.frame_count() > 0,
            "frame: no user frames exist"
        );

        for attempt in 0..=self.eviction_retries {
            let mut inner = self.inner.lock();
            let frame = match self.allocator.try_allocate(zero) {
                Some(frame) => Some(frame),
                None => {
                    let victim = self.evict_one(&mut inner, swap, filesys_lock)?;
                    if let Some(frame) = victim.filter(|_| zero) {
                        self.allocator.contents(frame).fill(0);
                    }
                    victim
                }
            };

            if let Some(frame) = frame {
                let previous = inner.entries.insert(
                    frame,
                    FrameTableEntry {
                        owner: Arc::downgrade(owner),
                        pid: owner.pid(),
                        page,
                    },
                );
                assert!(previous.is_none(), "frame: {frame} handed out twice");
                return Ok(frame);
            }

            drop(inner);
            log::debug!(
                "frame: every resident page pinned (attempt {} for pid {})",
                attempt + 1,
                owner.pid()
            );
            core::hint::spin_loop();
        }

        Err(VmError::FramesExhausted)
    }

    /// Unregisters `frame` and returns it to the pool.
    ///
    /// Panics if `frame` is not a user frame or is not registered.
    pub fn release(&self, frame: Frame) {
        assert!(
            frame.number() < self.allocator.frame_count(),
            "frame: {frame} is not a user frame"
        );
        let mut inner = self.inner.lock();
        assert!(
            inner.entries.remove(&frame).is_some(),
            "frame: releasing unregistered {frame}"
        );
        self.allocator.free(frame);
    }

    /// The process and page `frame` is registered to.
    pub fn owner_of(&self, frame: Frame) -> Option<(Pid, VirtPage)> {
        self.inner
            .lock()
            .entries
            .get(&frame)
            .map(|entry| (entry.pid, entry.page))
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    pub fn stats(&self) -> FrameStats {
        let inner = self.inner.lock();
        FrameStats {
            registered: inner.entries.len(),
            ..inner.stats
        }
    }

    /// Runs the clock hand over the table, at most twice around, and returns
    /// the frame of the flushed victim. The frame stays allocated and is no
    /// longer registered. Returns `None` if every page is pinned.
    fn evict_one(
        &self,
        inner: &mut FrameTableInner,
        swap: &SwapSpace,
        filesys_lock: &Mutex<()>,
    ) -> Result<Option<Frame>> {
        let order: Vec<Frame> = inner
            .entries
            .range(inner.hand..)
            .chain(inner.entries.range(..inner.hand))
            .map(|(frame, _)| *frame)
            .collect();

        // The first lap may do nothing but clear accessed bits.
        for &frame in order.iter().cycle().take(2 * order.len()) {
            inner.stats.scan_steps += 1;
            let Some(entry) = inner.entries.get(&frame) else {
                continue;
            };
            let page = entry.page;

            let evicted = match entry.owner.upgrade() {
                Some(owner) => self.flush_if_victim(
                    &owner,
                    page,
                    frame,
                    &mut inner.stats,
                    swap,
                    filesys_lock,
                )?,
                None => {
                    // Owner exited without tearing down; nothing to save.
                    inner.stats.drops += 1;
                    true
                }
            };

            if evicted {
                inner.entries.remove(&frame);
                inner.hand = frame.next();
                inner.stats.evictions += 1;
                return Ok(Some(frame));
            }
        }

        Ok(None)
    }

    /// Checks whether `page` of `owner` is the victim and, if so, saves its
    /// contents and unmaps it.
    fn flush_if_victim(
        &self,
        owner: &AddressSpace,
        page: VirtPage,
        frame: Frame,
        stats: &mut FrameStats,
        swap: &SwapSpace,
        filesys_lock: &Mutex<()>,
    ) -> Result<bool> {
        let mut spt = owner.spt.lock();
        // Missing while the owner tears the page down.
        let Some(spte) = spt.lookup_mut(page) else {
            return Ok(false);
        };
        if spte.is_pinned() || !spte.is_loaded() {
            return Ok(false);
        }

        let mut page_table = owner.page_table.lock();
        if page_table.is_accessed(page) {
            page_table.clear_accessed(page);
            return Ok(false);
        }

        let dirty = page_table.is_dirty(page);
        let flush = match &spte.source {
            PageSource::Mmapped { region, .. } if dirty => Flush::WriteBack(region.clone()),
            PageSource::Mmapped { .. } => Flush::Drop,
            PageSource::FileBacked(_) if !dirty => Flush::Drop,
            PageSource::FileBacked(_) | PageSource::SwapBacked { .. } => Flush::Swap,
        };

        {
            let contents = self.allocator.contents(frame);
            match flush {
                Flush::Swap => {
                    let slot = swap.swap_out(&contents)?;
                    spte.source = PageSource::SwapBacked { slot: Some(slot) };
                    stats.swap_outs += 1;
                }
                Flush::WriteBack(region) => {
                    region.write_back(&contents, filesys_lock)?;
                    stats.write_backs += 1;
                }
                Flush::Drop => stats.drops += 1,
            }
        }

        page_table.clear(page);
        spte.loaded = false;

        log::debug!(
            "frame: evicted {} of pid {} from {} ({})",
            page,
            owner.pid(),
            frame,
            spte.source
        );
        Ok(true)
    }
}
