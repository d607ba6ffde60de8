//! The global paging context.
//!
//! One [`VmSystem`] owns the frame table, the swap space and the file system
//! lock that page loads and write-backs take. The kernel installs it once
//! with [`init`]; tests build their own.

use crate::block::{Block, BlockManager};
use crate::mem::{Frame, FrameAllocator};
use crate::sync::Mutex;
use crate::vm::{AddressSpace, FrameTable, Result, SwapSpace, VirtPage};
use alloc::{boxed::Box, sync::Arc};
use kidneyos_shared::mem::{MAX_STACK_SIZE, STACK_FAULT_SLACK};
use once_cell::race::OnceBox;

/// Tunables for the paging subsystem.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VmConfig {
    /// Largest a user stack may grow, in bytes.
    pub max_stack_size: usize,
    /// How far below the stack pointer a fault still counts as stack growth.
    pub stack_fault_slack: usize,
    /// Rescans of the frame table before a fault gives up on finding a victim.
    pub eviction_retries: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            max_stack_size: MAX_STACK_SIZE,
            stack_fault_slack: STACK_FAULT_SLACK,
            eviction_retries: 16,
        }
    }
}

pub struct VmSystem {
    pub config: VmConfig,
    pub frames: FrameTable,
    pub swap: SwapSpace,
    /// Serialises every file access made on behalf of paging.
    pub filesys_lock: Mutex<()>,
}

impl VmSystem {
    /// A paging context over the user frames of `allocator`. Swap starts
    /// unbound; see [`VmSystem::init_swap`].
    pub fn new(config: VmConfig, allocator: Box<dyn FrameAllocator>) -> Self {
        log::info!(
            "vm: {} user frames, stack limit {:#x} bytes",
            allocator.frame_count(),
            config.max_stack_size
        );
        Self {
            frames: FrameTable::new(allocator, config.eviction_retries),
            swap: SwapSpace::new(),
            filesys_lock: Mutex::new(()),
            config,
        }
    }

    /// Claims the swap block from `blocks`. Panics if there is none.
    pub fn init_swap(&self, blocks: &mut BlockManager) {
        self.swap.init(blocks);
    }

    /// Takes a frame for `page` of `owner`, evicting if needed.
    pub fn acquire_frame(
        &self,
        zero: bool,
        owner: &Arc<AddressSpace>,
        page: VirtPage,
    ) -> Result<Frame> {
        self.frames
            .acquire(zero, owner, page, &self.swap, &self.filesys_lock)
    }

    /// Unbinds the swap device. Every address space must already be torn
    /// down.
    pub fn shutdown(&self) -> Option<Block> {
        assert!(
            self.frames.is_empty(),
            "vm: shutdown with {} frames still in use",
            self.frames.len()
        );
        log::info!("vm: shutting down, {:?}", self.frames.stats());
        self.swap.shutdown()
    }
}

static VM: OnceBox<VmSystem> = OnceBox::new();

/// Installs the global paging context. Panics if called twice.
pub fn init(system: VmSystem) -> &'static VmSystem {
    if VM.set(Box::new(system)).is_err() {
        panic!("vm: already initialised");
    }
    vm()
}

/// The global paging context. Panics before [`init`].
pub fn vm() -> &'static VmSystem {
    let Some(system) = VM.get() else {
        panic!("vm: used before initialisation");
    };
    system
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::*;
    use crate::block::{BlockType, MemDisk};
    use crate::mem::UserPool;
    use alloc::collections::BTreeMap;
    use kidneyos_shared::mem::SECTORS_PER_PAGE;

    /// A context with `frames` user frames and `swap_slots` pages of swap.
    pub fn system(frames: usize, swap_slots: u32) -> VmSystem {
        kidneyos_shared::logger::init(log::LevelFilter::Debug);
        let sectors = swap_slots * SECTORS_PER_PAGE as u32;
        let mut blocks = BlockManager::new();
        blocks.register_block(
            BlockType::Swap,
            "swap",
            sectors,
            Box::new(MemDisk::new(sectors)),
        );
        let sys = VmSystem::new(VmConfig::default(), Box::new(UserPool::new(frames)));
        sys.init_swap(&mut blocks);
        sys
    }

    /// Checks that each registered frame backs exactly one loaded page and
    /// every loaded page is registered.
    pub fn assert_single_owner(sys: &VmSystem, spaces: &[Arc<AddressSpace>]) {
        let mut seen = BTreeMap::new();
        for space in spaces {
            let spt = space.spt();
            let page_table = space.page_table();
            for (page, spte) in spt.iter() {
                let frame = page_table.translate(page);
                assert_eq!(spte.is_loaded(), frame.is_some(), "{page}");
                if let Some(frame) = frame {
                    assert!(seen.insert(frame, page).is_none(), "{frame} mapped twice");
                    assert_eq!(sys.frames.owner_of(frame), Some((space.pid(), page)));
                }
            }
        }
        assert_eq!(seen.len(), sys.frames.len());
    }
}

#[cfg(test)]
mod tests {
    use super::test_util::system;
    use super::*;
    use crate::block::{BlockType, MemDisk};
    use crate::mem::UserPool;
    use crate::vm::{handle_page_fault, resolve_fault};
    use kidneyos_shared::mem::{OFFSET, PAGE_FRAME_SIZE};

    #[test]
    fn shutdown_returns_swap_device() {
        let sys = system(2, 4);
        assert!(sys.swap.is_initialized());
        let block = sys.shutdown().unwrap();
        assert_eq!(block.get_type(), BlockType::Swap);
        assert!(!sys.swap.is_initialized());
        assert!(sys.shutdown().is_none());
    }

    #[test]
    #[should_panic(expected = "frames still in use")]
    fn shutdown_with_live_pages_is_fatal() {
        let sys = system(2, 4);
        let space = AddressSpace::new(1);
        let page = VirtPage::containing(0x1000_0000);
        space.spt().register_anonymous(page, true).unwrap();
        resolve_fault(&sys, &space, page).unwrap();
        sys.shutdown();
    }

    #[test]
    #[should_panic(expected = "no swap block device")]
    fn init_swap_without_device_is_fatal() {
        let sys = VmSystem::new(VmConfig::default(), Box::new(UserPool::new(1)));
        let mut blocks = BlockManager::new();
        blocks.register_block(BlockType::FileSystem, "disk", 64, Box::new(MemDisk::new(64)));
        sys.init_swap(&mut blocks);
    }

    #[test]
    fn custom_stack_limit() {
        let config = VmConfig {
            max_stack_size: 2 * PAGE_FRAME_SIZE,
            ..VmConfig::default()
        };
        let sys = VmSystem::new(config, Box::new(UserPool::new(4)));
        let space = AddressSpace::new(1);

        let deep = OFFSET - 3 * PAGE_FRAME_SIZE;
        assert!(handle_page_fault(&sys, &space, deep, true, true, deep).is_err());
        let ok = OFFSET - 2 * PAGE_FRAME_SIZE;
        handle_page_fault(&sys, &space, ok, true, true, ok).unwrap();
        space.teardown(&sys);
        assert!(sys.frames.is_empty());
    }
}
