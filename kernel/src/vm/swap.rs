//! Swap slots.
//!
//! The swap device is carved into page-sized slots of
//! [`SECTORS_PER_PAGE`] sectors each. A bitmap records which slots hold a
//! page. Slot scan, bitmap update and device I/O for one operation all happen
//! under a single lock.

// Sector numbers are bounded by the device size, which is a `BlockSector`.
#![allow(clippy::cast_possible_truncation)]

use super::Result;
use crate::block::{Block, BlockManager, BlockSector, BlockType, BLOCK_SECTOR_SIZE};
use crate::mem::PageBuf;
use crate::sync::Mutex;
use kidneyos_shared::{bitmap::Bitmap, mem::SECTORS_PER_PAGE};

/// Index of a page-sized slot on the swap device.
pub type SwapSlot = usize;

struct SwapDevice {
    block: Block,
    /// `true` for slots holding a page.
    slots: Bitmap,
}

impl SwapDevice {
    fn sector(slot: SwapSlot, i: usize) -> BlockSector {
        (slot * SECTORS_PER_PAGE + i) as BlockSector
    }

    fn write_slot(&mut self, slot: SwapSlot, page: &PageBuf) -> Result<()> {
        for (i, chunk) in page.chunks_exact(BLOCK_SECTOR_SIZE).enumerate() {
            self.block.write(Self::sector(slot, i), chunk)?;
        }
        Ok(())
    }

    fn read_slot(&mut self, slot: SwapSlot, page: &mut PageBuf) -> Result<()> {
        for (i, chunk) in page.chunks_exact_mut(BLOCK_SECTOR_SIZE).enumerate() {
            self.block.read(Self::sector(slot, i), chunk)?;
        }
        Ok(())
    }
}

/// The swap manager.
pub struct SwapSpace {
    device: Mutex<Option<SwapDevice>>,
}

impl Default for SwapSpace {
    fn default() -> Self {
        Self::new()
    }
}

impl SwapSpace {
    /// An unbound swap manager. Call [`SwapSpace::init`] before swapping.
    pub const fn new() -> Self {
        Self {
            device: Mutex::new(None),
        }
    }

    /// Binds the block registered with the [`BlockType::Swap`] role and marks
    /// every slot free.
    ///
    /// Panics if there is no swap block, if it is too small to hold a single
    /// page, or if swap is already bound.
    pub fn init(&self, blocks: &mut BlockManager) {
        let Some(block) = blocks.take_by_role(BlockType::Swap) else {
            panic!("swap: no swap block device");
        };
        self.bind(block);
    }

    /// Binds `block` as the swap device.
    pub fn bind(&self, block: Block) {
        let slot_count = block.get_size() as usize / SECTORS_PER_PAGE;
        assert!(
            slot_count > 0,
            "swap: \"{}\" is too small for one page",
            block.get_name()
        );

        let mut device = self.device.lock();
        assert!(device.is_none(), "swap: already initialised");

        log::info!(
            "swap: using \"{}\" with {} slots",
            block.get_name(),
            slot_count
        );
        *device = Some(SwapDevice {
            block,
            slots: Bitmap::new(slot_count),
        });
    }

    /// Unbinds the swap device, returning it.
    pub fn shutdown(&self) -> Option<Block> {
        let device = self.device.lock().take()?;
        let used = device.slots.count(true);
        if used != 0 {
            log::warn!("swap: shutting down with {} slots in use", used);
        }
        Some(device.block)
    }

    pub fn is_initialized(&self) -> bool {
        self.device.lock().is_some()
    }

    /// Writes `page` to the lowest free slot and returns its index.
    ///
    /// Panics if swap is not initialised or if every slot is in use. On a
    /// write failure the slot is released again and the error returned.
    pub fn swap_out(&self, page: &PageBuf) -> Result<SwapSlot> {
        let mut device = self.device.lock();
        let Some(device) = device.as_mut() else {
            panic!("swap: used before initialisation");
        };
        let Some(slot) = device.slots.scan_and_flip(false) else {
            panic!("swap: out of swap slots");
        };

        if let Err(e) = device.write_slot(slot, page) {
            device.slots.set(slot, false);
            return Err(e);
        }

        log::trace!("swap: wrote slot {}", slot);
        Ok(slot)
    }

    /// Reads `slot` into `page` and frees the slot.
    ///
    /// Panics if `slot` is not in use. On a read failure the slot keeps its
    /// contents and stays in use.
    pub fn swap_in(&self, slot: SwapSlot, page: &mut PageBuf) -> Result<()> {
        let mut device = self.device.lock();
        let Some(device) = device.as_mut() else {
            panic!("swap: used before initialisation");
        };
        assert!(
            slot < device.slots.len() && device.slots.test(slot),
            "swap: reading free slot {slot}"
        );

        device.read_slot(slot, page)?;
        device.slots.set(slot, false);

        log::trace!("swap: read slot {}", slot);
        Ok(())
    }

    /// Frees `slot` without reading it, for pages that die in swap.
    ///
    /// Panics if `slot` is not in use.
    pub fn free_slot(&self, slot: SwapSlot) {
        let mut device = self.device.lock();
        let Some(device) = device.as_mut() else {
            panic!("swap: used before initialisation");
        };
        assert!(
            slot < device.slots.len() && device.slots.test(slot),
            "swap: freeing free slot {slot}"
        );
        device.slots.set(slot, false);
    }

    /// Slots currently holding a page.
    pub fn used_slots(&self) -> usize {
        self.device
            .lock()
            .as_ref()
            .map_or(0, |device| device.slots.count(true))
    }

    /// Total slots on the bound device.
    pub fn slot_count(&self) -> usize {
        self.device
            .lock()
            .as_ref()
            .map_or(0, |device| device.slots.len())
    }
}
