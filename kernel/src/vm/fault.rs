//! Page-fault resolution.

use super::page::{PageSource, Spte};
use super::{AddressSpace, PinGuard, Result, VirtPage, VmError};
use crate::mem::Frame;
use crate::system::{VmConfig, VmSystem};
use alloc::sync::Arc;
use kidneyos_shared::mem::{is_user_vaddr, page_round_down, OFFSET};

/// Makes `page` resident. Idempotent.
pub fn resolve_fault(sys: &VmSystem, space: &Arc<AddressSpace>, page: VirtPage) -> Result<()> {
    pin_and_resolve(sys, space, page).map(drop)
}

/// Makes `page` resident and keeps it pinned until the guard is dropped.
///
/// The page stays pinned while its frame is filled, so a concurrent eviction
/// cannot take the frame mid-load. Only one fault loads a given page; any
/// other fault on it spins until the load finishes. On failure any frame
/// taken is released.
pub fn pin_and_resolve<'a>(
    sys: &VmSystem,
    space: &'a Arc<AddressSpace>,
    page: VirtPage,
) -> Result<PinGuard<'a>> {
    let guard = space
        .pin(page)
        .ok_or(VmError::InvalidAddress(page.addr()))?;

    let (source, writable) = loop {
        let mut spt = space.spt.lock();
        let Some(spte) = spt.lookup_mut(page) else {
            drop(spt);
            return Err(VmError::InvalidAddress(page.addr()));
        };
        if spte.is_loaded() {
            drop(spt);
            return Ok(guard);
        }
        if !spte.is_loading() {
            spte.loading = true;
            break (spte.source().clone(), spte.is_writable());
        }
        drop(spt);
        core::hint::spin_loop();
    };

    let frame = match sys.acquire_frame(source.needs_zeroed_frame(), space, page) {
        Ok(frame) => frame,
        Err(e) => {
            abandon_load(sys, space, page, &source);
            return Err(e);
        }
    };
    if let Err(e) = populate(sys, frame, &source) {
        sys.frames.release(frame);
        abandon_load(sys, space, page, &source);
        log::debug!("fault: loading {} for pid {} failed: {}", page, space.pid(), e);
        return Err(e);
    }

    install(sys, space, page, frame, writable)?;
    Ok(guard)
}

/// Fills `frame` from `source`.
fn populate(sys: &VmSystem, frame: Frame, source: &PageSource) -> Result<()> {
    let mut contents = sys.frames.allocator().contents(frame);
    match source {
        PageSource::SwapBacked { slot: Some(slot) } => sys.swap.swap_in(*slot, &mut contents),
        // Acquired zeroed.
        PageSource::SwapBacked { slot: None } => Ok(()),
        PageSource::FileBacked(region) | PageSource::Mmapped { region, .. } => {
            region.load(&mut contents, &sys.filesys_lock)
        }
    }
}

/// Drops this fault's claim on loading `page` so a later fault can retry.
/// `source` still holds its swap slot, if any.
fn abandon_load(sys: &VmSystem, space: &AddressSpace, page: VirtPage, source: &PageSource) {
    let known = match space.spt.lock().lookup_mut(page) {
        Some(spte) => {
            spte.loading = false;
            true
        }
        None => false,
    };
    // Teardown leaves the slot of a page mid-load to the loader.
    if !known {
        if let Some(slot) = source.swap_slot() {
            sys.swap.free_slot(slot);
        }
    }
}

/// Maps the freshly filled `frame` at `page` and marks the page loaded.
fn install(
    sys: &VmSystem,
    space: &AddressSpace,
    page: VirtPage,
    frame: Frame,
    writable: bool,
) -> Result<()> {
    let installed = {
        let mut spt = space.spt.lock();
        match spt.lookup_mut(page) {
            Some(spte) => {
                let mapped = space.page_table.lock().install(page, frame, writable);
                assert!(mapped, "fault: {page} of pid {} already mapped", space.pid());
                // A swap slot is freed as soon as it is read back.
                if spte.source().swap_slot().is_some() {
                    spte.source = PageSource::SwapBacked { slot: None };
                }
                spte.loaded = true;
                spte.loading = false;
                true
            }
            None => false,
        }
    };

    if !installed {
        // Unmapped while we were loading it.
        sys.frames.release(frame);
        return Err(VmError::InvalidAddress(page.addr()));
    }
    Ok(())
}

/// Checks whether a fault at `addr` with stack pointer `esp` may grow the
/// stack.
pub fn check_stack_access(config: &VmConfig, addr: usize, esp: usize) -> Result<()> {
    if !is_user_vaddr(addr) || addr.saturating_add(config.stack_fault_slack) < esp {
        return Err(VmError::InvalidAddress(addr));
    }
    if OFFSET - page_round_down(addr) > config.max_stack_size {
        return Err(VmError::StackLimit(addr));
    }
    Ok(())
}

/// Adds a zeroed, writable stack page containing `addr`.
///
/// The page comes back pinned. Dropping the guard straight away suits the
/// interrupt path; syscalls hold it until they are done with user memory.
pub fn grow_stack<'a>(
    sys: &VmSystem,
    space: &'a Arc<AddressSpace>,
    addr: usize,
    esp: usize,
) -> Result<PinGuard<'a>> {
    check_stack_access(&sys.config, addr, esp)?;

    let page = VirtPage::containing(addr);
    {
        let mut spt = space.spt.lock();
        spt.register_anonymous(page, true)?;
        // Faults racing on the new page wait for the install below.
        if let Some(spte) = spt.lookup_mut(page) {
            spte.loading = true;
        }
    }
    let guard = space
        .pin(page)
        .ok_or(VmError::InvalidAddress(addr))?;

    let frame = match sys.acquire_frame(true, space, page) {
        Ok(frame) => frame,
        Err(e) => {
            space.spt.lock().remove(page);
            return Err(e);
        }
    };
    install(sys, space, page, frame, true)?;

    log::debug!("fault: grew stack of pid {} to {}", space.pid(), page);
    Ok(guard)
}

/// Entry point from the page-fault handler.
///
/// `not_present` is clear when the page was mapped but the access violated
/// its rights. An error means the process should be killed.
pub fn handle_page_fault(
    sys: &VmSystem,
    space: &Arc<AddressSpace>,
    fault_addr: usize,
    write: bool,
    not_present: bool,
    esp: usize,
) -> Result<()> {
    let result = if !is_user_vaddr(fault_addr) {
        Err(VmError::InvalidAddress(fault_addr))
    } else if !not_present {
        Err(VmError::ProtectionViolation(fault_addr))
    } else {
        let page = VirtPage::containing(fault_addr);
        let writable = space.spt.lock().lookup(page).map(Spte::is_writable);
        match writable {
            Some(false) if write => Err(VmError::ReadOnly(page)),
            Some(_) => resolve_fault(sys, space, page),
            None => match grow_stack(sys, space, fault_addr, esp) {
                // Another thread grew the stack onto this page first.
                Err(VmError::AlreadyMapped(_)) => resolve_fault(sys, space, page),
                other => other.map(drop),
            },
        }
    };

    if let Err(e) = &result {
        log::debug!(
            "fault: pid {} at {:#x} ({}): {}",
            space.pid(),
            fault_addr,
            if write { "write" } else { "read" },
            e
        );
    }
    result
}
