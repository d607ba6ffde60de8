//! Access to user memory from syscalls.
//!
//! Before a syscall touches a user buffer every page of it is made resident
//! and pinned, so eviction cannot pull a frame out from under the copy. The
//! copies set the accessed and dirty bits just as the MMU would for the
//! process's own loads and stores.

use crate::mem::Frame;
use crate::system::VmSystem;
use crate::vm::{grow_stack, pin_and_resolve, AddressSpace, PinGuard, Result, VirtPage, VmError};
use alloc::{string::String, sync::Arc, vec::Vec};
use core::cmp::{max, min};
use kidneyos_shared::mem::{page_offset, OFFSET, PAGE_FRAME_SIZE};

/// Pages of a user range, pinned until this is dropped.
pub struct PinnedRange<'a> {
    guards: Vec<PinGuard<'a>>,
}

impl PinnedRange<'_> {
    pub fn pages(&self) -> impl Iterator<Item = VirtPage> + '_ {
        self.guards.iter().map(PinGuard::page)
    }

    pub fn len(&self) -> usize {
        self.guards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.guards.is_empty()
    }
}

/// Validates `[addr, addr + len)` for a read, or a write if `write` is set,
/// and pins every page it touches. Pages below the stack pointer `esp` are
/// grown as for a stack fault.
pub fn pin_user_range<'a>(
    sys: &VmSystem,
    space: &'a Arc<AddressSpace>,
    addr: usize,
    len: usize,
    write: bool,
    esp: usize,
) -> Result<PinnedRange<'a>> {
    let mut guards = Vec::new();
    if len == 0 {
        return Ok(PinnedRange { guards });
    }

    let end = addr
        .checked_add(len)
        .filter(|&end| end <= OFFSET)
        .ok_or(VmError::InvalidAddress(addr))?;

    let mut page = VirtPage::containing(addr);
    while page.addr() < end {
        let writable = space.spt().lookup(page).map(|spte| spte.is_writable());
        let guard = match writable {
            Some(false) if write => return Err(VmError::ReadOnly(page)),
            Some(_) => pin_and_resolve(sys, space, page)?,
            None => match grow_stack(sys, space, max(addr, page.addr()), esp) {
                // Another thread grew the stack onto this page first.
                Err(VmError::AlreadyMapped(_)) => pin_and_resolve(sys, space, page)?,
                other => other?,
            },
        };
        guards.push(guard);

        let Some(next) = page.add(1) else {
            break;
        };
        page = next;
    }

    Ok(PinnedRange { guards })
}

/// Records a user access to a pinned page and returns its frame.
fn touch(space: &AddressSpace, page: VirtPage, write: bool) -> Result<Frame> {
    let mut page_table = space.page_table();
    let frame = page_table
        .translate(page)
        .ok_or(VmError::InvalidAddress(page.addr()))?;
    page_table.set_accessed(page, true);
    if write {
        page_table.set_dirty(page, true);
    }
    Ok(frame)
}

/// Calls `f` with each page-sized piece of `[addr, addr + len)`: the frame
/// bytes and the offset of the piece within the range.
fn for_each_chunk(
    sys: &VmSystem,
    space: &Arc<AddressSpace>,
    addr: usize,
    len: usize,
    write: bool,
    esp: usize,
    mut f: impl FnMut(&mut [u8], usize),
) -> Result<()> {
    let _pinned = pin_user_range(sys, space, addr, len, write, esp)?;

    let mut done = 0;
    while done < len {
        let va = addr + done;
        let offset = page_offset(va);
        let chunk = min(len - done, PAGE_FRAME_SIZE - offset);

        let frame = touch(space, VirtPage::containing(va), write)?;
        let mut contents = sys.frames.allocator().contents(frame);
        f(&mut contents[offset..offset + chunk], done);
        done += chunk;
    }
    Ok(())
}

/// Copies `buf.len()` bytes from user address `addr` into `buf`.
pub fn copy_from_user(
    sys: &VmSystem,
    space: &Arc<AddressSpace>,
    addr: usize,
    buf: &mut [u8],
    esp: usize,
) -> Result<()> {
    let len = buf.len();
    for_each_chunk(sys, space, addr, len, false, esp, |user, at| {
        buf[at..at + user.len()].copy_from_slice(user);
    })
}

/// Copies `data` to user address `addr`.
pub fn copy_to_user(
    sys: &VmSystem,
    space: &Arc<AddressSpace>,
    addr: usize,
    data: &[u8],
    esp: usize,
) -> Result<()> {
    for_each_chunk(sys, space, addr, data.len(), true, esp, |user, at| {
        user.copy_from_slice(&data[at..at + user.len()]);
    })
}

/// Reads a NUL-terminated string of at most `max_len` bytes, not counting
/// the terminator, from user address `addr`.
pub fn read_user_cstr(
    sys: &VmSystem,
    space: &Arc<AddressSpace>,
    addr: usize,
    max_len: usize,
    esp: usize,
) -> Result<String> {
    let mut bytes = Vec::new();
    let mut va = addr;
    loop {
        let page = VirtPage::containing(va);
        let _pinned = pin_user_range(sys, space, va, 1, false, esp)?;
        let frame = touch(space, page, false)?;
        let contents = sys.frames.allocator().contents(frame);

        for &b in &contents[page_offset(va)..] {
            if b == 0 {
                return String::from_utf8(bytes).map_err(|_| VmError::BadUtf8);
            }
            if bytes.len() == max_len {
                return Err(VmError::StringTooLong(max_len));
            }
            bytes.push(b);
        }

        va = page
            .add(1)
            .ok_or(VmError::InvalidAddress(va))?
            .addr();
    }
}
