use crate::sizes::{KB, MB, SECTOR_SIZE};

// Page size is 4KB. This is a property of x86 processors.
pub const PAGE_FRAME_SIZE: usize = 4 * KB;

// Any virtual address at or above OFFSET is a kernel address. User stacks
// grow down from here.
pub const OFFSET: usize = 0x80000000;

/// Number of block sectors backing one page, e.g. in a swap slot.
pub const SECTORS_PER_PAGE: usize = PAGE_FRAME_SIZE / SECTOR_SIZE;

/// Hard limit on the size of a user stack.
pub const MAX_STACK_SIZE: usize = 8 * MB;

/// How far below the stack pointer a fault may land and still count as
/// stack growth. PUSHA writes 32 bytes below esp before adjusting it.
pub const STACK_FAULT_SLACK: usize = 32;

/// Rounds `addr` down to the start of its page.
#[inline]
pub const fn page_round_down(addr: usize) -> usize {
    addr & !(PAGE_FRAME_SIZE - 1)
}

/// Offset of `addr` within its page.
#[inline]
pub const fn page_offset(addr: usize) -> usize {
    addr & (PAGE_FRAME_SIZE - 1)
}

#[inline]
pub const fn is_page_aligned(addr: usize) -> bool {
    page_offset(addr) == 0
}

#[inline]
pub const fn is_user_vaddr(addr: usize) -> bool {
    addr < OFFSET
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounding() {
        assert_eq!(page_round_down(0x1234), 0x1000);
        assert_eq!(page_offset(0x1234), 0x234);
        assert!(is_page_aligned(0x5000));
        assert!(!is_page_aligned(0x5001));
        assert!(is_user_vaddr(OFFSET - 1));
        assert!(!is_user_vaddr(OFFSET));
        assert_eq!(SECTORS_PER_PAGE, 8);
    }
}
