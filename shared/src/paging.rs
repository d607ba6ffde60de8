// https://wiki.osdev.org/Paging

// Avoids lots of warnings about casting usize to u32 which cannot result in
// truncation on a 32-bit platform, which is all we support. It would be nice if
// you could tell clippy that you were only dealing with 32-bit usizes...
#![allow(clippy::cast_possible_truncation)]

use arbitrary_int::u20;
use bitbybit::bitfield;

/// Largest frame number a page-table entry can hold.
pub const MAX_FRAME_NUMBER: usize = (1 << 20) - 1;

#[bitfield(u32, default = 0)]
pub struct PageTableEntry {
    #[bit(0, rw)]
    present: bool,
    #[bit(1, rw)]
    read_write: bool,
    #[bit(2, rw)]
    user_supervisor: bool,
    #[bit(3, rw)]
    write_through: bool,
    #[bit(4, rw)]
    cache_disable: bool,
    #[bit(5, rw)]
    accessed: bool,
    #[bit(6, rw)]
    dirty: bool,
    #[bit(7, rw)]
    page_attribute_table: bool,
    #[bit(8, rw)]
    global: bool,
    #[bits(12..=31, rw)]
    page_frame_address: u20,
}

impl PageTableEntry {
    /// A present user mapping of frame number `frame`.
    ///
    /// Panics if `frame` does not fit in the 20-bit frame field.
    pub fn user_mapping(frame: usize, writable: bool) -> Self {
        assert!(frame <= MAX_FRAME_NUMBER, "frame {frame} out of range");
        Self::DEFAULT
            .with_present(true)
            .with_user_supervisor(true)
            .with_read_write(writable)
            .with_page_frame_address(u20::new(frame as u32))
    }

    pub fn frame_number(&self) -> usize {
        self.page_frame_address().value() as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_mapping_bits() {
        let entry = PageTableEntry::user_mapping(0x12345, true);
        assert!(entry.present());
        assert!(entry.read_write());
        assert!(entry.user_supervisor());
        assert!(!entry.accessed());
        assert!(!entry.dirty());
        assert_eq!(entry.frame_number(), 0x12345);

        let entry = entry.with_dirty(true).with_accessed(true);
        assert!(entry.dirty() && entry.accessed());
        assert_eq!(entry.frame_number(), 0x12345);
    }

    #[test]
    #[should_panic]
    fn frame_out_of_range() {
        PageTableEntry::user_mapping(MAX_FRAME_NUMBER + 1, false);
    }
}
