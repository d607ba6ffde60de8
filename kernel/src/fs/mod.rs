//! The file interface the paging code needs.
//!
//! Only positional I/O is required: a lazily loaded segment or a memory
//! mapping remembers `(file, offset)` and reads or writes it when the page
//! moves in or out of memory. Callers serialise paging I/O against other file
//! system traffic through [`VmSystem::filesys_lock`](crate::system::VmSystem).

pub mod mem_file;

pub use mem_file::MemFile;

use alloc::sync::Arc;

/// An open file.
pub trait File: Send + Sync {
    /// Reads up to `buf.len()` bytes starting at `offset`. Returns the number
    /// of bytes read, which is short at end of file.
    fn read_at(&self, buf: &mut [u8], offset: usize) -> usize;

    /// Writes up to `buf.len()` bytes starting at `offset`. Files do not grow,
    /// so the count is short when the write would run past the end.
    fn write_at(&self, buf: &[u8], offset: usize) -> usize;

    /// Length of the file in bytes.
    fn length(&self) -> usize;

    /// Opens a fresh handle to the same underlying file.
    fn reopen(&self) -> FileHandle;
}

pub type FileHandle = Arc<dyn File>;
