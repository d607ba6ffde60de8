use super::{File, FileHandle};
use crate::sync::Mutex;
use alloc::{sync::Arc, vec::Vec};
use core::cmp::min;

/// A file held entirely in kernel memory.
///
/// Handles returned by [`File::reopen`] share the same data, the way two
/// opens of one inode do.
pub struct MemFile {
    data: Arc<Mutex<Vec<u8>>>,
}

impl MemFile {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: Arc::new(Mutex::new(data.into())),
        }
    }

    /// Wraps a new file in a [`FileHandle`].
    pub fn handle(data: impl Into<Vec<u8>>) -> FileHandle {
        Arc::new(Self::new(data))
    }

    /// Copy of the current contents.
    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().clone()
    }
}

impl File for MemFile {
    fn read_at(&self, buf: &mut [u8], offset: usize) -> usize {
        let data = self.data.lock();
        if offset >= data.len() {
            return 0;
        }
        let read_len = min(buf.len(), data.len() - offset);
        buf[..read_len].copy_from_slice(&data[offset..offset + read_len]);
        read_len
    }

    fn write_at(&self, buf: &[u8], offset: usize) -> usize {
        let mut data = self.data.lock();
        if offset >= data.len() {
            return 0;
        }
        let write_len = min(buf.len(), data.len() - offset);
        data[offset..offset + write_len].copy_from_slice(&buf[..write_len]);
        write_len
    }

    fn length(&self) -> usize {
        self.data.lock().len()
    }

    fn reopen(&self) -> FileHandle {
        Arc::new(Self {
            data: Arc::clone(&self.data),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_read_at_end() {
        let file = MemFile::new(*b"hello world");
        let mut buf = [0u8; 8];
        assert_eq!(file.read_at(&mut buf, 6), 5);
        assert_eq!(&buf[..5], b"world");
        assert_eq!(file.read_at(&mut buf, 11), 0);
        assert_eq!(file.read_at(&mut buf, 100), 0);
    }

    #[test]
    fn writes_do_not_extend() {
        let file = MemFile::new(*b"abcd");
        assert_eq!(file.write_at(b"XYZ", 2), 2);
        assert_eq!(file.contents(), b"abXY");
        assert_eq!(file.length(), 4);
    }

    #[test]
    fn reopen_shares_data() {
        let file = MemFile::new(*b"abcd");
        let other = file.reopen();
        other.write_at(b"z", 0);
        assert_eq!(file.contents(), b"zbcd");
        assert_eq!(other.length(), 4);
    }
}
