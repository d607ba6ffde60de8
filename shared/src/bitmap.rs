use alloc::{vec, vec::Vec};

const WORD_BITS: usize = u64::BITS as usize;

/// A fixed-length array of bits packed into 64-bit words.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Bitmap {
    words: Vec<u64>,
    len: usize,
}

impl Bitmap {
    /// Creates a bitmap of `len` bits, all cleared.
    pub fn new(len: usize) -> Self {
        Self {
            words: vec![0; len.div_ceil(WORD_BITS)],
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the value of bit `idx`.
    ///
    /// Panics if `idx` is out of bounds.
    pub fn test(&self, idx: usize) -> bool {
        assert!(idx < self.len, "bit {idx} out of bounds ({})", self.len);
        (self.words[idx / WORD_BITS] >> (idx % WORD_BITS)) & 1 != 0
    }

    /// Sets bit `idx` to `value`.
    ///
    /// Panics if `idx` is out of bounds.
    pub fn set(&mut self, idx: usize, value: bool) {
        assert!(idx < self.len, "bit {idx} out of bounds ({})", self.len);
        let mask = 1u64 << (idx % WORD_BITS);
        if value {
            self.words[idx / WORD_BITS] |= mask;
        } else {
            self.words[idx / WORD_BITS] &= !mask;
        }
    }

    /// Sets every bit to `value`.
    pub fn set_all(&mut self, value: bool) {
        self.words.fill(if value { u64::MAX } else { 0 });
        if value {
            self.clear_tail();
        }
    }

    /// Number of bits set to `value`.
    pub fn count(&self, value: bool) -> usize {
        let ones = self.words.iter().map(|w| w.count_ones() as usize).sum();
        if value {
            ones
        } else {
            self.len - ones
        }
    }

    /// Index of the lowest bit equal to `value`, if any.
    pub fn scan(&self, value: bool) -> Option<usize> {
        self.words
            .iter()
            .enumerate()
            .find_map(|(i, &word)| {
                let word = if value { word } else { !word };
                (word != 0).then(|| i * WORD_BITS + word.trailing_zeros() as usize)
            })
            .filter(|&idx| idx < self.len)
    }

    /// Finds the lowest bit equal to `value` and flips it, returning its index.
    pub fn scan_and_flip(&mut self, value: bool) -> Option<usize> {
        let idx = self.scan(value)?;
        self.set(idx, !value);
        Some(idx)
    }

    // Bits past `len` in the last word must stay clear so `count` and `scan`
    // never see them.
    fn clear_tail(&mut self) {
        let used = self.len % WORD_BITS;
        if used != 0 {
            if let Some(last) = self.words.last_mut() {
                *last &= (1u64 << used) - 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_fit_scan() {
        let mut map = Bitmap::new(130);
        assert_eq!(map.count(false), 130);
        assert_eq!(map.scan_and_flip(false), Some(0));
        assert_eq!(map.scan_and_flip(false), Some(1));
        map.set(0, false);
        assert_eq!(map.scan_and_flip(false), Some(0));
        assert_eq!(map.count(true), 2);
    }

    #[test]
    fn scan_crosses_words() {
        let mut map = Bitmap::new(70);
        for i in 0..65 {
            map.set(i, true);
        }
        assert_eq!(map.scan(false), Some(65));
        assert_eq!(map.scan(true), Some(0));
    }

    #[test]
    fn full_map_has_no_free_bit() {
        let mut map = Bitmap::new(67);
        map.set_all(true);
        assert_eq!(map.count(true), 67);
        assert_eq!(map.scan(false), None);
        assert_eq!(map.scan_and_flip(false), None);
        map.set_all(false);
        assert_eq!(map.count(true), 0);
    }

    #[test]
    fn empty_map() {
        let mut map = Bitmap::new(0);
        assert!(map.is_empty());
        assert_eq!(map.scan_and_flip(false), None);
    }

    #[test]
    #[should_panic]
    fn out_of_bounds() {
        Bitmap::new(8).test(8);
    }
}
