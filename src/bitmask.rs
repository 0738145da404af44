//! Atomic bitmask over bin indices.
//!
//! The backend keeps one bit per size bin to find the smallest non-empty
//! bin at or above a requested index without walking the array; the large
//! object cache scans in the other direction (largest used bin first).
//! `NUM` is the number of tracked bits, `WORDS` must equal
//! `config::bitmask_words(NUM)`.

use core::sync::atomic::{AtomicUsize, Ordering};

const WORD_BITS: usize = usize::BITS as usize;

pub struct BitMask<const NUM: usize, const WORDS: usize> {
    words: [AtomicUsize; WORDS],
}

impl<const NUM: usize, const WORDS: usize> BitMask<NUM, WORDS> {
    pub const fn new() -> Self {
        Self {
            words: [const { AtomicUsize::new(0) }; WORDS],
        }
    }

    pub fn set(&self, idx: usize, val: bool) {
        debug_assert!(idx < NUM);
        let word = idx / WORD_BITS;
        let bit = 1usize << (idx % WORD_BITS);
        if val {
            self.words[word].fetch_or(bit, Ordering::AcqRel);
        } else {
            self.words[word].fetch_and(!bit, Ordering::AcqRel);
        }
    }

    /// Smallest set index that is >= `start`, if any.
    pub fn min_true(&self, start: usize) -> Option<usize> {
        if start >= NUM {
            return None;
        }
        let mut word = start / WORD_BITS;
        // Clear bits below `start` in the first word.
        let mut bits = self.words[word].load(Ordering::Relaxed) & !((1usize << (start % WORD_BITS)) - 1);
        loop {
            if bits != 0 {
                let idx = word * WORD_BITS + bits.trailing_zeros() as usize;
                return if idx < NUM { Some(idx) } else { None };
            }
            word += 1;
            if word >= WORDS {
                return None;
            }
            bits = self.words[word].load(Ordering::Relaxed);
        }
    }

    /// Largest set index that is <= `start`, if any.
    pub fn max_true(&self, start: usize) -> Option<usize> {
        let start = start.min(NUM - 1);
        let mut word = start / WORD_BITS;
        let keep = start % WORD_BITS;
        // Clear bits above `start` in the first word.
        let mut bits = self.words[word].load(Ordering::Relaxed);
        if keep + 1 < WORD_BITS {
            bits &= (1usize << (keep + 1)) - 1;
        }
        loop {
            if bits != 0 {
                let top = WORD_BITS - 1 - bits.leading_zeros() as usize;
                return Some(word * WORD_BITS + top);
            }
            if word == 0 {
                return None;
            }
            word -= 1;
            bits = self.words[word].load(Ordering::Relaxed);
        }
    }

    pub fn reset(&self) {
        for w in &self.words {
            w.store(0, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Mask = BitMask<520, { crate::config::bitmask_words(520) }>;

    #[test]
    fn test_empty_mask() {
        let m = Mask::new();
        assert_eq!(m.min_true(0), None);
        assert_eq!(m.max_true(519), None);
    }

    #[test]
    fn test_set_and_find() {
        let m = Mask::new();
        m.set(3, true);
        m.set(64, true);
        m.set(517, true);

        assert_eq!(m.min_true(0), Some(3));
        assert_eq!(m.min_true(3), Some(3));
        assert_eq!(m.min_true(4), Some(64));
        assert_eq!(m.min_true(65), Some(517));
        assert_eq!(m.min_true(518), None);

        assert_eq!(m.max_true(519), Some(517));
        assert_eq!(m.max_true(516), Some(64));
        assert_eq!(m.max_true(64), Some(64));
        assert_eq!(m.max_true(63), Some(3));
        assert_eq!(m.max_true(2), None);
    }

    #[test]
    fn test_clear() {
        let m = Mask::new();
        m.set(100, true);
        assert_eq!(m.min_true(0), Some(100));
        m.set(100, false);
        assert_eq!(m.min_true(0), None);
    }

    #[test]
    fn test_word_boundaries() {
        let m = Mask::new();
        for idx in [0usize, 63, 64, 127, 128, 511] {
            m.set(idx, true);
        }
        assert_eq!(m.min_true(0), Some(0));
        assert_eq!(m.min_true(1), Some(63));
        assert_eq!(m.min_true(64), Some(64));
        assert_eq!(m.min_true(65), Some(127));
        assert_eq!(m.max_true(519), Some(511));
        assert_eq!(m.max_true(510), Some(128));
        assert_eq!(m.max_true(126), Some(64));
        m.reset();
        assert_eq!(m.min_true(0), None);
    }
}
