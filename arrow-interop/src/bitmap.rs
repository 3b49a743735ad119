//! Packed per-row bitmaps in Arrow bit order (LSB first).

use std::sync::atomic::{AtomicU32, Ordering};

/// An immutable packed bitmap, one bit per row.
///
/// Used both as the null bitmap (bit set = value present) and as the
/// overflow mask of Decimal128 columns (bit set = deferred to the CPU).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitmap {
    bits: Vec<u8>,
    len: usize,
}

pub type NullBitmap = Bitmap;
pub type OverflowMask = Bitmap;

impl Bitmap {
    pub fn new_zeroed(len: usize) -> Self {
        Self {
            bits: vec![0; len.div_ceil(8)],
            len,
        }
    }

    pub fn new_set(len: usize) -> Self {
        let mut bitmap = Self::new_zeroed(len);
        for i in 0..len {
            bitmap.set(i);
        }
        bitmap
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get(&self, i: usize) -> bool {
        debug_assert!(i < self.len);
        self.bits[i / 8] & (1 << (i % 8)) != 0
    }

    pub fn set(&mut self, i: usize) {
        debug_assert!(i < self.len);
        self.bits[i / 8] |= 1 << (i % 8);
    }

    pub fn count_set(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }

    /// Indices of set bits in ascending order.
    pub fn iter_set(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.len).filter(move |&i| self.get(i))
    }

    /// `self AND NOT other`, used to hide deferred rows from the validity.
    pub fn and_not(&self, other: &Bitmap) -> Bitmap {
        debug_assert_eq!(self.len, other.len);
        Bitmap {
            bits: self
                .bits
                .iter()
                .zip(&other.bits)
                .map(|(a, b)| a & !b)
                .collect(),
            len: self.len,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bits
    }
}

/// Bitmap written concurrently by one logical thread per row.
///
/// Threads of neighbouring rows share words, so bits are set with an atomic
/// OR. The builder is frozen into a [`Bitmap`] after the launch barrier.
#[derive(Debug)]
pub struct AtomicBitmap {
    words: Vec<AtomicU32>,
    len: usize,
}

impl AtomicBitmap {
    pub fn new(len: usize) -> Self {
        Self {
            words: (0..len.div_ceil(32)).map(|_| AtomicU32::new(0)).collect(),
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn set(&self, i: usize) {
        debug_assert!(i < self.len);
        self.words[i / 32].fetch_or(1 << (i % 32), Ordering::Relaxed);
    }

    pub fn freeze(self) -> Bitmap {
        let mut bits: Vec<u8> = self
            .words
            .into_iter()
            .flat_map(|w| w.into_inner().to_le_bytes())
            .collect();
        bits.truncate(self.len.div_ceil(8));
        Bitmap {
            bits,
            len: self.len,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lsb_first_packing() {
        let mut bitmap = Bitmap::new_zeroed(10);
        bitmap.set(0);
        bitmap.set(9);
        assert_eq!(bitmap.as_bytes(), &[0b0000_0001, 0b0000_0010]);
        assert_eq!(bitmap.count_set(), 2);
        assert_eq!(bitmap.iter_set().collect::<Vec<_>>(), vec![0, 9]);
    }

    #[test]
    fn test_atomic_freeze_matches_sequential() {
        let atomic = AtomicBitmap::new(70);
        let mut plain = Bitmap::new_zeroed(70);
        for i in (0..70).filter(|i| i % 3 == 0) {
            atomic.set(i);
            plain.set(i);
        }
        assert_eq!(atomic.freeze(), plain);
    }

    #[test]
    fn test_and_not_clears_masked_bits() {
        let valid = Bitmap::new_set(5);
        let mut overflow = Bitmap::new_zeroed(5);
        overflow.set(2);
        let combined = valid.and_not(&overflow);
        assert_eq!(combined.iter_set().collect::<Vec<_>>(), vec![0, 1, 3, 4]);
    }
}
