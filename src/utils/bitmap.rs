//! Bitmap data structure helper.

use std::fmt;

use crate::utils::RingStoreError;

use fixedbitset::FixedBitSet;

/// Compact bitmap for u8 node ID -> bool mapping.
#[derive(Clone, PartialEq, Eq)]
pub struct Bitmap(FixedBitSet);

impl Bitmap {
    /// Creates a new bitmap of given size. If `ones` is true, all slots are
    /// marked true initially; otherwise, all slots are initially false.
    pub fn new(size: u8, ones: bool) -> Self {
        if size == 0 {
            panic!("invalid bitmap size {}", size);
        }
        let mut bitset = FixedBitSet::with_capacity(size as usize);

        if ones {
            bitset.set_range(.., true);
        }

        Bitmap(bitset)
    }

    /// Sets bit at index to given flag.
    #[inline]
    pub fn set(&mut self, idx: u8, flag: bool) -> Result<(), RingStoreError> {
        if idx as usize >= self.0.len() {
            return Err(RingStoreError(format!(
                "bitmap index {} out of bound",
                idx
            )));
        }
        self.0.set(idx as usize, flag);
        Ok(())
    }

    /// Gets the bit flag at index.
    #[inline]
    pub fn get(&self, idx: u8) -> Result<bool, RingStoreError> {
        if idx as usize >= self.0.len() {
            return Err(RingStoreError(format!(
                "bitmap index {} out of bound",
                idx
            )));
        }
        Ok(self.0[idx as usize])
    }

    /// Returns the size of the bitmap.
    #[inline]
    pub fn size(&self) -> u8 {
        self.0.len() as u8
    }

    /// Returns the number of trues in the bitmap.
    #[inline]
    pub fn count(&self) -> u8 {
        self.0.count_ones(..) as u8
    }

    /// Iterates over the indices whose bit is set true.
    #[inline]
    pub fn ones(&self) -> impl Iterator<Item = u8> + '_ {
        self.0.ones().map(|idx| idx as u8)
    }
}

// Implement `Debug` trait manually for better trace printing.
impl fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{{{}; [", self.size())?;
        for (pos, idx) in self.ones().enumerate() {
            if pos > 0 {
                write!(f, ", {}", idx)?;
            } else {
                write!(f, "{}", idx)?;
            }
        }
        write!(f, "]}}")
    }
}

#[cfg(test)]
mod bitmap_tests {
    use super::*;

    #[test]
    #[should_panic]
    fn bitmap_new_panic() {
        Bitmap::new(0, true);
    }

    #[test]
    fn bitmap_set_get() {
        let mut map = Bitmap::new(7, false);
        assert!(map.set(0, true).is_ok());
        assert!(map.set(1, false).is_ok());
        assert!(map.set(2, true).is_ok());
        assert!(map.set(7, true).is_err());
        assert_eq!(map.get(0), Ok(true));
        assert_eq!(map.get(1), Ok(false));
        assert_eq!(map.get(2), Ok(true));
        assert_eq!(map.get(3), Ok(false));
        assert!(map.get(7).is_err());
    }

    #[test]
    fn bitmap_count() {
        let mut map = Bitmap::new(7, false);
        assert_eq!(map.count(), 0);
        assert!(map.set(0, true).is_ok());
        assert!(map.set(2, true).is_ok());
        assert!(map.set(3, true).is_ok());
        assert_eq!(map.count(), 3);
    }

    #[test]
    fn bitmap_ones() {
        let mut map = Bitmap::new(5, true);
        assert!(map.set(2, false).is_ok());
        assert_eq!(map.ones().collect::<Vec<u8>>(), vec![0, 1, 3, 4]);
    }
}
