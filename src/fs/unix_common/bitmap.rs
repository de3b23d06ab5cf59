//! Device-wide block bitmap.
//!
//! Uses little-endian bit order within each byte (bit 0 = LSB), the same
//! convention as the Linux on-disk bitmaps. Free-space reconciliation marks
//! free extents here, inverts the map, and walks the runs of set bits.

/// An owned bitmap of `bit_count` bits, all initially clear.
#[derive(Debug, Clone)]
pub struct Bitmap {
    data: Vec<u8>,
    bit_count: u64,
}

impl Bitmap {
    pub fn new(bit_count: u64) -> Self {
        let bytes = bit_count.div_ceil(8) as usize;
        Self {
            data: vec![0u8; bytes],
            bit_count,
        }
    }

    /// Test whether the bit at `index` is set (1).
    ///
    /// Returns `false` if `index` is out of range.
    #[inline]
    pub fn is_bit_set(&self, index: u64) -> bool {
        if index >= self.bit_count {
            return false;
        }
        let byte_idx = (index / 8) as usize;
        let bit_idx = (index % 8) as u32;
        self.data[byte_idx] & (1u8 << bit_idx) != 0
    }

    /// Set the bit at `index`. Returns `false` if it was already set or out of range.
    #[inline]
    pub fn set(&mut self, index: u64) -> bool {
        if index >= self.bit_count {
            return false;
        }
        let byte_idx = (index / 8) as usize;
        let mask = 1u8 << (index % 8) as u32;
        let was_clear = self.data[byte_idx] & mask == 0;
        self.data[byte_idx] |= mask;
        was_clear
    }

    /// Set `count` bits starting at `start`, clamped to the bitmap.
    ///
    /// Returns how many bits changed from clear to set.
    pub fn set_range(&mut self, start: u64, count: u64) -> u64 {
        let end = start.saturating_add(count).min(self.bit_count);
        let mut newly_set = 0;
        for i in start..end {
            if self.set(i) {
                newly_set += 1;
            }
        }
        newly_set
    }

    /// Flip every valid bit.
    pub fn invert(&mut self) {
        for byte in &mut self.data {
            *byte = !*byte;
        }
        let remaining_bits = (self.bit_count % 8) as u32;
        if remaining_bits > 0 {
            if let Some(last) = self.data.last_mut() {
                *last &= (1u8 << remaining_bits) - 1;
            }
        }
    }

    /// Count the number of set (1) bits in the valid range.
    pub fn count_set_bits(&self) -> u64 {
        // Bits past bit_count are always kept clear.
        self.data.iter().map(|b| b.count_ones() as u64).sum()
    }

    /// Iterate over maximal runs of set bits as `(start, length)`.
    pub fn set_runs(&self) -> SetRunsIter<'_> {
        SetRunsIter {
            bitmap: self,
            index: 0,
        }
    }
}

/// Iterator over maximal runs of set bits in a [`Bitmap`].
pub struct SetRunsIter<'a> {
    bitmap: &'a Bitmap,
    index: u64,
}

impl Iterator for SetRunsIter<'_> {
    type Item = (u64, u64);

    fn next(&mut self) -> Option<(u64, u64)> {
        let total = self.bitmap.bit_count;
        while self.index < total {
            // Skip whole clear bytes quickly
            if self.index % 8 == 0 && self.bitmap.data[(self.index / 8) as usize] == 0 {
                self.index += 8;
                continue;
            }
            if self.bitmap.is_bit_set(self.index) {
                break;
            }
            self.index += 1;
        }
        if self.index >= total {
            return None;
        }

        let start = self.index;
        while self.index < total && self.bitmap.is_bit_set(self.index) {
            self.index += 1;
        }
        Some((start, self.index - start))
    }
}
