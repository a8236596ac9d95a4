//! Dense storage for quantization codes.
//!
//! Codes of `bits` width are packed little-endian into a byte buffer. A 2-bit
//! tensor stores four codes per byte, a 4-bit tensor two.

use serde::Serialize;

use super::levels::validate_bits;
use crate::error::{Result, VggQuantError};

/// Level indices packed at `bits` bits per element.
#[derive(Clone, PartialEq, Eq, Serialize)]
pub struct PackedCodes {
    data: Vec<u8>,
    len: usize,
    bits: u8,
}

impl std::fmt::Debug for PackedCodes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackedCodes")
            .field("len", &self.len)
            .field("bits", &self.bits)
            .field("bytes", &self.data.len())
            .finish_non_exhaustive()
    }
}

impl PackedCodes {
    /// Pack codes at `bits` bits each.
    ///
    /// # Errors
    ///
    /// Returns error if `bits` is invalid or a code does not fit in `bits`.
    pub fn pack(codes: &[u16], bits: u8) -> Result<Self> {
        validate_bits(bits)?;
        let max_code = (1u32 << bits) - 1;
        let total_bits = codes.len() * usize::from(bits);
        let mut data = vec![0u8; total_bits.div_ceil(8)];

        for (i, &code) in codes.iter().enumerate() {
            if u32::from(code) > max_code {
                return Err(VggQuantError::Quantization(format!(
                    "code {code} at index {i} does not fit in {bits} bits"
                )));
            }
            let mut bit = i * usize::from(bits);
            let mut remaining = u32::from(code);
            for _ in 0..bits {
                if remaining & 1 == 1 {
                    data[bit / 8] |= 1 << (bit % 8);
                }
                remaining >>= 1;
                bit += 1;
            }
        }

        Ok(Self {
            data,
            len: codes.len(),
            bits,
        })
    }

    /// Number of codes.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Whether there are no codes.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bits per code.
    #[must_use]
    pub const fn bits(&self) -> u8 {
        self.bits
    }

    /// Code at `index`, or `None` past the end.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<u16> {
        if index >= self.len {
            return None;
        }
        let start = index * usize::from(self.bits);
        let code = (0..usize::from(self.bits)).fold(0u16, |acc, offset| {
            let bit = start + offset;
            let set = (self.data[bit / 8] >> (bit % 8)) & 1;
            acc | (u16::from(set) << offset)
        });
        Some(code)
    }

    /// Iterate over all codes.
    pub fn iter(&self) -> impl Iterator<Item = u16> + '_ {
        (0..self.len).filter_map(move |i| self.get(i))
    }

    /// Memory used by the packed buffer in bytes.
    #[must_use]
    pub fn memory_bytes(&self) -> usize {
        self.data.len()
    }

    /// Compression ratio vs FP32.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn compression_ratio(&self) -> f32 {
        if self.data.is_empty() {
            return 1.0;
        }
        (self.len * 4) as f32 / self.data.len() as f32
    }

    /// Number of occurrences of each code, indexed by code.
    #[must_use]
    pub fn histogram(&self) -> Vec<usize> {
        let mut counts = vec![0usize; 1 << self.bits];
        for code in self.iter() {
            counts[usize::from(code)] += 1;
        }
        counts
    }
}
