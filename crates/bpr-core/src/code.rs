//! Packed binary codes.
//!
//! A binary code is the sign pattern of a D-dimensional embedding. It has two
//! physical forms that must convert into each other without loss:
//!
//! - **packed**: ceil(D/8) bytes. Dimension `i` lives in byte `i / 8` at bit
//!   `7 - i % 8` (MSB-first, the numpy `packbits` layout). Padding bits in the
//!   last byte are always zero.
//! - **unpacked ±1**: D floats, `+1.0` for a set bit and `-1.0` for a clear
//!   bit. Re-ranking takes dot products against this form, so a clear bit must
//!   never become `0.0`.
//!
//! The packed layout is the only persisted format in the system and must stay
//! bit-exact.

use serde::{Deserialize, Serialize};

use crate::error::{IndexError, IndexResult};

// =============================================================================
// Free functions over raw buffers
// =============================================================================

/// Number of bytes needed to pack `bits` sign bits.
#[inline]
pub fn packed_len(bits: usize) -> usize {
    bits.div_ceil(8)
}

#[inline]
fn bit_mask(i: usize) -> u8 {
    0x80 >> (i % 8)
}

/// Pack the signs of `values` MSB-first. A value sets its bit iff it is `> 0`.
pub fn pack_signs(values: &[f32]) -> Vec<u8> {
    let mut out = vec![0u8; packed_len(values.len())];
    for (i, &v) in values.iter().enumerate() {
        if v > 0.0 {
            out[i / 8] |= bit_mask(i);
        }
    }
    out
}

/// Unpack the first `bits` bits of `packed` into ±1 floats.
///
/// Bits past the end of `packed` read as clear.
pub fn unpack_signs(packed: &[u8], bits: usize) -> Vec<f32> {
    (0..bits)
        .map(|i| match packed.get(i / 8) {
            Some(byte) if byte & bit_mask(i) != 0 => 1.0,
            _ => -1.0,
        })
        .collect()
}

/// Count of differing bits between two packed buffers of equal length.
///
/// Works on u64 words with a byte-wise tail.
pub fn hamming_distance(a: &[u8], b: &[u8]) -> u32 {
    debug_assert_eq!(a.len(), b.len());
    let mut words_a = a.chunks_exact(8);
    let mut words_b = b.chunks_exact(8);
    let mut distance = 0u32;
    for (wa, wb) in (&mut words_a).zip(&mut words_b) {
        let x = u64::from_ne_bytes([wa[0], wa[1], wa[2], wa[3], wa[4], wa[5], wa[6], wa[7]]);
        let y = u64::from_ne_bytes([wb[0], wb[1], wb[2], wb[3], wb[4], wb[5], wb[6], wb[7]]);
        distance += (x ^ y).count_ones();
    }
    for (x, y) in words_a.remainder().iter().zip(words_b.remainder()) {
        distance += (x ^ y).count_ones();
    }
    distance
}

// =============================================================================
// BinaryCode
// =============================================================================

/// A D-bit sign code in packed form.
///
/// # Example
///
/// ```
/// use bpr_core::BinaryCode;
///
/// let code = BinaryCode::from_signs(&[0.3, -1.2, 0.0, 2.0]);
/// assert_eq!(code.as_bytes(), &[0b1001_0000]);
/// assert_eq!(code.to_unpacked(), vec![1.0, -1.0, -1.0, 1.0]);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "PackedCode")]
pub struct BinaryCode {
    bytes: Vec<u8>,
    bits: usize,
}

/// Unchecked serde form of [`BinaryCode`]; validated through
/// [`BinaryCode::from_packed`] on the way in.
#[derive(Deserialize)]
struct PackedCode {
    bytes: Vec<u8>,
    bits: usize,
}

impl TryFrom<PackedCode> for BinaryCode {
    type Error = IndexError;

    fn try_from(raw: PackedCode) -> IndexResult<Self> {
        BinaryCode::from_packed(raw.bytes, raw.bits)
    }
}

impl BinaryCode {
    /// All-clear code of the given width.
    pub fn zeros(bits: usize) -> Self {
        Self {
            bytes: vec![0u8; packed_len(bits)],
            bits,
        }
    }

    /// Wrap an already packed buffer.
    ///
    /// Padding bits in the final byte are cleared so that equal codes always
    /// compare equal byte for byte.
    ///
    /// # Errors
    /// `IndexError::InvalidPackedLength` if `bytes.len() != ceil(bits / 8)`.
    pub fn from_packed(mut bytes: Vec<u8>, bits: usize) -> IndexResult<Self> {
        if bytes.len() != packed_len(bits) {
            return Err(IndexError::InvalidPackedLength {
                bits,
                bytes: bytes.len(),
            });
        }
        let tail = bits % 8;
        if tail != 0 {
            if let Some(last) = bytes.last_mut() {
                *last &= 0xFFu8 << (8 - tail);
            }
        }
        Ok(Self { bytes, bits })
    }

    /// Sign-threshold a continuous vector: bit `i` is set iff `values[i] > 0`.
    pub fn from_signs(values: &[f32]) -> Self {
        Self {
            bytes: pack_signs(values),
            bits: values.len(),
        }
    }

    /// Pack a ±1 vector. Equivalent to [`BinaryCode::from_signs`].
    pub fn from_unpacked(values: &[f32]) -> Self {
        Self::from_signs(values)
    }

    /// Expand to ±1 floats.
    pub fn to_unpacked(&self) -> Vec<f32> {
        unpack_signs(&self.bytes, self.bits)
    }

    /// Number of bits (the embedding dimension D).
    #[inline]
    pub fn bits(&self) -> usize {
        self.bits
    }

    /// Number of packed bytes.
    #[inline]
    pub fn byte_len(&self) -> usize {
        self.bytes.len()
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Bit value at `index`. Out-of-range indices read as clear.
    pub fn bit(&self, index: usize) -> bool {
        index < self.bits && self.bytes[index / 8] & bit_mask(index) != 0
    }

    /// Set or clear the bit at `index`. Out-of-range indices are ignored.
    pub fn set_bit(&mut self, index: usize, value: bool) {
        if index >= self.bits {
            return;
        }
        if value {
            self.bytes[index / 8] |= bit_mask(index);
        } else {
            self.bytes[index / 8] &= !bit_mask(index);
        }
    }

    /// Population count.
    pub fn count_ones(&self) -> u32 {
        self.bytes.iter().map(|b| b.count_ones()).sum()
    }

    /// Hamming distance to a code of the same width.
    ///
    /// # Errors
    /// `IndexError::CodeLengthMismatch` if the widths differ.
    pub fn hamming(&self, other: &Self) -> IndexResult<u32> {
        if self.bits != other.bits {
            return Err(IndexError::CodeLengthMismatch {
                expected: self.bits,
                actual: other.bits,
            });
        }
        Ok(hamming_distance(&self.bytes, &other.bytes))
    }

    /// Dot product of the ±1 form with a dense vector, without materialising
    /// the unpacked code.
    ///
    /// Returns `None` if `dense.len() != self.bits()`.
    pub fn signed_dot(&self, dense: &[f32]) -> Option<f32> {
        if dense.len() != self.bits {
            return None;
        }
        Some(
            dense
                .iter()
                .enumerate()
                .map(|(i, &v)| if self.bit(i) { v } else { -v })
                .sum(),
        )
    }
}
