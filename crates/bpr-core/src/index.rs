//! Candidate index over packed binary codes.
//!
//! The index is the shortlist stage of retrieval: given a query code it
//! returns the k stored codes closest in Hamming distance. It also hands back
//! the stored code for an id so the re-ranker can score it against a dense
//! query.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::code::{hamming_distance, packed_len, BinaryCode};
use crate::error::{IndexError, IndexResult};

/// Pluggable Hamming-search backend.
///
/// Implementations must be exact with respect to the ordering contract:
/// ascending Hamming distance, ties broken by ascending id.
pub trait CandidateIndex: Send + Sync {
    /// Store `code` under `id`.
    ///
    /// # Errors
    /// - `DuplicateId` if `id` is already present
    /// - `CodeLengthMismatch` if the code width differs from [`code_bits`](Self::code_bits)
    fn insert(&mut self, id: u64, code: &BinaryCode) -> IndexResult<()>;

    /// Up to `k` `(id, hamming)` pairs nearest to `query`.
    ///
    /// `k >= len()` returns every entry. `k == 0` returns nothing.
    fn search(&self, query: &BinaryCode, k: usize) -> IndexResult<Vec<(u64, u32)>>;

    /// The stored code for `id`.
    fn reconstruct(&self, id: u64) -> IndexResult<BinaryCode>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bits per code (the embedding dimension).
    fn code_bits(&self) -> usize;

    /// Bytes per packed code.
    fn code_bytes(&self) -> usize {
        packed_len(self.code_bits())
    }

    /// Drop every entry. Required before re-inserting existing ids.
    fn clear(&mut self);

    /// Ids in insertion order.
    fn ids(&self) -> Vec<u64>;
}

/// Exact brute-force Hamming index.
///
/// Codes live in one contiguous byte arena, `code_bytes` per entry, in
/// insertion order. Search scans the whole arena.
///
/// Deserialization validates the arena and rebuilds the id lookup, so a
/// truncated or corrupt file fails with an [`IndexError`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "FlatIndexParts")]
pub struct FlatHammingIndex {
    code_bits: usize,
    ids: Vec<u64>,
    codes: Vec<u8>,
    #[serde(skip)]
    positions: HashMap<u64, usize>,
}

/// Unchecked serde form of [`FlatHammingIndex`].
#[derive(Deserialize)]
struct FlatIndexParts {
    code_bits: usize,
    ids: Vec<u64>,
    codes: Vec<u8>,
}

impl TryFrom<FlatIndexParts> for FlatHammingIndex {
    type Error = IndexError;

    fn try_from(parts: FlatIndexParts) -> IndexResult<Self> {
        let mut index = FlatHammingIndex::new(parts.code_bits)?;
        let width = packed_len(parts.code_bits);
        if parts.codes.len() != parts.ids.len() * width {
            return Err(IndexError::CorruptArena {
                entries: parts.ids.len(),
                bytes: parts.codes.len(),
                code_bytes: width,
            });
        }
        for (&id, slot) in parts.ids.iter().zip(parts.codes.chunks_exact(width)) {
            let code = BinaryCode::from_packed(slot.to_vec(), parts.code_bits)?;
            index.insert(id, &code)?;
        }
        Ok(index)
    }
}

impl FlatHammingIndex {
    /// Empty index for `code_bits`-bit codes.
    ///
    /// # Errors
    /// `ZeroWidth` if `code_bits == 0`.
    pub fn new(code_bits: usize) -> IndexResult<Self> {
        if code_bits == 0 {
            return Err(IndexError::ZeroWidth);
        }
        Ok(Self {
            code_bits,
            ids: Vec::new(),
            codes: Vec::new(),
            positions: HashMap::new(),
        })
    }

    fn slot(&self, pos: usize) -> &[u8] {
        let width = packed_len(self.code_bits);
        &self.codes[pos * width..(pos + 1) * width]
    }

    fn position(&self, id: u64) -> Option<usize> {
        self.positions.get(&id).copied()
    }

    fn check_width(&self, code: &BinaryCode) -> IndexResult<()> {
        if code.bits() != self.code_bits {
            return Err(IndexError::CodeLengthMismatch {
                expected: self.code_bits,
                actual: code.bits(),
            });
        }
        Ok(())
    }
}

impl CandidateIndex for FlatHammingIndex {
    fn insert(&mut self, id: u64, code: &BinaryCode) -> IndexResult<()> {
        self.check_width(code)?;
        if self.position(id).is_some() {
            return Err(IndexError::DuplicateId { id });
        }
        self.positions.insert(id, self.ids.len());
        self.ids.push(id);
        self.codes.extend_from_slice(code.as_bytes());
        Ok(())
    }

    fn search(&self, query: &BinaryCode, k: usize) -> IndexResult<Vec<(u64, u32)>> {
        self.check_width(query)?;
        if k == 0 || self.ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut scored: Vec<(u64, u32)> = self
            .ids
            .iter()
            .enumerate()
            .map(|(pos, &id)| (id, hamming_distance(query.as_bytes(), self.slot(pos))))
            .collect();

        let order = |a: &(u64, u32), b: &(u64, u32)| a.1.cmp(&b.1).then(a.0.cmp(&b.0));
        if k < scored.len() {
            scored.select_nth_unstable_by(k - 1, order);
            scored.truncate(k);
        }
        scored.sort_unstable_by(order);
        Ok(scored)
    }

    fn reconstruct(&self, id: u64) -> IndexResult<BinaryCode> {
        let pos = self.position(id).ok_or(IndexError::NotFound { id })?;
        BinaryCode::from_packed(self.slot(pos).to_vec(), self.code_bits)
    }

    fn len(&self) -> usize {
        self.ids.len()
    }

    fn code_bits(&self) -> usize {
        self.code_bits
    }

    fn clear(&mut self) {
        tracing::debug!(entries = self.ids.len(), "clearing flat hamming index");
        self.ids.clear();
        self.codes.clear();
        self.positions.clear();
    }

    fn ids(&self) -> Vec<u64> {
        self.ids.clone()
    }
}
