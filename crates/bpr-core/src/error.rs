//! Index error types with fail-fast semantics.
//!
//! Every variant here is recoverable by the caller: looking up an id that
//! was never inserted, inserting an id twice, mixing codes of different
//! widths in one index, or reading back a corrupt persisted index.

use thiserror::Error;

/// Candidate index operation errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IndexError {
    /// Candidate id not present in the index.
    #[error("INDEX ERROR: candidate {id} not found")]
    NotFound {
        /// The missing candidate id
        id: u64,
    },

    /// Candidate id already present.
    ///
    /// Existing entries are never overwritten; reindexing must clear or
    /// rebuild the index first.
    #[error("INDEX ERROR: candidate {id} already indexed - clear or rebuild before reindexing")]
    DuplicateId {
        /// The duplicated candidate id
        id: u64,
    },

    /// Code width disagrees with the index configuration.
    #[error("INDEX ERROR: code length mismatch - expected {expected} bits, got {actual}")]
    CodeLengthMismatch {
        /// Bits per code configured on the index
        expected: usize,
        /// Bits in the offending code
        actual: usize,
    },

    /// Packed buffer does not hold exactly ceil(bits / 8) bytes.
    #[error("INDEX ERROR: packed buffer of {bytes} bytes cannot hold a {bits}-bit code")]
    InvalidPackedLength {
        /// Declared code width
        bits: usize,
        /// Buffer length received
        bytes: usize,
    },

    /// Persisted code arena does not hold exactly one code per id.
    #[error("INDEX ERROR: code arena of {bytes} bytes does not hold {entries} codes of {code_bytes} bytes")]
    CorruptArena {
        /// Number of stored ids
        entries: usize,
        /// Arena length received
        bytes: usize,
        /// Bytes per packed code
        code_bytes: usize,
    },

    /// Zero-width codes cannot be indexed.
    #[error("INDEX ERROR: code width must be at least 1 bit")]
    ZeroWidth,
}

/// Result type for index operations.
pub type IndexResult<T> = Result<T, IndexError>;
