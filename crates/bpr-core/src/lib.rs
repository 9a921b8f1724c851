//! Core data types for binary passage retrieval.
//!
//! This crate owns everything on the "cheap" side of the two-stage retrieval
//! pipeline: packed binary codes, the Hamming candidate index, and the
//! document types the index ids resolve to.
//!
//! # Architecture
//!
//! - **BinaryCode**: D sign bits, packed MSB-first into ceil(D/8) bytes
//! - **CandidateIndex**: Trait for Hamming search backends
//! - **FlatHammingIndex**: Exact brute-force backend
//! - **DocumentStore**: Id-indexed document lookup consumed by the retriever
//!
//! # Example
//!
//! ```
//! use bpr_core::{BinaryCode, CandidateIndex, FlatHammingIndex};
//!
//! let mut index = FlatHammingIndex::new(8).unwrap();
//! index.insert(1, &BinaryCode::from_packed(vec![0b1111_0000], 8).unwrap()).unwrap();
//! index.insert(2, &BinaryCode::from_packed(vec![0b1111_1111], 8).unwrap()).unwrap();
//!
//! let query = BinaryCode::from_packed(vec![0b1111_1110], 8).unwrap();
//! let hits = index.search(&query, 1).unwrap();
//! assert_eq!(hits, vec![(2, 1)]);
//! ```

pub mod code;
pub mod document;
pub mod error;
pub mod index;

pub use code::{hamming_distance, pack_signs, packed_len, unpack_signs, BinaryCode};
pub use document::{Document, DocumentStore, InMemoryDocumentStore, DEFAULT_LABEL};
pub use error::{IndexError, IndexResult};
pub use index::{CandidateIndex, FlatHammingIndex};
