//! Two-stage binary passage retrieval.
//!
//! [`BinaryPassageRetriever`] ties the encoding side (`bpr-embeddings`) to the
//! index side (`bpr-core`):
//!
//! ```text
//! query ─► query tower ─► (dense, code) ─► Hamming shortlist ─► ±1 re-rank ─► top-k documents
//! ```
//!
//! # Example
//!
//! ```rust
//! use bpr_core::{Document, InMemoryDocumentStore};
//! use bpr_embeddings::BprConfig;
//! use bpr_retriever::BinaryPassageRetriever;
//!
//! let mut config = BprConfig::default();
//! config.model.embedding_dim = 32;
//! config.model.hidden_dim = 16;
//! config.model.vocab_size = 2048;
//! config.device.use_gpu = false;
//!
//! let store = InMemoryDocumentStore::from(vec![
//!     Document::new("a", "Binary codes make retrieval cheap."),
//!     Document::new("b", "Paris is the capital of France."),
//! ]);
//! let mut retriever = BinaryPassageRetriever::new(store, config).unwrap();
//! retriever.update_embeddings().unwrap();
//!
//! let docs = retriever.retrieve("what makes retrieval cheap?", Some(1)).unwrap();
//! assert_eq!(docs.len(), 1);
//! ```

pub mod rerank;
pub mod retriever;

pub use rerank::rerank;
pub use retriever::{BinaryPassageRetriever, CONFIG_FILE};
