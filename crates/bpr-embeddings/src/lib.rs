//! Encoding and training side of binary passage retrieval.
//!
//! A two-tower model encodes queries and passages into dense vectors of width
//! D; a differentiable hashing layer turns those into ±1 codes that the
//! candidate index stores bit-packed. This crate runs everything that touches
//! tensors, on top of candle.
//!
//! # Architecture
//!
//! - **HashActivation**: sign forward, `γ/(1+γ|x|)^2` surrogate backward
//! - **EncoderTower / TowerRegistry**: pluggable towers built by family name
//! - **DualEncoder**: query tower + passage tower + hashing layer
//! - **SimilarityHead**: joint binary-hinge and dense cross-entropy loss
//! - **EmbeddingExtractor**: chunked forward passes for indexing and querying
//! - **training**: DPR data loader, AdamW and the training loop
//!
//! # Example
//!
//! ```rust
//! use bpr_embeddings::{BprConfig, DualEncoder, HashingTokenizer, Tokenizer, TowerRegistry};
//! use candle_core::Device;
//!
//! let mut config = BprConfig::default();
//! config.model.embedding_dim = 16;
//! config.model.hidden_dim = 16;
//! config.model.vocab_size = 1000;
//!
//! let encoder = DualEncoder::from_config(&config, &TowerRegistry::with_defaults(), &Device::Cpu).unwrap();
//! let tokenizer = HashingTokenizer::new(config.model.vocab_size).unwrap();
//! let batch = tokenizer.tokenize(&["what is a hash code"], 64, &Device::Cpu).unwrap();
//!
//! let out = encoder.forward(Some(&batch), None).unwrap();
//! assert_eq!(out.binary_query.unwrap().dims(), &[1, 16]);
//! ```

pub mod batch;
pub mod config;
pub mod device;
pub mod dual_encoder;
pub mod error;
pub mod hashing;
pub mod head;
pub mod tokenization;
pub mod towers;
pub mod training;

pub use batch::{split_batch, EmbeddingExtractor, ExtractedEmbeddings, TitledPassage};
pub use config::{BatchConfig, BprConfig, DeviceConfig, HashConfig, ModelConfig, RetrievalConfig};
pub use device::select_device;
pub use dual_encoder::{DualEncoder, DualEncoderOutput, PASSAGE_ENCODER_DIR, QUERY_ENCODER_DIR};
pub use error::{EmbeddingError, EmbeddingResult};
pub use hashing::HashActivation;
pub use head::{
    HeadConfig, HeadInput, HeadOutput, LossComponents, SimilarityFunction, SimilarityHead,
};
pub use tokenization::{HashingTokenizer, HfTokenizer, TokenBatch, TokenizedText, Tokenizer};
pub use towers::{
    save_tower, EncoderTower, MeanPoolTower, TowerFactory, TowerRegistry, TowerRole, TowerSpec,
    MEAN_POOL_FAMILY,
};
pub use training::{
    load_dpr_json, AdamW, AdamWConfig, EpochResult, EvalMetrics, Passage, SimilarityDataLoader,
    Trainer, TrainingBatch, TrainingConfig, TrainingExample, TrainingHistory,
};
