//! Dual-encoder training.
//!
//! - [`data`]: DPR-format examples and a shuffling batch loader
//! - [`optimizer`]: AdamW with warmup/decay and gradient clipping
//! - [`trainer`]: the training loop, dev evaluation and checkpointing

pub mod data;
pub mod optimizer;
pub mod trainer;

pub use data::{load_dpr_json, Passage, SimilarityDataLoader, TrainingBatch, TrainingExample};
pub use optimizer::{AdamW, AdamWConfig};
pub use trainer::{EpochResult, EvalMetrics, Trainer, TrainingConfig, TrainingHistory};
