//! Root configuration for the binary passage retriever.
//!
//! # Loading Configuration
//!
//! ```rust,ignore
//! use bpr_embeddings::BprConfig;
//!
//! let config = BprConfig::from_file("bpr.toml")?.with_env_overrides();
//! config.validate()?;
//! ```
//!
//! # TOML Structure
//!
//! ```toml
//! [model]
//! query_family = "mean_pool"
//! passage_family = "mean_pool"
//! embedding_dim = 768
//! max_seq_len_query = 64
//! max_seq_len_passage = 256
//!
//! [hash]
//! gamma = 0.1
//!
//! [retrieval]
//! top_k = 10
//! candidates = 1000
//!
//! [batch]
//! batch_size = 16
//!
//! [device]
//! use_gpu = true
//! device_ids = [0]
//!
//! [head]
//! similarity_function = "dot_product"
//! num_hard_negatives = 0
//! ```
//!
//! Invalid configuration is an error, never silently replaced by a default.
//! Every section is validated together by [`BprConfig::validate`].

use std::env;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{EmbeddingError, EmbeddingResult};
use crate::head::HeadConfig;

// ============================================================================
// MODEL CONFIG
// ============================================================================

/// Encoder tower settings shared by the query and passage sides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Registered tower family for the query encoder.
    #[serde(default = "default_family")]
    pub query_family: String,

    /// Registered tower family for the passage encoder.
    #[serde(default = "default_family")]
    pub passage_family: String,

    /// Embedding dimension D. Also the binary code width in bits.
    #[serde(default = "default_embedding_dim")]
    pub embedding_dim: usize,

    /// Hidden width inside each tower.
    #[serde(default = "default_hidden_dim")]
    pub hidden_dim: usize,

    /// Token vocabulary size. Must cover the tokenizer's ids.
    #[serde(default = "default_vocab_size")]
    pub vocab_size: usize,

    #[serde(default = "default_max_seq_len_query")]
    pub max_seq_len_query: usize,

    #[serde(default = "default_max_seq_len_passage")]
    pub max_seq_len_passage: usize,

    /// Dropout on tower outputs during training only.
    #[serde(default = "default_embeds_dropout_prob")]
    pub embeds_dropout_prob: f32,

    /// Encode passages as (title, text) pairs when a title is present.
    #[serde(default = "default_embed_title")]
    pub embed_title: bool,

    /// Path to a HuggingFace `tokenizer.json`. The hashing tokenizer is used
    /// when unset.
    #[serde(default)]
    pub tokenizer_path: Option<String>,

    /// Seed for weight initialisation.
    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_family() -> String {
    "mean_pool".to_string()
}

fn default_embedding_dim() -> usize {
    768
}

fn default_hidden_dim() -> usize {
    768
}

fn default_vocab_size() -> usize {
    30522
}

fn default_max_seq_len_query() -> usize {
    64
}

fn default_max_seq_len_passage() -> usize {
    256
}

fn default_embeds_dropout_prob() -> f32 {
    0.1
}

fn default_embed_title() -> bool {
    true
}

fn default_seed() -> u64 {
    42
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            query_family: default_family(),
            passage_family: default_family(),
            embedding_dim: default_embedding_dim(),
            hidden_dim: default_hidden_dim(),
            vocab_size: default_vocab_size(),
            max_seq_len_query: default_max_seq_len_query(),
            max_seq_len_passage: default_max_seq_len_passage(),
            embeds_dropout_prob: default_embeds_dropout_prob(),
            embed_title: default_embed_title(),
            tokenizer_path: None,
            seed: default_seed(),
        }
    }
}

impl ModelConfig {
    /// # Errors
    /// `EmbeddingError::ConfigError` on empty family names, zero dimensions,
    /// or a dropout probability outside `[0, 1)`.
    pub fn validate(&self) -> EmbeddingResult<()> {
        if self.query_family.is_empty() || self.passage_family.is_empty() {
            return Err(EmbeddingError::config("tower family names cannot be empty"));
        }
        if self.embedding_dim == 0 {
            return Err(EmbeddingError::config("embedding_dim must be > 0"));
        }
        if self.hidden_dim == 0 {
            return Err(EmbeddingError::config("hidden_dim must be > 0"));
        }
        if self.vocab_size < 3 {
            return Err(EmbeddingError::config(format!(
                "vocab_size must be >= 3 to hold the special tokens, got {}",
                self.vocab_size
            )));
        }
        if self.max_seq_len_query < 2 || self.max_seq_len_passage < 2 {
            return Err(EmbeddingError::config(format!(
                "max_seq_len_query and max_seq_len_passage must be >= 2, got {} and {}",
                self.max_seq_len_query, self.max_seq_len_passage
            )));
        }
        if !(0.0..1.0).contains(&self.embeds_dropout_prob) {
            return Err(EmbeddingError::config(format!(
                "embeds_dropout_prob must be in [0, 1), got {}",
                self.embeds_dropout_prob
            )));
        }
        Ok(())
    }
}

// ============================================================================
// HASH CONFIG
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HashConfig {
    /// Surrogate-gradient sharpness. Finite and > 0.
    #[serde(default = "default_gamma")]
    pub gamma: f64,
}

fn default_gamma() -> f64 {
    0.1
}

impl Default for HashConfig {
    fn default() -> Self {
        Self {
            gamma: default_gamma(),
        }
    }
}

impl HashConfig {
    pub fn validate(&self) -> EmbeddingResult<()> {
        if !self.gamma.is_finite() || self.gamma <= 0.0 {
            return Err(EmbeddingError::config(format!(
                "gamma must be finite and > 0, got {}",
                self.gamma
            )));
        }
        Ok(())
    }
}

// ============================================================================
// RETRIEVAL CONFIG
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Documents returned when the caller passes no `top_k`.
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    /// Shortlist size taken from the Hamming index before re-ranking.
    #[serde(default = "default_candidates")]
    pub candidates: usize,
}

fn default_top_k() -> usize {
    10
}

fn default_candidates() -> usize {
    1000
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            candidates: default_candidates(),
        }
    }
}

impl RetrievalConfig {
    pub fn validate(&self) -> EmbeddingResult<()> {
        if self.top_k == 0 {
            return Err(EmbeddingError::config("top_k must be > 0"));
        }
        if self.candidates < self.top_k {
            return Err(EmbeddingError::config(format!(
                "candidates ({}) must be >= top_k ({})",
                self.candidates, self.top_k
            )));
        }
        Ok(())
    }
}

// ============================================================================
// BATCH CONFIG
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Texts per forward pass during embedding extraction.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

fn default_batch_size() -> usize {
    16
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
        }
    }
}

impl BatchConfig {
    pub fn validate(&self) -> EmbeddingResult<()> {
        if self.batch_size == 0 {
            return Err(EmbeddingError::config("batch_size must be > 0"));
        }
        Ok(())
    }
}

// ============================================================================
// DEVICE CONFIG
// ============================================================================

/// Device placement. Only the first entry of `device_ids` is used.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Try CUDA/Metal before falling back to CPU.
    #[serde(default = "default_use_gpu")]
    pub use_gpu: bool,

    #[serde(default = "default_device_ids")]
    pub device_ids: Vec<usize>,
}

fn default_use_gpu() -> bool {
    true
}

fn default_device_ids() -> Vec<usize> {
    vec![0]
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            use_gpu: default_use_gpu(),
            device_ids: default_device_ids(),
        }
    }
}

impl DeviceConfig {
    pub fn validate(&self) -> EmbeddingResult<()> {
        if self.use_gpu && self.device_ids.is_empty() {
            return Err(EmbeddingError::config(
                "device_ids cannot be empty when use_gpu is true",
            ));
        }
        Ok(())
    }
}

// ============================================================================
// ROOT CONFIG
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BprConfig {
    #[serde(default)]
    pub model: ModelConfig,

    #[serde(default)]
    pub hash: HashConfig,

    #[serde(default)]
    pub retrieval: RetrievalConfig,

    #[serde(default)]
    pub batch: BatchConfig,

    #[serde(default)]
    pub device: DeviceConfig,

    #[serde(default)]
    pub head: HeadConfig,
}

impl BprConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    /// `EmbeddingError::ConfigError` if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> EmbeddingResult<Self> {
        let path = path.as_ref();

        let contents = std::fs::read_to_string(path).map_err(|e| {
            EmbeddingError::config(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;

        toml::from_str(&contents).map_err(|e| {
            EmbeddingError::config(format!(
                "Failed to parse TOML in '{}': {}",
                path.display(),
                e
            ))
        })
    }

    /// Validate every section, returning the first error prefixed with its
    /// section name.
    pub fn validate(&self) -> EmbeddingResult<()> {
        fn section(name: &str, result: EmbeddingResult<()>) -> EmbeddingResult<()> {
            result.map_err(|e| match e {
                EmbeddingError::ConfigError { message } => {
                    EmbeddingError::config(format!("[{}] {}", name, message))
                }
                other => other,
            })
        }

        section("model", self.model.validate())?;
        section("hash", self.hash.validate())?;
        section("retrieval", self.retrieval.validate())?;
        section("batch", self.batch.validate())?;
        section("device", self.device.validate())?;
        section("head", self.head.validate())?;

        if self.batch.batch_size < self.device.device_ids.len() {
            tracing::warn!(
                batch_size = self.batch.batch_size,
                devices = self.device.device_ids.len(),
                "batch_size is smaller than the number of configured devices"
            );
        }
        Ok(())
    }

    /// Apply environment variable overrides. Prefix: `BPR_`.
    ///
    /// | Variable | Config Path | Type |
    /// |----------|-------------|------|
    /// | `BPR_QUERY_FAMILY` | `model.query_family` | String |
    /// | `BPR_PASSAGE_FAMILY` | `model.passage_family` | String |
    /// | `BPR_EMBEDDING_DIM` | `model.embedding_dim` | usize |
    /// | `BPR_TOKENIZER_PATH` | `model.tokenizer_path` | String |
    /// | `BPR_HASH_GAMMA` | `hash.gamma` | f64 |
    /// | `BPR_TOP_K` | `retrieval.top_k` | usize |
    /// | `BPR_CANDIDATES` | `retrieval.candidates` | usize |
    /// | `BPR_BATCH_SIZE` | `batch.batch_size` | usize |
    /// | `BPR_USE_GPU` | `device.use_gpu` | bool |
    ///
    /// Unparseable values are ignored.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(val) = env::var("BPR_QUERY_FAMILY") {
            self.model.query_family = val;
        }
        if let Ok(val) = env::var("BPR_PASSAGE_FAMILY") {
            self.model.passage_family = val;
        }
        if let Ok(val) = env::var("BPR_EMBEDDING_DIM") {
            if let Ok(n) = val.parse::<usize>() {
                self.model.embedding_dim = n;
            }
        }
        if let Ok(val) = env::var("BPR_TOKENIZER_PATH") {
            self.model.tokenizer_path = Some(val);
        }

        if let Ok(val) = env::var("BPR_HASH_GAMMA") {
            if let Ok(g) = val.parse::<f64>() {
                self.hash.gamma = g;
            }
        }

        if let Ok(val) = env::var("BPR_TOP_K") {
            if let Ok(n) = val.parse::<usize>() {
                self.retrieval.top_k = n;
            }
        }
        if let Ok(val) = env::var("BPR_CANDIDATES") {
            if let Ok(n) = val.parse::<usize>() {
                self.retrieval.candidates = n;
            }
        }

        if let Ok(val) = env::var("BPR_BATCH_SIZE") {
            if let Ok(n) = val.parse::<usize>() {
                self.batch.batch_size = n;
            }
        }

        if let Ok(val) = env::var("BPR_USE_GPU") {
            if let Ok(b) = val.parse::<bool>() {
                self.device.use_gpu = b;
            }
        }

        self
    }

    pub fn from_toml_str(toml: &str) -> EmbeddingResult<Self> {
        toml::from_str(toml)
            .map_err(|e| EmbeddingError::config(format!("Failed to parse TOML: {}", e)))
    }

    pub fn to_toml_string(&self) -> EmbeddingResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| EmbeddingError::config(format!("Failed to serialize to TOML: {}", e)))
    }
}
