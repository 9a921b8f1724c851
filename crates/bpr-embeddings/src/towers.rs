//! Encoder towers and the registry that builds them by family name.
//!
//! A tower maps a padded [`TokenBatch`] to a `[B, D]` dense embedding. The
//! query and passage sides each own an independent tower; nothing is shared
//! between them.
//!
//! Towers are built through a [`TowerRegistry`], an explicit map from family
//! name to factory function. A checkpoint directory holds:
//!
//! ```text
//! <dir>/tower.json            TowerSpec (family + dims)
//! <dir>/weights.safetensors   named f32 tensors
//! ```

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use candle_core::{DType, Device, Module, Tensor, Var};
use candle_nn::{Embedding, Linear};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::config::ModelConfig;
use crate::error::{EmbeddingError, EmbeddingResult};
use crate::tokenization::TokenBatch;

/// File name of the tower description inside a checkpoint directory.
pub const TOWER_SPEC_FILE: &str = "tower.json";
/// File name of the tower weights inside a checkpoint directory.
pub const TOWER_WEIGHTS_FILE: &str = "weights.safetensors";

/// Which side of the dual encoder a tower serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TowerRole {
    Query,
    Passage,
}

impl TowerRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            TowerRole::Query => "query",
            TowerRole::Passage => "passage",
        }
    }
}

impl fmt::Display for TowerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Architecture description persisted next to the weights.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TowerSpec {
    pub family: String,
    pub vocab_size: usize,
    pub hidden_dim: usize,
    pub output_dim: usize,
    pub max_seq_len: usize,
    pub seed: u64,
}

impl TowerSpec {
    /// Spec for one side of the dual encoder.
    ///
    /// The passage tower gets a different seed so the two towers never start
    /// from identical weights.
    pub fn for_role(config: &ModelConfig, role: TowerRole) -> Self {
        let (family, max_seq_len, seed) = match role {
            TowerRole::Query => (&config.query_family, config.max_seq_len_query, config.seed),
            TowerRole::Passage => (
                &config.passage_family,
                config.max_seq_len_passage,
                config.seed.wrapping_add(1),
            ),
        };
        Self {
            family: family.clone(),
            vocab_size: config.vocab_size,
            hidden_dim: config.hidden_dim,
            output_dim: config.embedding_dim,
            max_seq_len,
            seed,
        }
    }

    pub fn validate(&self) -> EmbeddingResult<()> {
        if self.vocab_size == 0 || self.hidden_dim == 0 || self.output_dim == 0 {
            return Err(EmbeddingError::config(format!(
                "tower '{}' needs non-zero vocab_size, hidden_dim and output_dim, got {}/{}/{}",
                self.family, self.vocab_size, self.hidden_dim, self.output_dim
            )));
        }
        if self.max_seq_len == 0 {
            return Err(EmbeddingError::config(format!(
                "tower '{}' max_seq_len must be > 0",
                self.family
            )));
        }
        Ok(())
    }
}

/// One encoder tower.
pub trait EncoderTower: Send + Sync {
    fn spec(&self) -> &TowerSpec;

    /// `[B, L]` token batch to `[B, output_dim]` embeddings.
    fn forward(&self, batch: &TokenBatch) -> EmbeddingResult<Tensor>;

    /// Parameters updated by the optimizer.
    fn trainable_vars(&self) -> Vec<Var>;

    fn save_weights(&self, path: &Path) -> EmbeddingResult<()>;

    fn load_weights(&mut self, path: &Path) -> EmbeddingResult<()>;

    fn family(&self) -> &str {
        &self.spec().family
    }

    fn output_dim(&self) -> usize {
        self.spec().output_dim
    }

    fn max_seq_len(&self) -> usize {
        self.spec().max_seq_len
    }

    /// Reject batches whose layout this tower cannot consume.
    ///
    /// # Errors
    /// `ConfigError` if the ids are not rank 2, the mask shape differs from
    /// the ids, or the sequence is longer than `max_seq_len`.
    fn validate_batch(&self, batch: &TokenBatch) -> EmbeddingResult<()> {
        let ids = batch.input_ids.dims();
        if ids.len() != 2 {
            return Err(EmbeddingError::config(format!(
                "{} tower expects [batch, seq] token ids, got shape {:?}",
                self.family(),
                ids
            )));
        }
        if batch.attention_mask.dims() != ids {
            return Err(EmbeddingError::config(format!(
                "{} tower attention mask shape {:?} differs from ids shape {:?}",
                self.family(),
                batch.attention_mask.dims(),
                ids
            )));
        }
        if ids[1] > self.max_seq_len() {
            return Err(EmbeddingError::config(format!(
                "{} tower accepts at most {} tokens, got {}",
                self.family(),
                self.max_seq_len(),
                ids[1]
            )));
        }
        Ok(())
    }
}

// ============================================================================
// MEAN-POOL TOWER
// ============================================================================

/// Family name of [`MeanPoolTower`].
pub const MEAN_POOL_FAMILY: &str = "mean_pool";

/// Token embedding table, masked mean pooling, then a linear projection.
pub struct MeanPoolTower {
    spec: TowerSpec,
    embedding: Var,
    projection_weight: Var,
    projection_bias: Var,
}

impl MeanPoolTower {
    /// Seeded random initialisation on `device`.
    pub fn new(spec: TowerSpec, device: &Device) -> EmbeddingResult<Self> {
        spec.validate()?;
        let mut rng = StdRng::seed_from_u64(spec.seed);

        let embedding_data: Vec<f32> = (0..spec.vocab_size * spec.hidden_dim)
            .map(|_| rng.gen_range(-0.5f32..0.5f32))
            .collect();
        let bound = 1.0 / (spec.hidden_dim as f32).sqrt();
        let weight_data: Vec<f32> = (0..spec.output_dim * spec.hidden_dim)
            .map(|_| rng.gen_range(-bound..bound))
            .collect();

        let embedding = Tensor::from_vec(embedding_data, (spec.vocab_size, spec.hidden_dim), device)
            .and_then(|t| Var::from_tensor(&t))
            .map_err(|e| map_candle("embedding init", e))?;
        let projection_weight =
            Tensor::from_vec(weight_data, (spec.output_dim, spec.hidden_dim), device)
                .and_then(|t| Var::from_tensor(&t))
                .map_err(|e| map_candle("projection init", e))?;
        let projection_bias = Var::zeros(spec.output_dim, DType::F32, device)
            .map_err(|e| map_candle("bias init", e))?;

        tracing::debug!(
            family = %spec.family,
            vocab = spec.vocab_size,
            hidden = spec.hidden_dim,
            output = spec.output_dim,
            "MeanPoolTower initialized"
        );

        Ok(Self {
            spec,
            embedding,
            projection_weight,
            projection_bias,
        })
    }

    fn named_vars(&self) -> [(&'static str, &Var); 3] {
        [
            ("embedding.weight", &self.embedding),
            ("projection.weight", &self.projection_weight),
            ("projection.bias", &self.projection_bias),
        ]
    }

    fn forward_inner(&self, batch: &TokenBatch) -> candle_core::Result<Tensor> {
        let embedding = Embedding::new(self.embedding.as_tensor().clone(), self.spec.hidden_dim);
        let projection = Linear::new(
            self.projection_weight.as_tensor().clone(),
            Some(self.projection_bias.as_tensor().clone()),
        );

        let tokens = embedding.forward(&batch.input_ids)?; // [B, L, H]
        let mask = batch.attention_mask.to_dtype(tokens.dtype())?;
        let summed = tokens.broadcast_mul(&mask.unsqueeze(2)?)?.sum(1)?; // [B, H]
        let counts = mask.sum_keepdim(1)?; // [B, 1]
        let counts = counts.maximum(&counts.ones_like()?)?;
        let pooled = summed.broadcast_div(&counts)?;
        projection.forward(&pooled)
    }
}

impl EncoderTower for MeanPoolTower {
    fn spec(&self) -> &TowerSpec {
        &self.spec
    }

    fn forward(&self, batch: &TokenBatch) -> EmbeddingResult<Tensor> {
        self.validate_batch(batch)?;
        self.forward_inner(batch)
            .map_err(|e| map_candle("forward", e))
    }

    fn trainable_vars(&self) -> Vec<Var> {
        self.named_vars().iter().map(|(_, v)| (*v).clone()).collect()
    }

    fn save_weights(&self, path: &Path) -> EmbeddingResult<()> {
        let tensors: Vec<(String, Tensor)> = self
            .named_vars()
            .iter()
            .map(|(name, var)| (name.to_string(), var.as_tensor().clone()))
            .collect();
        write_safetensors(path, &tensors)?;
        tracing::info!("Saved {} tower weights to {}", self.spec.family, path.display());
        Ok(())
    }

    fn load_weights(&mut self, path: &Path) -> EmbeddingResult<()> {
        let mut loaded = read_safetensors(path, self.embedding.as_tensor().device())?;
        for (name, var) in self.named_vars() {
            let tensor = loaded.remove(name).ok_or_else(|| EmbeddingError::CheckpointError {
                path: path.to_path_buf(),
                message: format!("missing tensor '{}'", name),
            })?;
            if tensor.dims() != var.as_tensor().dims() {
                return Err(EmbeddingError::CheckpointError {
                    path: path.to_path_buf(),
                    message: format!(
                        "tensor '{}' has shape {:?}, tower expects {:?}",
                        name,
                        tensor.dims(),
                        var.as_tensor().dims()
                    ),
                });
            }
            var.set(&tensor).map_err(|e| map_candle("load weights", e))?;
        }
        tracing::info!("Loaded {} tower weights from {}", self.spec.family, path.display());
        Ok(())
    }
}

fn build_mean_pool(spec: &TowerSpec, device: &Device) -> EmbeddingResult<Box<dyn EncoderTower>> {
    Ok(Box::new(MeanPoolTower::new(spec.clone(), device)?))
}

// ============================================================================
// SAFETENSORS IO
// ============================================================================

/// Write named f32 tensors to a safetensors file.
pub fn write_safetensors(path: &Path, tensors: &[(String, Tensor)]) -> EmbeddingResult<()> {
    let checkpoint_err = |message: String| EmbeddingError::CheckpointError {
        path: path.to_path_buf(),
        message,
    };

    let buffers = tensors
        .iter()
        .map(|(name, tensor)| {
            let values: Vec<f32> = tensor
                .to_dtype(DType::F32)
                .and_then(|t| t.flatten_all())
                .and_then(|t| t.to_vec1())
                .map_err(|e| checkpoint_err(format!("reading '{}' failed: {}", name, e)))?;
            let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
            Ok((name.clone(), tensor.dims().to_vec(), bytes))
        })
        .collect::<EmbeddingResult<Vec<_>>>()?;

    let views = buffers
        .iter()
        .map(|(name, shape, bytes)| {
            safetensors::tensor::TensorView::new(safetensors::Dtype::F32, shape.clone(), bytes)
                .map(|view| (name.clone(), view))
                .map_err(|e| checkpoint_err(format!("TensorView for '{}' failed: {}", name, e)))
        })
        .collect::<EmbeddingResult<Vec<_>>>()?;

    safetensors::tensor::serialize_to_file(views, &None, path)
        .map_err(|e| checkpoint_err(format!("serialize failed: {}", e)))
}

/// Read every f32 tensor from a safetensors file.
pub fn read_safetensors(path: &Path, device: &Device) -> EmbeddingResult<HashMap<String, Tensor>> {
    let checkpoint_err = |message: String| EmbeddingError::CheckpointError {
        path: path.to_path_buf(),
        message,
    };

    let data = std::fs::read(path)?;
    let file = safetensors::SafeTensors::deserialize(&data)
        .map_err(|e| checkpoint_err(format!("deserialize failed: {}", e)))?;

    let mut out = HashMap::new();
    for (name, view) in file.tensors() {
        if view.dtype() != safetensors::Dtype::F32 {
            return Err(checkpoint_err(format!(
                "tensor '{}' has dtype {:?}, expected F32",
                name,
                view.dtype()
            )));
        }
        let values: Vec<f32> = view
            .data()
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        let tensor = Tensor::from_vec(values, view.shape(), device)
            .map_err(|e| checkpoint_err(format!("tensor '{}' upload failed: {}", name, e)))?;
        out.insert(name, tensor);
    }
    Ok(out)
}

// ============================================================================
// REGISTRY
// ============================================================================

/// Builds a tower from its spec.
pub type TowerFactory = fn(&TowerSpec, &Device) -> EmbeddingResult<Box<dyn EncoderTower>>;

/// Family name to factory map.
#[derive(Clone, Default)]
pub struct TowerRegistry {
    factories: HashMap<String, TowerFactory>,
}

impl TowerRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the in-tree families.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(MEAN_POOL_FAMILY, build_mean_pool);
        registry
    }

    /// Add or replace a family.
    pub fn register(&mut self, family: impl Into<String>, factory: TowerFactory) {
        self.factories.insert(family.into(), factory);
    }

    /// Registered family names, sorted.
    pub fn families(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    /// Build a freshly initialised tower.
    pub fn build(&self, spec: &TowerSpec, device: &Device) -> EmbeddingResult<Box<dyn EncoderTower>> {
        let factory = self.factories.get(&spec.family).ok_or_else(|| {
            EmbeddingError::UnknownTowerFamily {
                family: spec.family.clone(),
                available: self.families(),
            }
        })?;
        factory(spec, device)
    }

    /// Rebuild a tower from a checkpoint directory written by [`save_tower`].
    pub fn load(&self, dir: &Path, device: &Device) -> EmbeddingResult<Box<dyn EncoderTower>> {
        let spec_path = dir.join(TOWER_SPEC_FILE);
        let raw = std::fs::read_to_string(&spec_path)?;
        let spec: TowerSpec =
            serde_json::from_str(&raw).map_err(|e| EmbeddingError::SerializationError {
                message: format!("invalid {}: {}", spec_path.display(), e),
            })?;

        let mut tower = self.build(&spec, device)?;
        tower.load_weights(&dir.join(TOWER_WEIGHTS_FILE))?;
        Ok(tower)
    }
}

impl fmt::Debug for TowerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TowerRegistry")
            .field("families", &self.families())
            .finish()
    }
}

/// Write `tower` into `dir` as `tower.json` plus `weights.safetensors`.
pub fn save_tower(tower: &dyn EncoderTower, dir: &Path) -> EmbeddingResult<()> {
    std::fs::create_dir_all(dir)?;
    let spec = serde_json::to_string_pretty(tower.spec()).map_err(|e| {
        EmbeddingError::SerializationError {
            message: format!("tower spec serialization failed: {}", e),
        }
    })?;
    std::fs::write(dir.join(TOWER_SPEC_FILE), spec)?;
    tower.save_weights(&dir.join(TOWER_WEIGHTS_FILE))
}

fn map_candle(context: &str, e: candle_core::Error) -> EmbeddingError {
    EmbeddingError::TensorError {
        message: format!("MeanPoolTower {} failed: {}", context, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokenization::{HashingTokenizer, Tokenizer};

    fn tiny_spec() -> TowerSpec {
        TowerSpec {
            family: MEAN_POOL_FAMILY.to_string(),
            vocab_size: 64,
            hidden_dim: 8,
            output_dim: 6,
            max_seq_len: 12,
            seed: 7,
        }
    }

    fn batch(texts: &[&str]) -> TokenBatch {
        HashingTokenizer::new(64)
            .unwrap()
            .tokenize(texts, 12, &Device::Cpu)
            .unwrap()
    }

    #[test]
    fn test_forward_shape() {
        let tower = MeanPoolTower::new(tiny_spec(), &Device::Cpu).unwrap();
        let out = tower.forward(&batch(&["hello world", "binary codes are small"])).unwrap();
        assert_eq!(out.dims(), &[2, 6]);
    }

    #[test]
    fn test_padding_does_not_change_embedding() {
        let tower = MeanPoolTower::new(tiny_spec(), &Device::Cpu).unwrap();
        let alone: Vec<Vec<f32>> = tower.forward(&batch(&["hello"])).unwrap().to_vec2().unwrap();
        let padded: Vec<Vec<f32>> = tower
            .forward(&batch(&["hello", "a much longer neighbour text"]))
            .unwrap()
            .to_vec2()
            .unwrap();
        for (a, b) in alone[0].iter().zip(padded[0].iter()) {
            assert!((a - b).abs() < 1e-5, "padding leaked into pooled output");
        }
    }

    #[test]
    fn test_same_seed_same_weights() {
        let a = MeanPoolTower::new(tiny_spec(), &Device::Cpu).unwrap();
        let b = MeanPoolTower::new(tiny_spec(), &Device::Cpu).unwrap();
        let input = batch(&["determinism"]);
        let ea: Vec<Vec<f32>> = a.forward(&input).unwrap().to_vec2().unwrap();
        let eb: Vec<Vec<f32>> = b.forward(&input).unwrap().to_vec2().unwrap();
        assert_eq!(ea, eb);
    }

    #[test]
    fn test_rejects_long_sequence() {
        let mut spec = tiny_spec();
        spec.max_seq_len = 3;
        let tower = MeanPoolTower::new(spec, &Device::Cpu).unwrap();
        let err = tower.forward(&batch(&["one two three four"])).unwrap_err();
        assert!(matches!(err, EmbeddingError::ConfigError { .. }), "got {:?}", err);
    }

    #[test]
    fn test_registry_unknown_family() {
        let registry = TowerRegistry::with_defaults();
        let mut spec = tiny_spec();
        spec.family = "transformer".to_string();
        match registry.build(&spec, &Device::Cpu) {
            Err(EmbeddingError::UnknownTowerFamily { family, available }) => {
                assert_eq!(family, "transformer");
                assert_eq!(available, vec![MEAN_POOL_FAMILY.to_string()]);
            }
            Err(other) => panic!("unexpected error {:?}", other),
            Ok(_) => panic!("unknown family must not build"),
        }
    }

    #[test]
    fn test_save_and_load_reproduces_embeddings() {
        let dir = tempfile::tempdir().unwrap();
        let registry = TowerRegistry::with_defaults();
        let tower = registry.build(&tiny_spec(), &Device::Cpu).unwrap();
        save_tower(tower.as_ref(), dir.path()).unwrap();

        let mut other_spec = tiny_spec();
        other_spec.seed = 99;
        let fresh = registry.build(&other_spec, &Device::Cpu).unwrap();
        let loaded = registry.load(dir.path(), &Device::Cpu).unwrap();
        assert_eq!(loaded.spec(), tower.spec());

        let input = batch(&["persist me", "and me too"]);
        let original: Vec<Vec<f32>> = tower.forward(&input).unwrap().to_vec2().unwrap();
        let restored: Vec<Vec<f32>> = loaded.forward(&input).unwrap().to_vec2().unwrap();
        let different: Vec<Vec<f32>> = fresh.forward(&input).unwrap().to_vec2().unwrap();
        assert_eq!(original, restored);
        assert_ne!(original, different);
    }

    #[test]
    fn test_load_rejects_shape_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let tower = MeanPoolTower::new(tiny_spec(), &Device::Cpu).unwrap();
        let path = dir.path().join(TOWER_WEIGHTS_FILE);
        tower.save_weights(&path).unwrap();

        let mut spec = tiny_spec();
        spec.output_dim = 4;
        let mut other = MeanPoolTower::new(spec, &Device::Cpu).unwrap();
        let err = other.load_weights(&path).unwrap_err();
        assert!(matches!(err, EmbeddingError::CheckpointError { .. }), "got {:?}", err);
    }
}
