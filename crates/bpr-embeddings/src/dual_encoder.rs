//! Two-tower encoder with a hashing layer on top.
//!
//! The query tower and passage tower are parameterised independently. Each
//! forward produces up to three outputs per batch:
//!
//! - `binary_query`: hashed query embedding, `[B_q, D]` of ±1
//! - `binary_passage`: hashed passage embedding, `[B_p, D]` of ±1
//! - `dense_query`: the unhashed query embedding, `[B_q, D]`
//!
//! A side whose token batch is absent produces no outputs.

use std::path::Path;

use candle_core::{Device, Tensor, Var};

use crate::config::BprConfig;
use crate::error::{EmbeddingError, EmbeddingResult};
use crate::hashing::HashActivation;
use crate::tokenization::TokenBatch;
use crate::towers::{save_tower, EncoderTower, TowerRegistry, TowerRole, TowerSpec};

/// Directory of the query tower inside a dual-encoder checkpoint.
pub const QUERY_ENCODER_DIR: &str = "query_encoder";
/// Directory of the passage tower inside a dual-encoder checkpoint.
pub const PASSAGE_ENCODER_DIR: &str = "passage_encoder";

/// Outputs of one dual-encoder forward.
#[derive(Debug, Clone, Default)]
pub struct DualEncoderOutput {
    pub binary_query: Option<Tensor>,
    pub binary_passage: Option<Tensor>,
    pub dense_query: Option<Tensor>,
}

pub struct DualEncoder {
    query_tower: Box<dyn EncoderTower>,
    passage_tower: Box<dyn EncoderTower>,
    hash: HashActivation,
    dropout_prob: f32,
}

impl DualEncoder {
    /// # Errors
    /// `ConfigError` if the towers disagree on output dimension or
    /// `dropout_prob` is outside `[0, 1)`.
    pub fn new(
        query_tower: Box<dyn EncoderTower>,
        passage_tower: Box<dyn EncoderTower>,
        hash: HashActivation,
        dropout_prob: f32,
    ) -> EmbeddingResult<Self> {
        if query_tower.output_dim() != passage_tower.output_dim() {
            return Err(EmbeddingError::config(format!(
                "query tower outputs {} dims but passage tower outputs {}",
                query_tower.output_dim(),
                passage_tower.output_dim()
            )));
        }
        if !(0.0..1.0).contains(&dropout_prob) {
            return Err(EmbeddingError::config(format!(
                "dropout probability must be in [0, 1), got {}",
                dropout_prob
            )));
        }
        Ok(Self {
            query_tower,
            passage_tower,
            hash,
            dropout_prob,
        })
    }

    /// Build freshly initialised towers from configuration.
    pub fn from_config(
        config: &BprConfig,
        registry: &TowerRegistry,
        device: &Device,
    ) -> EmbeddingResult<Self> {
        let query = registry.build(&TowerSpec::for_role(&config.model, TowerRole::Query), device)?;
        let passage =
            registry.build(&TowerSpec::for_role(&config.model, TowerRole::Passage), device)?;
        Self::new(
            query,
            passage,
            HashActivation::new(config.hash.gamma)?,
            config.model.embeds_dropout_prob,
        )
    }

    /// Restore both towers from a checkpoint written by [`DualEncoder::save`].
    pub fn load(
        dir: &Path,
        registry: &TowerRegistry,
        hash: HashActivation,
        dropout_prob: f32,
        device: &Device,
    ) -> EmbeddingResult<Self> {
        let query = registry.load(&dir.join(QUERY_ENCODER_DIR), device)?;
        let passage = registry.load(&dir.join(PASSAGE_ENCODER_DIR), device)?;
        Self::new(query, passage, hash, dropout_prob)
    }

    pub fn save(&self, dir: &Path) -> EmbeddingResult<()> {
        save_tower(self.query_tower.as_ref(), &dir.join(QUERY_ENCODER_DIR))?;
        save_tower(self.passage_tower.as_ref(), &dir.join(PASSAGE_ENCODER_DIR))
    }

    /// Deterministic inference forward.
    ///
    /// # Errors
    /// - `ConfigError` if both batches are absent or a batch does not fit its tower
    /// - `EncodingError` if a tower fails
    pub fn forward(
        &self,
        query: Option<&TokenBatch>,
        passage: Option<&TokenBatch>,
    ) -> EmbeddingResult<DualEncoderOutput> {
        self.run(query, passage, false)
    }

    /// Training forward: embedding dropout is applied to tower outputs before
    /// hashing.
    pub fn forward_train(
        &self,
        query: Option<&TokenBatch>,
        passage: Option<&TokenBatch>,
    ) -> EmbeddingResult<DualEncoderOutput> {
        self.run(query, passage, true)
    }

    fn run(
        &self,
        query: Option<&TokenBatch>,
        passage: Option<&TokenBatch>,
        train: bool,
    ) -> EmbeddingResult<DualEncoderOutput> {
        if query.is_none() && passage.is_none() {
            return Err(EmbeddingError::config(
                "dual encoder forward needs a query batch, a passage batch, or both",
            ));
        }

        let mut output = DualEncoderOutput::default();

        if let Some(batch) = query {
            let dense = self.encode(TowerRole::Query, batch, train)?;
            output.binary_query = Some(self.hash.forward(&dense)?);
            output.dense_query = Some(dense);
        }

        if let Some(batch) = passage {
            let dense = self.encode(TowerRole::Passage, batch, train)?;
            output.binary_passage = Some(self.hash.forward(&dense)?);
        }

        Ok(output)
    }

    fn encode(&self, role: TowerRole, batch: &TokenBatch, train: bool) -> EmbeddingResult<Tensor> {
        let tower = self.tower(role);
        tower.validate_batch(batch)?;

        let encoding_error = |message: String| EmbeddingError::EncodingError {
            tower: role,
            message,
        };

        let dense = tower
            .forward(batch)
            .map_err(|e| encoding_error(failure_summary(e)))?;

        let expected = [batch.batch_size(), tower.output_dim()];
        if dense.dims() != expected {
            return Err(encoding_error(format!(
                "tower returned shape {:?}, expected {:?}",
                dense.dims(),
                expected
            )));
        }

        if train && self.dropout_prob > 0.0 {
            candle_nn::ops::dropout(&dense, self.dropout_prob).map_err(|e| {
                encoding_error(format!("embedding dropout failed: {}", first_line(&e.to_string())))
            })
        } else {
            Ok(dense)
        }
    }

    pub fn tower(&self, role: TowerRole) -> &dyn EncoderTower {
        match role {
            TowerRole::Query => self.query_tower.as_ref(),
            TowerRole::Passage => self.passage_tower.as_ref(),
        }
    }

    /// Shared output dimension D of both towers.
    pub fn embedding_dim(&self) -> usize {
        self.query_tower.output_dim()
    }

    pub fn hash(&self) -> HashActivation {
        self.hash
    }

    pub fn dropout_prob(&self) -> f32 {
        self.dropout_prob
    }

    /// Parameters of both towers, query first.
    pub fn trainable_vars(&self) -> Vec<Var> {
        let mut vars = self.query_tower.trainable_vars();
        vars.extend(self.passage_tower.trainable_vars());
        vars
    }
}

/// Inner message of a tower failure, dropping the `TensorError` prefix.
fn failure_summary(err: EmbeddingError) -> String {
    match err {
        EmbeddingError::TensorError { message } => first_line(&message),
        other => first_line(&other.to_string()),
    }
}

/// candle appends a backtrace after the first line when one is captured.
fn first_line(message: &str) -> String {
    message.lines().next().unwrap_or_default().trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokenization::{HashingTokenizer, Tokenizer};
    use crate::towers::MEAN_POOL_FAMILY;

    fn spec(output_dim: usize, max_seq_len: usize, seed: u64) -> TowerSpec {
        TowerSpec {
            family: MEAN_POOL_FAMILY.to_string(),
            vocab_size: 50,
            hidden_dim: 8,
            output_dim,
            max_seq_len,
            seed,
        }
    }

    fn encoder() -> DualEncoder {
        let registry = TowerRegistry::with_defaults();
        DualEncoder::new(
            registry.build(&spec(16, 8, 1), &Device::Cpu).unwrap(),
            registry.build(&spec(16, 16, 2), &Device::Cpu).unwrap(),
            HashActivation::new(0.1).unwrap(),
            0.1,
        )
        .unwrap()
    }

    fn tokens(texts: &[&str], max_len: usize) -> TokenBatch {
        HashingTokenizer::new(50)
            .unwrap()
            .tokenize(texts, max_len, &Device::Cpu)
            .unwrap()
    }

    #[test]
    fn test_both_absent_is_config_error() {
        let err = encoder().forward(None, None).unwrap_err();
        assert!(matches!(err, EmbeddingError::ConfigError { .. }));
    }

    #[test]
    fn test_query_only_outputs() {
        let out = encoder().forward(Some(&tokens(&["what is bpr"], 8)), None).unwrap();
        assert!(out.binary_passage.is_none());
        let binary: Vec<Vec<f32>> = out.binary_query.unwrap().to_vec2().unwrap();
        let dense: Vec<Vec<f32>> = out.dense_query.unwrap().to_vec2().unwrap();
        assert_eq!(binary[0].len(), 16);
        for (b, d) in binary[0].iter().zip(dense[0].iter()) {
            let want = if *d > 0.0 { 1.0 } else { -1.0 };
            assert_eq!(*b, want, "binary query must be the sign of the dense query");
        }
    }

    #[test]
    fn test_passage_only_outputs() {
        let out = encoder()
            .forward(None, Some(&tokens(&["one passage", "another passage"], 16)))
            .unwrap();
        assert!(out.binary_query.is_none());
        assert!(out.dense_query.is_none());
        assert_eq!(out.binary_passage.unwrap().dims(), &[2, 16]);
    }

    #[test]
    fn test_too_long_batch_is_config_error() {
        // Query tower accepts 8 tokens; this batch has 10.
        let batch = tokens(&["a b c d e f g h"], 16);
        let err = encoder().forward(Some(&batch), None).unwrap_err();
        assert!(matches!(err, EmbeddingError::ConfigError { .. }), "got {:?}", err);
    }

    #[test]
    fn test_mismatched_mask_is_config_error() {
        let mut batch = tokens(&["hello there"], 8);
        batch.attention_mask = Tensor::ones((1, 2), candle_core::DType::F32, &Device::Cpu).unwrap();
        let err = encoder().forward(Some(&batch), None).unwrap_err();
        assert!(matches!(err, EmbeddingError::ConfigError { .. }), "got {:?}", err);
    }

    #[test]
    fn test_out_of_vocab_ids_are_encoding_error() {
        // Tower vocabulary is 50; id 999 has no embedding row.
        let batch = TokenBatch {
            input_ids: Tensor::new(&[[1u32, 999]], &Device::Cpu).unwrap(),
            attention_mask: Tensor::ones((1, 2), candle_core::DType::F32, &Device::Cpu).unwrap(),
        };
        let err = encoder().forward(Some(&batch), None).unwrap_err();
        match &err {
            EmbeddingError::EncodingError { tower, message } => {
                assert_eq!(*tower, TowerRole::Query);
                assert!(message.starts_with("MeanPoolTower forward failed"), "got: {}", message);
                assert!(!message.contains('\n'), "got: {}", message);
            }
            other => panic!("expected EncodingError, got {:?}", other),
        }
        let rendered = err.to_string();
        assert!(rendered.contains("query tower"), "got: {}", rendered);
        assert!(!rendered.contains("Tensor error"), "got: {}", rendered);

        // The passage side reports its own role.
        let err = encoder().forward(None, Some(&batch)).unwrap_err();
        assert!(
            matches!(err, EmbeddingError::EncodingError { tower: TowerRole::Passage, .. }),
            "got {:?}",
            err
        );
    }

    #[test]
    fn test_failure_summary_keeps_first_line() {
        let err = EmbeddingError::TensorError {
            message: "MeanPoolTower forward failed: index out of range\n   0: backtrace frame".to_string(),
        };
        assert_eq!(failure_summary(err), "MeanPoolTower forward failed: index out of range");
        assert_eq!(failure_summary(EmbeddingError::EmptyInput), EmbeddingError::EmptyInput.to_string());
    }

    #[test]
    fn test_mismatched_tower_dims_rejected() {
        let registry = TowerRegistry::with_defaults();
        let result = DualEncoder::new(
            registry.build(&spec(16, 8, 1), &Device::Cpu).unwrap(),
            registry.build(&spec(12, 8, 2), &Device::Cpu).unwrap(),
            HashActivation::new(0.1).unwrap(),
            0.0,
        );
        assert!(matches!(result, Err(EmbeddingError::ConfigError { .. })));
    }

    #[test]
    fn test_inference_forward_is_deterministic() {
        let enc = encoder();
        let batch = tokens(&["stable output"], 8);
        let a: Vec<Vec<f32>> = enc.forward(Some(&batch), None).unwrap().dense_query.unwrap().to_vec2().unwrap();
        let b: Vec<Vec<f32>> = enc.forward(Some(&batch), None).unwrap().dense_query.unwrap().to_vec2().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let enc = encoder();
        enc.save(dir.path()).unwrap();

        let restored = DualEncoder::load(
            dir.path(),
            &TowerRegistry::with_defaults(),
            enc.hash(),
            enc.dropout_prob(),
            &Device::Cpu,
        )
        .unwrap();

        let q = tokens(&["query text"], 8);
        let p = tokens(&["passage text"], 16);
        let a = enc.forward(Some(&q), Some(&p)).unwrap();
        let b = restored.forward(Some(&q), Some(&p)).unwrap();
        let a_p: Vec<Vec<f32>> = a.binary_passage.unwrap().to_vec2().unwrap();
        let b_p: Vec<Vec<f32>> = b.binary_passage.unwrap().to_vec2().unwrap();
        assert_eq!(a_p, b_p);
        assert_eq!(restored.trainable_vars().len(), 6);
    }
}
