//! Training objective over binary and dense similarities.
//!
//! Every query in a batch is scored against every passage in the batch, so
//! the passages of other examples act as extra negatives. Two score matrices
//! are built:
//!
//! ```text
//! S_b = binary_query · binary_passagesᵀ     (candidate generation geometry)
//! S_d = dense_query  · binary_passagesᵀ     (re-ranking geometry)
//! ```
//!
//! and combined as
//!
//! ```text
//! L = candidate_weight · L_cand + rerank_weight · L_rerank
//! L_cand   = mean over non-positive j of max(0, margin - (S_b[i, pos_i] - S_b[i, j]))
//! L_rerank = cross_entropy(S_d, pos),  pos_i = i · n_passages
//! ```

use candle_core::{DType, Tensor};
use serde::{Deserialize, Serialize};

use crate::error::{EmbeddingError, EmbeddingResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimilarityFunction {
    #[default]
    DotProduct,
    /// L2-normalise both sides of the dense score.
    Cosine,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeadConfig {
    #[serde(default)]
    pub similarity_function: SimilarityFunction,

    /// Positives per query. Only a single positive is supported.
    #[serde(default = "default_num_positives")]
    pub num_positives: usize,

    #[serde(default)]
    pub num_hard_negatives: usize,

    #[serde(default = "default_margin")]
    pub margin: f64,

    #[serde(default = "default_weight")]
    pub candidate_weight: f64,

    #[serde(default = "default_weight")]
    pub rerank_weight: f64,
}

fn default_num_positives() -> usize {
    1
}

fn default_margin() -> f64 {
    2.0
}

fn default_weight() -> f64 {
    1.0
}

impl Default for HeadConfig {
    fn default() -> Self {
        Self {
            similarity_function: SimilarityFunction::default(),
            num_positives: default_num_positives(),
            num_hard_negatives: 0,
            margin: default_margin(),
            candidate_weight: default_weight(),
            rerank_weight: default_weight(),
        }
    }
}

impl HeadConfig {
    /// Passages per query: one positive followed by the hard negatives.
    pub fn n_passages(&self) -> usize {
        self.num_positives + self.num_hard_negatives
    }

    pub fn validate(&self) -> EmbeddingResult<()> {
        if self.num_positives != 1 {
            return Err(EmbeddingError::config(format!(
                "num_positives must be 1, got {}",
                self.num_positives
            )));
        }
        if !self.margin.is_finite() || self.margin < 0.0 {
            return Err(EmbeddingError::config(format!(
                "margin must be finite and >= 0, got {}",
                self.margin
            )));
        }
        for (name, weight) in [
            ("candidate_weight", self.candidate_weight),
            ("rerank_weight", self.rerank_weight),
        ] {
            if !weight.is_finite() || weight < 0.0 {
                return Err(EmbeddingError::config(format!(
                    "{} must be finite and >= 0, got {}",
                    name, weight
                )));
            }
        }
        if self.candidate_weight == 0.0 && self.rerank_weight == 0.0 {
            return Err(EmbeddingError::config(
                "candidate_weight and rerank_weight cannot both be 0",
            ));
        }
        Ok(())
    }
}

/// One batch as seen by the head.
#[derive(Debug, Clone, Copy)]
pub struct HeadInput<'a> {
    /// `[B, D]` ±1 query codes.
    pub binary_query: &'a Tensor,
    /// `[B, D]` dense query embeddings.
    pub dense_query: &'a Tensor,
    /// `[B · n_passages, D]` ±1 passage codes, grouped per query with the
    /// positive first.
    pub binary_passages: &'a Tensor,
}

/// Scalar values of the loss terms, for logging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LossComponents {
    pub candidate: f32,
    pub rerank: f32,
    pub total: f32,
}

#[derive(Debug, Clone)]
pub struct HeadOutput {
    /// Scalar loss, differentiable back through the hash activation.
    pub loss: Tensor,
    /// `[B, B · n_passages]` dense scores.
    pub logits: Tensor,
    /// `[B]` u32 column index of each query's positive.
    pub labels: Tensor,
    pub components: LossComponents,
}

impl HeadOutput {
    /// Fraction of queries whose highest dense score is their positive.
    pub fn top1_accuracy(&self) -> EmbeddingResult<f32> {
        self.logits
            .argmax(1)
            .and_then(|pred| pred.eq(&self.labels))
            .and_then(|hits| hits.to_dtype(DType::F32))
            .and_then(|hits| hits.mean_all())
            .and_then(|acc| acc.to_scalar::<f32>())
            .map_err(map_candle)
    }
}

pub struct SimilarityHead {
    config: HeadConfig,
}

impl SimilarityHead {
    pub fn new(config: HeadConfig) -> EmbeddingResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &HeadConfig {
        &self.config
    }

    /// # Errors
    /// - `EmptyInput` for an empty batch
    /// - `ShapeMismatch` if the passage count is not `B · n_passages` or any
    ///   dimension disagrees
    pub fn forward(&self, input: &HeadInput<'_>) -> EmbeddingResult<HeadOutput> {
        let (batch, dim) = self.check_shapes(input)?;
        let n = self.config.n_passages();
        let total_passages = batch * n;
        let device = input.binary_query.device();

        // Binary scores and the hinge term.
        let s_b = input
            .binary_query
            .matmul(&input.binary_passages.t().map_err(map_candle)?)
            .map_err(map_candle)?; // [B, P]

        let mut positive = vec![0.0f32; batch * total_passages];
        for i in 0..batch {
            positive[i * total_passages + i * n] = 1.0;
        }
        let positive_mask =
            Tensor::from_vec(positive, (batch, total_passages), device).map_err(map_candle)?;
        let negative_mask = positive_mask.affine(-1.0, 1.0).map_err(map_candle)?;

        let l_cand = if total_passages > 1 {
            let pos_scores = s_b
                .mul(&positive_mask)
                .and_then(|t| t.sum_keepdim(1))
                .map_err(map_candle)?; // [B, 1]
            let violation = s_b
                .broadcast_sub(&pos_scores)
                .and_then(|t| t.affine(1.0, self.config.margin))
                .map_err(map_candle)?;
            let zeros = Tensor::zeros_like(&violation).map_err(map_candle)?;
            let hinge = violation
                .maximum(&zeros)
                .and_then(|t| t.mul(&negative_mask))
                .map_err(map_candle)?;
            let count = (batch * (total_passages - 1)) as f64;
            hinge
                .sum_all()
                .and_then(|t| t.affine(1.0 / count, 0.0))
                .map_err(map_candle)?
        } else {
            Tensor::zeros((), DType::F32, device).map_err(map_candle)?
        };

        // Dense re-ranking scores and the cross-entropy term.
        let (dense_query, passages) = match self.config.similarity_function {
            SimilarityFunction::DotProduct => {
                (input.dense_query.clone(), input.binary_passages.clone())
            }
            SimilarityFunction::Cosine => (
                l2_normalize(input.dense_query)?,
                l2_normalize(input.binary_passages)?,
            ),
        };
        let s_d = dense_query
            .matmul(&passages.t().map_err(map_candle)?)
            .map_err(map_candle)?;

        let labels: Vec<u32> = (0..batch).map(|i| (i * n) as u32).collect();
        let labels = Tensor::from_vec(labels, batch, device).map_err(map_candle)?;
        let l_rerank = candle_nn::loss::cross_entropy(&s_d, &labels).map_err(map_candle)?;

        let loss = l_cand
            .affine(self.config.candidate_weight, 0.0)
            .map_err(map_candle)?
            .add(
                &l_rerank
                    .affine(self.config.rerank_weight, 0.0)
                    .map_err(map_candle)?,
            )
            .map_err(map_candle)?;

        let components = LossComponents {
            candidate: scalar(&l_cand)?,
            rerank: scalar(&l_rerank)?,
            total: scalar(&loss)?,
        };

        tracing::trace!(
            batch,
            dim,
            candidate = components.candidate,
            rerank = components.rerank,
            "similarity head forward"
        );

        Ok(HeadOutput {
            loss,
            logits: s_d,
            labels,
            components,
        })
    }

    fn check_shapes(&self, input: &HeadInput<'_>) -> EmbeddingResult<(usize, usize)> {
        let q = input.binary_query.dims();
        if q.len() != 2 {
            return Err(EmbeddingError::shape("binary query rank", 2, q.len()));
        }
        let (batch, dim) = (q[0], q[1]);
        if batch == 0 {
            return Err(EmbeddingError::EmptyInput);
        }
        if input.dense_query.dims() != q {
            return Err(EmbeddingError::shape(
                "dense query",
                format!("{:?}", q),
                format!("{:?}", input.dense_query.dims()),
            ));
        }
        let expected = [batch * self.config.n_passages(), dim];
        if input.binary_passages.dims() != expected {
            return Err(EmbeddingError::shape(
                "binary passages",
                format!("{:?}", expected),
                format!("{:?}", input.binary_passages.dims()),
            ));
        }
        Ok((batch, dim))
    }
}

fn l2_normalize(x: &Tensor) -> EmbeddingResult<Tensor> {
    let norm = x
        .sqr()
        .and_then(|t| t.sum_keepdim(1))
        .and_then(|t| t.affine(1.0, 1e-12))
        .and_then(|t| t.sqrt())
        .map_err(map_candle)?;
    x.broadcast_div(&norm).map_err(map_candle)
}

fn scalar(t: &Tensor) -> EmbeddingResult<f32> {
    t.to_dtype(DType::F32)
        .and_then(|t| t.to_scalar::<f32>())
        .map_err(map_candle)
}

fn map_candle(e: candle_core::Error) -> EmbeddingError {
    EmbeddingError::TensorError {
        message: format!("SimilarityHead error: {}", e),
    }
}
