//! Training loop for the dual encoder.
//!
//! Implements the core loop with:
//! - Forward: both towers on (question, positive + hard negatives) batches
//! - Similarity head loss (hinge on binary scores + cross-entropy on dense scores)
//! - Gradient accumulation over `grad_acc_steps` batches
//! - AdamW step with linear warmup/decay
//! - Evaluation every N steps and at epoch end, early stopping on dev loss
//! - Checkpoint of the best encoder

use std::path::PathBuf;

use candle_core::{Device, Tensor};

use crate::dual_encoder::DualEncoder;
use crate::error::{EmbeddingError, EmbeddingResult};
use crate::head::{HeadConfig, HeadInput, HeadOutput, LossComponents, SimilarityHead};
use crate::tokenization::Tokenizer;
use crate::towers::TowerRole;

use super::data::{SimilarityDataLoader, TrainingBatch};
use super::optimizer::{AdamW, AdamWConfig};

/// Training configuration.
#[derive(Debug, Clone)]
pub struct TrainingConfig {
    /// Examples per batch (default: 2).
    pub batch_size: usize,
    /// Number of training epochs (default: 3).
    pub epochs: usize,
    /// Evaluate on the dev set every N optimizer steps; 0 evaluates at epoch
    /// end only (default: 1000).
    pub evaluate_every: usize,
    /// Batches whose losses are averaged into one optimizer step (default: 1).
    pub grad_acc_steps: usize,
    /// Fraction of the training set held out as dev set when no dev set is
    /// given (default: 0.0).
    pub dev_split: f32,
    /// Encode passage titles together with passage text (default: true).
    pub embed_title: bool,
    /// Stop after this many evaluations without improvement; `None` disables.
    pub early_stopping_patience: Option<usize>,
    /// Minimum dev loss decrease that counts as improvement.
    pub early_stopping_min_delta: f32,
    /// Directory that receives the best encoder checkpoint.
    pub checkpoint_dir: Option<PathBuf>,
    /// Random seed for shuffling.
    pub seed: u64,
    pub optimizer: AdamWConfig,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            batch_size: 2,
            epochs: 3,
            evaluate_every: 1000,
            grad_acc_steps: 1,
            dev_split: 0.0,
            embed_title: true,
            early_stopping_patience: None,
            early_stopping_min_delta: 0.0,
            checkpoint_dir: None,
            seed: 42,
            optimizer: AdamWConfig::default(),
        }
    }
}

impl TrainingConfig {
    pub fn validate(&self) -> EmbeddingResult<()> {
        if self.batch_size == 0 {
            return Err(EmbeddingError::config("[training] batch_size must be > 0"));
        }
        if self.grad_acc_steps == 0 {
            return Err(EmbeddingError::config("[training] grad_acc_steps must be > 0"));
        }
        if !(0.0..1.0).contains(&self.dev_split) {
            return Err(EmbeddingError::config(format!(
                "[training] dev_split must be in [0, 1), got {}",
                self.dev_split
            )));
        }
        if !self.optimizer.learning_rate.is_finite() || self.optimizer.learning_rate <= 0.0 {
            return Err(EmbeddingError::config(format!(
                "[training] learning_rate must be finite and > 0, got {}",
                self.optimizer.learning_rate
            )));
        }
        Ok(())
    }
}

/// Dev-set metrics.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EvalMetrics {
    /// Mean total loss, weighted by batch size.
    pub loss: f32,
    /// Fraction of questions whose positive has the highest dense score.
    pub accuracy: f32,
    pub num_batches: usize,
}

/// Result of a single training epoch.
#[derive(Debug, Clone)]
pub struct EpochResult {
    /// Epoch number (1-indexed).
    pub epoch: usize,
    /// Average loss components across all batches.
    pub avg_loss: LossComponents,
    pub num_batches: usize,
    /// Evaluation metrics (if a dev set was given).
    pub eval_metrics: Option<EvalMetrics>,
    /// Whether this epoch's evaluation was the best so far.
    pub is_best: bool,
}

/// Training metrics accumulated across all epochs.
#[derive(Debug, Clone, Default)]
pub struct TrainingHistory {
    pub epochs: Vec<EpochResult>,
    /// Every dev evaluation as `(global_step, metrics)`.
    pub evaluations: Vec<(usize, EvalMetrics)>,
    /// Lowest dev loss seen.
    pub best_loss: Option<f32>,
    /// Optimizer step that achieved `best_loss`.
    pub best_step: usize,
    pub early_stopped: bool,
    /// Total optimizer steps (across all epochs).
    pub total_steps: usize,
}

/// Drives a [`DualEncoder`] through training.
///
/// The trainer borrows the encoder: the optimizer updates the towers' `Var`s
/// in place, so the caller's encoder holds the trained weights afterwards.
pub struct Trainer<'a> {
    encoder: &'a DualEncoder,
    tokenizer: &'a dyn Tokenizer,
    head: SimilarityHead,
    optimizer: AdamW,
    config: TrainingConfig,
    history: TrainingHistory,
    device: Device,
    evals_since_best: usize,
}

impl<'a> Trainer<'a> {
    pub fn new(
        encoder: &'a DualEncoder,
        tokenizer: &'a dyn Tokenizer,
        head_config: HeadConfig,
        config: TrainingConfig,
        device: Device,
    ) -> EmbeddingResult<Self> {
        config.validate()?;
        let head = SimilarityHead::new(head_config)?;

        let mut optimizer = AdamW::new(config.optimizer.clone());
        for var in encoder.trainable_vars() {
            optimizer.add_param(var)?;
        }

        Ok(Self {
            encoder,
            tokenizer,
            head,
            optimizer,
            config,
            history: TrainingHistory::default(),
            device,
            evals_since_best: 0,
        })
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn history(&self) -> &TrainingHistory {
        &self.history
    }

    pub fn current_lr(&self) -> f64 {
        self.optimizer.current_lr()
    }

    /// Head output for one batch. `train` selects the dropout forward.
    pub fn batch_output(&self, batch: &TrainingBatch, train: bool) -> EmbeddingResult<HeadOutput> {
        if batch.is_empty() {
            return Err(EmbeddingError::EmptyInput);
        }
        let n_hard = self.head.config().num_hard_negatives;

        let questions = batch.questions();
        let query_tokens = self.tokenizer.tokenize(
            &questions,
            self.encoder.tower(TowerRole::Query).max_seq_len(),
            &self.device,
        )?;

        let passages: Vec<(Option<&str>, &str)> = batch
            .passages(n_hard)
            .into_iter()
            .map(|p| (p.title(), p.text.as_str()))
            .collect();
        let passage_tokens = self.tokenizer.tokenize_titled(
            &passages,
            self.encoder.tower(TowerRole::Passage).max_seq_len(),
            self.config.embed_title,
            &self.device,
        )?;

        let output = if train {
            self.encoder
                .forward_train(Some(&query_tokens), Some(&passage_tokens))?
        } else {
            self.encoder.forward(Some(&query_tokens), Some(&passage_tokens))?
        };

        let (binary_query, dense_query, binary_passages) = match (
            output.binary_query.as_ref(),
            output.dense_query.as_ref(),
            output.binary_passage.as_ref(),
        ) {
            (Some(bq), Some(dq), Some(bp)) => (bq, dq, bp),
            _ => {
                return Err(EmbeddingError::TensorError {
                    message: "dual encoder omitted an output for a present batch".to_string(),
                })
            }
        };

        self.head.forward(&HeadInput {
            binary_query,
            dense_query,
            binary_passages,
        })
    }

    /// One optimizer step on a single batch.
    pub fn train_step(&mut self, batch: &TrainingBatch) -> EmbeddingResult<LossComponents> {
        let output = self.batch_output(batch, true)?;
        self.apply_update(vec![output.loss])?;
        Ok(output.components)
    }

    /// Average the accumulated batch losses and take one optimizer step.
    fn apply_update(&mut self, losses: Vec<Tensor>) -> EmbeddingResult<()> {
        let count = losses.len();
        if count == 0 {
            return Ok(());
        }
        let stacked = Tensor::stack(&losses, 0).map_err(map_candle)?;
        let loss = stacked
            .sum_all()
            .and_then(|t| t.affine(1.0 / count as f64, 0.0))
            .map_err(map_candle)?;
        self.optimizer.step(&loss)?;
        self.history.total_steps += 1;
        Ok(())
    }

    /// Dev loss and accuracy over a full pass of `loader`, without dropout.
    pub fn evaluate(&self, loader: &mut SimilarityDataLoader) -> EmbeddingResult<EvalMetrics> {
        if loader.is_empty() {
            return Err(EmbeddingError::EmptyInput);
        }
        loader.reset();

        let mut loss_sum = 0.0f32;
        let mut acc_sum = 0.0f32;
        let mut seen = 0usize;
        let mut num_batches = 0usize;
        while let Some(batch) = loader.next_batch(num_batches) {
            let output = self.batch_output(&batch, false)?;
            let weight = batch.len() as f32;
            loss_sum += output.components.total * weight;
            acc_sum += output.top1_accuracy()? * weight;
            seen += batch.len();
            num_batches += 1;
        }

        Ok(EvalMetrics {
            loss: loss_sum / seen as f32,
            accuracy: acc_sum / seen as f32,
            num_batches,
        })
    }

    /// Record a dev evaluation, checkpointing on improvement.
    ///
    /// Returns true if training should continue, false if early stopping
    /// triggered.
    pub fn record_evaluation(&mut self, metrics: EvalMetrics) -> EmbeddingResult<bool> {
        let step = self.history.total_steps;
        self.history.evaluations.push((step, metrics));

        let improved = match self.history.best_loss {
            None => true,
            Some(best) => metrics.loss < best - self.config.early_stopping_min_delta,
        };

        if improved {
            self.history.best_loss = Some(metrics.loss);
            self.history.best_step = step;
            self.evals_since_best = 0;
            if let Some(dir) = &self.config.checkpoint_dir {
                self.encoder.save(dir)?;
                tracing::info!(step, loss = metrics.loss, dir = %dir.display(), "saved best encoder");
            }
        } else {
            self.evals_since_best += 1;
        }

        tracing::info!(
            step,
            loss = metrics.loss,
            accuracy = metrics.accuracy,
            improved,
            "dev evaluation"
        );

        if let Some(patience) = self.config.early_stopping_patience {
            if self.evals_since_best >= patience {
                self.history.early_stopped = true;
                tracing::info!(step, patience, "early stopping");
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Full training run.
    ///
    /// # Errors
    /// - `EmptyInput` if `train` has no usable examples
    /// - `ConfigError` if a loader's hard-negative count differs from the head's
    #[tracing::instrument(skip_all, fields(train = train.len(), epochs = self.config.epochs))]
    pub fn train(
        &mut self,
        train: &mut SimilarityDataLoader,
        mut dev: Option<&mut SimilarityDataLoader>,
    ) -> EmbeddingResult<TrainingHistory> {
        if train.is_empty() {
            return Err(EmbeddingError::EmptyInput);
        }
        let n_hard = self.head.config().num_hard_negatives;
        let loaders = std::iter::once(&*train).chain(dev.as_deref());
        for loader in loaders {
            if loader.num_hard_negatives() != n_hard {
                return Err(EmbeddingError::config(format!(
                    "data loader yields {} hard negatives per question but the head expects {}",
                    loader.num_hard_negatives(),
                    n_hard
                )));
            }
        }
        if dev.as_ref().is_some_and(|d| d.is_empty()) {
            tracing::warn!("dev set is empty; training without evaluation");
            dev = None;
        }

        let grad_acc = self.config.grad_acc_steps;
        let steps_per_epoch = train.num_batches().div_ceil(grad_acc);
        self.optimizer
            .set_total_steps(steps_per_epoch * self.config.epochs);

        tracing::info!(
            batches = train.num_batches(),
            steps_per_epoch,
            params = self.optimizer.num_params(),
            "starting training"
        );

        'epochs: for epoch in 1..=self.config.epochs {
            train.shuffle_epoch();

            let mut sum = LossComponents::default();
            let mut num_batches = 0usize;
            let mut pending = Vec::with_capacity(grad_acc);
            let mut evaluated_at = None;

            while let Some(batch) = train.next_batch(num_batches) {
                let output = self.batch_output(&batch, true)?;
                sum.candidate += output.components.candidate;
                sum.rerank += output.components.rerank;
                sum.total += output.components.total;
                num_batches += 1;
                pending.push(output.loss);

                if pending.len() < grad_acc {
                    continue;
                }
                self.apply_update(std::mem::take(&mut pending))?;
                tracing::debug!(
                    epoch,
                    step = self.history.total_steps,
                    lr = self.optimizer.current_lr(),
                    loss = output.components.total,
                    "train step"
                );

                let step = self.history.total_steps;
                if self.config.evaluate_every > 0 && step % self.config.evaluate_every == 0 {
                    if let Some(dev) = dev.as_deref_mut() {
                        let metrics = self.evaluate(dev)?;
                        evaluated_at = Some(step);
                        if !self.record_evaluation(metrics)? {
                            self.finish_epoch(epoch, sum, num_batches, Some(metrics));
                            break 'epochs;
                        }
                    }
                }
            }
            self.apply_update(pending)?;

            let mut eval_metrics = None;
            if let Some(dev) = dev.as_deref_mut() {
                if evaluated_at == Some(self.history.total_steps) {
                    eval_metrics = self.history.evaluations.last().map(|(_, m)| *m);
                } else {
                    let metrics = self.evaluate(dev)?;
                    eval_metrics = Some(metrics);
                    if !self.record_evaluation(metrics)? {
                        self.finish_epoch(epoch, sum, num_batches, eval_metrics);
                        break;
                    }
                }
            }
            self.finish_epoch(epoch, sum, num_batches, eval_metrics);
        }

        if dev.is_none() {
            if let Some(dir) = &self.config.checkpoint_dir {
                self.encoder.save(dir)?;
                tracing::info!(dir = %dir.display(), "saved final encoder");
            }
        }

        Ok(self.history.clone())
    }

    fn finish_epoch(
        &mut self,
        epoch: usize,
        sum: LossComponents,
        num_batches: usize,
        eval_metrics: Option<EvalMetrics>,
    ) {
        let n = num_batches.max(1) as f32;
        let avg_loss = LossComponents {
            candidate: sum.candidate / n,
            rerank: sum.rerank / n,
            total: sum.total / n,
        };
        let is_best = eval_metrics.is_some()
            && self.history.best_step == self.history.total_steps
            && self
                .history
                .evaluations
                .last()
                .is_some_and(|(step, _)| *step == self.history.total_steps);

        tracing::info!(
            epoch,
            loss = avg_loss.total,
            candidate = avg_loss.candidate,
            rerank = avg_loss.rerank,
            is_best,
            "epoch complete"
        );

        self.history.epochs.push(EpochResult {
            epoch,
            avg_loss,
            num_batches,
            eval_metrics,
            is_best,
        });
    }
}

fn map_candle(e: candle_core::Error) -> EmbeddingError {
    EmbeddingError::TensorError {
        message: format!("Trainer error: {}", e),
    }
}
