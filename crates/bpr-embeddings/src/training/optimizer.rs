//! AdamW over candle `Var`s.
//!
//! - Per-parameter moment estimates (m, v) with bias correction
//! - Linear warmup followed by linear decay to zero
//! - Global-norm gradient clipping
//! - Decoupled weight decay

use candle_core::{Tensor, Var};

use crate::error::{EmbeddingError, EmbeddingResult};

#[derive(Debug, Clone)]
pub struct AdamWConfig {
    /// Peak learning rate, reached at the end of warmup.
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    /// Decoupled weight decay coefficient.
    pub weight_decay: f64,
    /// Gradients are rescaled when their global L2 norm exceeds this.
    pub max_grad_norm: f64,
    /// Steps of linear warmup from 0 to `learning_rate`.
    pub warmup_steps: usize,
    /// Total steps; the rate decays linearly to 0 at this step.
    pub total_steps: usize,
}

impl Default for AdamWConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-5,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay: 0.0,
            max_grad_norm: 1.0,
            warmup_steps: 100,
            total_steps: 1000,
        }
    }
}

struct TrackedParam {
    var: Var,
    m: Tensor,
    v: Tensor,
}

pub struct AdamW {
    config: AdamWConfig,
    params: Vec<TrackedParam>,
    step: usize,
}

impl AdamW {
    pub fn new(config: AdamWConfig) -> Self {
        Self {
            config,
            params: Vec::new(),
            step: 0,
        }
    }

    /// Register a trainable parameter.
    pub fn add_param(&mut self, var: Var) -> EmbeddingResult<()> {
        let m = Tensor::zeros_like(var.as_tensor()).map_err(map_candle)?;
        let v = Tensor::zeros_like(var.as_tensor()).map_err(map_candle)?;
        self.params.push(TrackedParam { var, m, v });
        Ok(())
    }

    /// Learning rate at the current step.
    pub fn current_lr(&self) -> f64 {
        let base = self.config.learning_rate;
        let warmup = self.config.warmup_steps;

        if self.step < warmup {
            return base * (self.step as f64 / warmup as f64);
        }
        let decay_steps = self.config.total_steps.saturating_sub(warmup);
        if decay_steps == 0 {
            return base;
        }
        let remaining = self.config.total_steps.saturating_sub(self.step) as f64;
        base * (remaining / decay_steps as f64)
    }

    /// Backpropagate `loss` and apply one update to every registered parameter.
    pub fn step(&mut self, loss: &Tensor) -> EmbeddingResult<()> {
        let lr = self.current_lr();
        self.step += 1;
        let t = self.step as i32;

        let grads = loss.backward().map_err(map_candle)?;

        let mut total_sq = 0.0f64;
        for param in &self.params {
            if let Some(grad) = grads.get(param.var.as_tensor()) {
                let sq: f32 = grad
                    .sqr()
                    .and_then(|g| g.sum_all())
                    .and_then(|g| g.to_scalar())
                    .map_err(map_candle)?;
                total_sq += sq as f64;
            }
        }
        let total_norm = total_sq.sqrt();
        let clip_scale = if total_norm > self.config.max_grad_norm {
            self.config.max_grad_norm / (total_norm + self.config.epsilon)
        } else {
            1.0
        };

        let bc1 = 1.0 - self.config.beta1.powi(t);
        let bc2 = 1.0 - self.config.beta2.powi(t);

        for param in &mut self.params {
            let grad = match grads.get(param.var.as_tensor()) {
                Some(g) => g,
                None => continue,
            };
            let grad = if (clip_scale - 1.0).abs() > 1e-9 {
                grad.affine(clip_scale, 0.0).map_err(map_candle)?
            } else {
                grad.clone()
            };

            // m = β1·m + (1-β1)·g ; v = β2·v + (1-β2)·g²
            param.m = param
                .m
                .affine(self.config.beta1, 0.0)
                .and_then(|m| m.add(&grad.affine(1.0 - self.config.beta1, 0.0)?))
                .map_err(map_candle)?
                .detach();
            param.v = param
                .v
                .affine(self.config.beta2, 0.0)
                .and_then(|v| v.add(&grad.sqr()?.affine(1.0 - self.config.beta2, 0.0)?))
                .map_err(map_candle)?
                .detach();

            let m_hat = param.m.affine(1.0 / bc1, 0.0).map_err(map_candle)?;
            let denom = param
                .v
                .affine(1.0 / bc2, 0.0)
                .and_then(|v| v.sqrt())
                .and_then(|v| v.affine(1.0, self.config.epsilon))
                .map_err(map_candle)?;
            let update = m_hat
                .div(&denom)
                .and_then(|u| u.affine(-lr, 0.0))
                .map_err(map_candle)?;

            // θ = θ + update - lr·wd·θ
            let current = param.var.as_tensor().detach();
            let new_val = current
                .affine(1.0 - lr * self.config.weight_decay, 0.0)
                .and_then(|c| c.add(&update))
                .map_err(map_candle)?;

            param.var.set(&new_val).map_err(map_candle)?;
        }

        Ok(())
    }

    /// Reset the schedule length, e.g. once the number of batches is known.
    pub fn set_total_steps(&mut self, total_steps: usize) {
        self.config.total_steps = total_steps;
    }

    pub fn global_step(&self) -> usize {
        self.step
    }

    pub fn num_params(&self) -> usize {
        self.params.len()
    }

    pub fn config(&self) -> &AdamWConfig {
        &self.config
    }
}

fn map_candle(e: candle_core::Error) -> EmbeddingError {
    EmbeddingError::TensorError {
        message: format!("Optimizer error: {}", e),
    }
}
