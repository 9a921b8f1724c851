//! Differentiable sign activation.
//!
//! Forward maps every element to `+1` if it is strictly positive and `-1`
//! otherwise (zero goes to `-1`). The true derivative of a sign function is
//! zero almost everywhere, so backward substitutes the surrogate
//!
//! ```text
//! d y / d x = γ / (1 + γ·|x|)^2
//! ```
//!
//! which is positive everywhere, peaks at exactly `γ` for `x = 0`, and decays
//! with distance from the threshold.
//!
//! On CPU the pair is registered with candle's autograd as a [`CustomOp1`].
//! Other devices use a straight-through composite `hard + soft - soft.detach()`
//! where `soft = γx / (1 + γ|x|)`, whose value equals the forward and whose
//! derivative equals the surrogate.

use candle_core::{bail, CpuStorage, CustomOp1, Layout, Shape, Tensor};

use crate::error::{EmbeddingError, EmbeddingResult};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HashActivation {
    gamma: f64,
}

impl HashActivation {
    /// # Errors
    /// `ConfigError` unless `gamma` is finite and `> 0`.
    pub fn new(gamma: f64) -> EmbeddingResult<Self> {
        if !gamma.is_finite() || gamma <= 0.0 {
            return Err(EmbeddingError::config(format!(
                "hash activation gamma must be finite and > 0, got {}",
                gamma
            )));
        }
        Ok(Self { gamma })
    }

    pub fn gamma(&self) -> f64 {
        self.gamma
    }

    /// Binarise `x` to ±1 while keeping it on the autograd tape.
    pub fn forward(&self, x: &Tensor) -> EmbeddingResult<Tensor> {
        if x.device().is_cpu() {
            x.contiguous()
                .and_then(|x| x.apply_op1(*self))
                .map_err(map_candle)
        } else {
            self.forward_straight_through(x)
        }
    }

    /// Surrogate gradient of the loss w.r.t. `x`, given the gradient w.r.t.
    /// the activation output.
    pub fn backward(&self, grad_y: &Tensor, x: &Tensor) -> EmbeddingResult<Tensor> {
        surrogate_grad(grad_y, x, self.gamma).map_err(map_candle)
    }

    /// Device-agnostic forward built from differentiable primitives.
    pub fn forward_straight_through(&self, x: &Tensor) -> EmbeddingResult<Tensor> {
        let build = || -> candle_core::Result<Tensor> {
            let hard = x
                .gt(&x.zeros_like()?)?
                .to_dtype(x.dtype())?
                .affine(2.0, -1.0)?
                .detach();
            let soft = (x.affine(self.gamma, 0.0)? / x.abs()?.affine(self.gamma, 1.0)?)?;
            let residual = (&soft - soft.detach())?;
            hard + residual
        };
        build().map_err(map_candle)
    }
}

fn surrogate_grad(grad_y: &Tensor, x: &Tensor, gamma: f64) -> candle_core::Result<Tensor> {
    let slope = x
        .detach()
        .abs()?
        .affine(gamma, 1.0)?
        .sqr()?
        .recip()?
        .affine(gamma, 0.0)?;
    grad_y.mul(&slope)
}

fn signs<T: Copy + PartialOrd>(values: &[T], zero: T, pos: T, neg: T) -> Vec<T> {
    values
        .iter()
        .map(|&v| if v > zero { pos } else { neg })
        .collect()
}

impl CustomOp1 for HashActivation {
    fn name(&self) -> &'static str {
        "hash-activation"
    }

    fn cpu_fwd(&self, storage: &CpuStorage, layout: &Layout) -> candle_core::Result<(CpuStorage, Shape)> {
        let (start, end) = match layout.contiguous_offsets() {
            Some(offsets) => offsets,
            None => bail!("hash-activation requires a contiguous input"),
        };
        let out = match storage {
            CpuStorage::F32(vs) => CpuStorage::F32(signs(&vs[start..end], 0.0, 1.0, -1.0)),
            CpuStorage::F64(vs) => CpuStorage::F64(signs(&vs[start..end], 0.0, 1.0, -1.0)),
            _ => bail!("hash-activation supports f32 and f64 inputs only"),
        };
        Ok((out, layout.shape().clone()))
    }

    fn bwd(&self, arg: &Tensor, _res: &Tensor, grad_res: &Tensor) -> candle_core::Result<Option<Tensor>> {
        surrogate_grad(grad_res, arg, self.gamma).map(Some)
    }
}

fn map_candle(e: candle_core::Error) -> EmbeddingError {
    EmbeddingError::TensorError {
        message: format!("HashActivation error: {}", e),
    }
}
