use candle_core::backprop::GradStore;
use candle_core::{DType, Var};
use candle_nn::Optimizer;

use crate::error::JepaResult;

/// Sums gradients over a window of micro-steps and applies them with one
/// optimizer step.
///
/// The first micro-step's [`GradStore`] becomes the buffer; later ones are
/// added into it per variable. The buffer is dropped after the optimizer step
/// or on [`clear`](Self::clear).
pub struct GradientAccumulator {
    steps: usize,
    pending: usize,
    buffer: Option<GradStore>,
}

impl GradientAccumulator {
    pub fn new(steps: usize) -> Self {
        Self {
            steps: steps.max(1),
            pending: 0,
            buffer: None,
        }
    }

    /// Micro-steps per optimizer step.
    pub fn steps(&self) -> usize {
        self.steps
    }

    pub fn set_steps(&mut self, steps: usize) {
        self.steps = steps.max(1);
    }

    /// Micro-steps accumulated since the last optimizer step.
    pub fn pending(&self) -> usize {
        self.pending
    }

    pub fn is_window_complete(&self) -> bool {
        self.pending >= self.steps
    }

    pub fn gradient(&self, var: &Var) -> Option<&candle_core::Tensor> {
        self.buffer.as_ref().and_then(|b| b.get(var.as_tensor()))
    }

    pub fn accumulate(&mut self, mut grads: GradStore, vars: &[Var]) -> JepaResult<()> {
        match self.buffer.as_mut() {
            None => self.buffer = Some(grads),
            Some(buffer) => {
                for var in vars {
                    let Some(g) = grads.remove(var.as_tensor()) else {
                        continue;
                    };
                    let sum = match buffer.remove(var.as_tensor()) {
                        Some(prev) => (prev + g)?,
                        None => g,
                    };
                    buffer.insert(var.as_tensor(), sum);
                }
            }
        }
        self.pending += 1;
        Ok(())
    }

    /// L2 norm over every buffered gradient of `vars`.
    pub fn global_norm(&self, vars: &[Var]) -> JepaResult<f64> {
        let mut total = 0f64;
        for var in vars {
            if let Some(g) = self.gradient(var) {
                total += g.sqr()?.sum_all()?.to_dtype(DType::F64)?.to_scalar::<f64>()?;
            }
        }
        Ok(total.sqrt())
    }

    /// Rescale the buffer so its global norm is at most `max_norm`. Returns
    /// the norm before clipping.
    pub fn clip(&mut self, vars: &[Var], max_norm: f64) -> JepaResult<f64> {
        let norm = self.global_norm(vars)?;
        let scale = max_norm / (norm + 1e-6);
        if scale < 1.0 {
            if let Some(buffer) = self.buffer.as_mut() {
                for var in vars {
                    if let Some(g) = buffer.remove(var.as_tensor()) {
                        buffer.insert(var.as_tensor(), g.affine(scale, 0.0)?);
                    }
                }
            }
        }
        Ok(norm)
    }

    /// Once the window is complete: clip, step `optimizer` and clear.
    /// Returns the pre-clip gradient norm when a step was taken.
    pub fn apply_and_reset<O: Optimizer>(
        &mut self,
        optimizer: &mut O,
        vars: &[Var],
        max_norm: Option<f64>,
    ) -> JepaResult<Option<f64>> {
        if !self.is_window_complete() {
            return Ok(None);
        }
        let norm = match max_norm {
            Some(max_norm) => self.clip(vars, max_norm)?,
            None => self.global_norm(vars)?,
        };
        if let Some(buffer) = self.buffer.as_ref() {
            optimizer.step(buffer)?;
        }
        self.clear();
        Ok(Some(norm))
    }

    pub fn clear(&mut self) {
        self.buffer = None;
        self.pending = 0;
    }
}
