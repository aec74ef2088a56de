//! Training objective over a [`Rollout`]: scheduled regression, contrastive
//! alignment and the two anti-collapse penalties.

pub mod contrastive;
pub mod regularizers;
pub mod schedule;

use candle_core::{Tensor, D};

pub use contrastive::{contrastive_loss, normalize_latents};
pub use regularizers::{covariance_regularization, variance_regularization};
pub use schedule::{scheduled_loss_weight, scheduled_loss_weight_tensor};

use crate::config::{JepaConfig, ScheduleMode};
use crate::context::ExecutionContext;
use crate::error::{JepaError, JepaResult};
use crate::model::Rollout;

/// Squared error between `(B, T, D)` latents, averaged over features, batch
/// and time. With `weights` `(T,)`, each timestep's mean error is scaled
/// before the final average.
pub fn regression_loss(predicted: &Tensor, target: &Tensor, weights: Option<&Tensor>) -> JepaResult<Tensor> {
    if predicted.dims() != target.dims() {
        return Err(JepaError::shape_mismatch(
            "regression_loss",
            format!("{:?}", predicted.dims()),
            format!("{:?}", target.dims()),
        ));
    }
    let sq = (predicted - target)?.sqr()?;
    match weights {
        None => Ok(sq.mean_all()?),
        Some(w) => {
            let per_step = sq.mean(D::Minus1)?;
            let horizon = per_step.dim(D::Minus1)?;
            if w.dims() != [horizon] {
                return Err(JepaError::shape_mismatch(
                    "regression weights",
                    format!("({horizon},)"),
                    format!("{:?}", w.dims()),
                ));
            }
            Ok(per_step.broadcast_mul(w)?.mean_all()?)
        }
    }
}

/// Differentiable loss terms of one micro-step.
pub struct LossTerms {
    pub total: Tensor,
    pub regression: Tensor,
    pub contrastive: Tensor,
    pub variance: Tensor,
    pub covariance: Tensor,
}

/// Host-side copy of [`LossTerms`] for logging.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LossValues {
    pub total: f32,
    pub regression: f32,
    pub contrastive: f32,
    pub variance: f32,
    pub covariance: f32,
}

impl LossTerms {
    pub fn values(&self) -> JepaResult<LossValues> {
        let scalar = |t: &Tensor| -> JepaResult<f32> { Ok(t.to_dtype(candle_core::DType::F32)?.to_scalar::<f32>()?) };
        Ok(LossValues {
            total: scalar(&self.total)?,
            regression: scalar(&self.regression)?,
            contrastive: scalar(&self.contrastive)?,
            variance: scalar(&self.variance)?,
            covariance: scalar(&self.covariance)?,
        })
    }
}

/// Combines the loss terms with the coefficients from [`JepaConfig`].
#[derive(Debug, Clone)]
pub struct LossAssembly {
    temperature: f64,
    variance_floor: f64,
    variance_weight: f64,
    covariance_weight: f64,
    schedule: Option<ScheduleMode>,
}

impl LossAssembly {
    pub fn new(config: &JepaConfig) -> Self {
        Self {
            temperature: config.temperature,
            variance_floor: config.variance_floor,
            variance_weight: config.variance_weight,
            covariance_weight: config.covariance_weight,
            schedule: config.use_schedule.then_some(config.schedule_mode),
        }
    }

    pub fn schedule(&self) -> Option<ScheduleMode> {
        self.schedule
    }

    /// `None` for a single-frame rollout, which has nothing to regress.
    ///
    /// `total = regression + contrastive + variance_weight * variance
    ///          + covariance_weight * covariance`, the penalties taken over the
    /// predicted latents.
    pub fn compute(
        &self,
        rollout: &Rollout,
        epoch: usize,
        total_epochs: usize,
        ctx: &ExecutionContext,
    ) -> JepaResult<Option<LossTerms>> {
        let (predicted, targets) = match (&rollout.predicted, &rollout.targets) {
            (Some(p), Some(t)) => (p, t),
            _ => return Ok(None),
        };
        let horizon = predicted.dim(1)?;

        let weights = match self.schedule {
            Some(mode) => Some(scheduled_loss_weight_tensor(epoch, total_epochs, horizon, mode, ctx)?),
            None => None,
        };
        let regression = regression_loss(predicted, targets, weights.as_ref())?;
        let contrastive = contrastive_loss(predicted, targets, self.temperature)?.to_dtype(regression.dtype())?;
        let variance = variance_regularization(predicted, self.variance_floor)?;
        let covariance = covariance_regularization(predicted)?;

        let total = ((&regression + &contrastive)?
            + (variance.affine(self.variance_weight, 0.0)? + covariance.affine(self.covariance_weight, 0.0)?)?)?;
        Ok(Some(LossTerms {
            total,
            regression,
            contrastive,
            variance,
            covariance,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn rollout(predicted: Tensor, targets: Tensor) -> JepaResult<Rollout> {
        let (b, _, d) = predicted.dims3()?;
        let initial = Tensor::zeros((b, 1, d), DType::F32, &Device::Cpu)?;
        let all_states = Tensor::cat(&[&initial, &predicted], 1)?;
        Ok(Rollout {
            predicted: Some(predicted),
            targets: Some(targets),
            all_states,
            steps: Vec::new(),
        })
    }

    #[test]
    fn unweighted_regression_is_plain_mse() -> JepaResult<()> {
        let p = Tensor::new(&[[[1f32, 2.0], [3.0, 4.0]]], &Device::Cpu)?;
        let t = Tensor::new(&[[[0f32, 2.0], [3.0, 2.0]]], &Device::Cpu)?;
        let loss = regression_loss(&p, &t, None)?.to_scalar::<f32>()?;
        assert!((loss - 5.0 / 4.0).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn weights_scale_each_timestep() -> JepaResult<()> {
        // per-step mean error: [0.5, 2.0]
        let p = Tensor::new(&[[[1f32, 2.0], [3.0, 4.0]]], &Device::Cpu)?;
        let t = Tensor::new(&[[[0f32, 2.0], [3.0, 2.0]]], &Device::Cpu)?;
        let w = Tensor::new(&[1f32, 0.0], &Device::Cpu)?;
        let loss = regression_loss(&p, &t, Some(&w))?.to_scalar::<f32>()?;
        assert!((loss - 0.25).abs() < 1e-6);

        let bad = Tensor::new(&[1f32, 0.0, 0.0], &Device::Cpu)?;
        assert!(regression_loss(&p, &t, Some(&bad)).is_err());
        Ok(())
    }

    #[test]
    fn total_combines_every_term() -> JepaResult<()> {
        let ctx = ExecutionContext::cpu();
        let config = JepaConfig::default();
        let predicted = Tensor::randn(0f32, 1f32, (4, 3, 8), &Device::Cpu)?;
        let targets = Tensor::randn(0f32, 1f32, (4, 3, 8), &Device::Cpu)?;
        let terms = LossAssembly::new(&config)
            .compute(&rollout(predicted, targets)?, 2, 10, &ctx)?
            .expect("multi-step rollout has a loss");
        let v = terms.values()?;

        let expected = v.regression
            + v.contrastive
            + config.variance_weight as f32 * v.variance
            + config.covariance_weight as f32 * v.covariance;
        assert!((v.total - expected).abs() < 1e-4, "{v:?}");
        assert!(v.total.is_finite());
        Ok(())
    }

    #[test]
    fn schedule_can_be_disabled() -> JepaResult<()> {
        let config = JepaConfig {
            use_schedule: false,
            ..JepaConfig::default()
        };
        assert_eq!(LossAssembly::new(&config).schedule(), None);
        assert_eq!(
            LossAssembly::new(&JepaConfig::default()).schedule(),
            Some(ScheduleMode::Linear)
        );
        Ok(())
    }

    #[test]
    fn single_frame_rollout_has_no_loss() -> JepaResult<()> {
        let ctx = ExecutionContext::cpu();
        let single = Rollout {
            predicted: None,
            targets: None,
            all_states: Tensor::zeros((2, 1, 8), DType::F32, &Device::Cpu)?,
            steps: Vec::new(),
        };
        assert!(LossAssembly::new(&JepaConfig::default())
            .compute(&single, 0, 10, &ctx)?
            .is_none());
        Ok(())
    }
}
