use candle_core::Tensor;

use crate::config::ScheduleMode;
use crate::context::ExecutionContext;
use crate::error::{JepaError, JepaResult};

/// Per-timestep regression weights for `epoch` of `total_epochs`, normalized
/// to sum to one.
///
/// - `Linear`: evenly spaced from 1.0 down to `epoch / total_epochs`.
/// - `Exponential`: `factor^(t-1)` for `t = 1..=timesteps` with
///   `factor = epoch / total_epochs`. At epoch 0 all weight sits on the first
///   step.
pub fn scheduled_loss_weight(
    epoch: usize,
    total_epochs: usize,
    timesteps: usize,
    mode: ScheduleMode,
) -> JepaResult<Vec<f32>> {
    if total_epochs == 0 {
        return Err(JepaError::invalid_config("total_epochs must be non-zero"));
    }
    if timesteps == 0 {
        return Err(JepaError::invalid_config("cannot weight zero timesteps"));
    }
    let progress = epoch as f64 / total_epochs as f64;
    let raw: Vec<f64> = match mode {
        ScheduleMode::Linear => {
            if timesteps == 1 {
                vec![1.0]
            } else {
                let step = (progress - 1.0) / (timesteps - 1) as f64;
                (0..timesteps).map(|t| 1.0 + step * t as f64).collect()
            }
        }
        ScheduleMode::Exponential => (0..timesteps).map(|t| progress.powi(t as i32)).collect(),
    };
    let sum: f64 = raw.iter().sum();
    if !(sum > 0.0 && sum.is_finite()) {
        return Err(JepaError::invalid_config(format!(
            "{mode} schedule at epoch {epoch}/{total_epochs} has no positive weight"
        )));
    }
    Ok(raw.into_iter().map(|w| (w / sum) as f32).collect())
}

/// [`scheduled_loss_weight`] as a `(timesteps,)` tensor on `ctx`.
pub fn scheduled_loss_weight_tensor(
    epoch: usize,
    total_epochs: usize,
    timesteps: usize,
    mode: ScheduleMode,
    ctx: &ExecutionContext,
) -> JepaResult<Tensor> {
    let weights = scheduled_loss_weight(epoch, total_epochs, timesteps, mode)?;
    Ok(Tensor::from_vec(weights, (timesteps,), ctx.device())?.to_dtype(ctx.dtype())?)
}
