use candle_core::Var;
use tracing::debug;

use super::encoder::{Encoder, EncoderRole};
use crate::config::JepaConfig;
use crate::context::ExecutionContext;
use crate::error::{JepaError, JepaResult};

/// Pair online/target parameters by name, in the shared sorted order.
fn paired_parameters(src: &Encoder, dst: &Encoder) -> JepaResult<Vec<(String, Var, Var)>> {
    let src_params = src.named_parameters()?;
    let dst_params = dst.named_parameters()?;
    if src_params.len() != dst_params.len() {
        return Err(JepaError::parameter_mismatch(format!(
            "online encoder has {} parameters, target has {}",
            src_params.len(),
            dst_params.len()
        )));
    }
    src_params
        .into_iter()
        .zip(dst_params)
        .map(|((src_name, src_var), (dst_name, dst_var))| {
            if src_name != dst_name {
                return Err(JepaError::parameter_mismatch(format!(
                    "parameter order diverged: {src_name} vs {dst_name}"
                )));
            }
            if src_var.dims() != dst_var.dims() {
                return Err(JepaError::parameter_mismatch(format!(
                    "{src_name}: shape {:?} vs {:?}",
                    src_var.dims(),
                    dst_var.dims()
                )));
            }
            Ok((src_name, src_var, dst_var))
        })
        .collect()
}

/// Copy every parameter of `src` into `dst`.
pub fn copy_parameters(src: &Encoder, dst: &Encoder) -> JepaResult<()> {
    for (_, src_var, dst_var) in paired_parameters(src, dst)? {
        dst_var.set(&src_var.as_tensor().detach())?;
    }
    Ok(())
}

/// In-place EMA: `dst = rate * dst + (1 - rate) * src`, parameter-wise.
pub fn ema_update(src: &Encoder, dst: &Encoder, rate: f64) -> JepaResult<()> {
    for (_, src_var, dst_var) in paired_parameters(src, dst)? {
        let kept = dst_var.as_tensor().detach().affine(rate, 0.0)?;
        let mixed = src_var.as_tensor().detach().affine(1.0 - rate, 0.0)?;
        dst_var.set(&(kept + mixed)?)?;
    }
    Ok(())
}

/// Owns the target encoder and keeps it an exponential moving average of the
/// online encoder.
///
/// `update_target` is the only way the target's parameters change; callers
/// invoke it once per committed optimizer step.
pub struct EmaTeacher {
    target: Encoder,
    ema_rate: f64,
    updates: u64,
}

impl EmaTeacher {
    /// Build a target encoder with the online encoder's architecture and an
    /// exact copy of its current parameters.
    pub fn new(online: &Encoder, config: &JepaConfig, ctx: &ExecutionContext) -> JepaResult<Self> {
        if online.role() != EncoderRole::Online {
            return Err(JepaError::invalid_config(
                "EMA teacher must be initialised from an online encoder",
            ));
        }
        let target = Encoder::new(config, ctx, EncoderRole::Target)?;
        copy_parameters(online, &target)?;
        Ok(Self {
            target,
            ema_rate: config.ema_rate,
            updates: 0,
        })
    }

    pub fn update_target(&mut self, online: &Encoder) -> JepaResult<()> {
        ema_update(online, &self.target, self.ema_rate)?;
        self.updates += 1;
        debug!(updates = self.updates, rate = self.ema_rate, "target encoder EMA update");
        Ok(())
    }

    pub fn encoder(&self) -> &Encoder {
        &self.target
    }

    pub fn ema_rate(&self) -> f64 {
        self.ema_rate
    }

    /// Number of EMA updates applied so far.
    pub fn updates(&self) -> u64 {
        self.updates
    }
}
