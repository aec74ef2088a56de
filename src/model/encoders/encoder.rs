use candle_core::{Tensor, Var};
use candle_nn::{VarBuilder, VarMap};

use super::shared::EncoderBackbone;
use crate::config::JepaConfig;
use crate::context::ExecutionContext;
use crate::error::{JepaError, JepaResult};

/// Whether an encoder instance takes part in gradient descent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderRole {
    /// Updated by the optimizer every step.
    Online,
    /// EMA teacher: never handed to the optimizer, outputs are detached.
    Target,
}

impl EncoderRole {
    pub fn is_trainable(self) -> bool {
        matches!(self, Self::Online)
    }
}

/// Saved copies of an encoder's BatchNorm running statistics.
///
/// Training-mode forward passes overwrite these in place, so a step that is
/// abandoned after its forward pass restores them from here.
pub struct RunningStatistics {
    saved: Vec<(Var, Tensor)>,
}

impl RunningStatistics {
    /// Write the saved values back into the encoder's variables.
    pub fn restore(&self) -> JepaResult<()> {
        for (var, tensor) in &self.saved {
            var.set(tensor)?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.saved.len()
    }

    pub fn is_empty(&self) -> bool {
        self.saved.is_empty()
    }
}

/// Observation encoder. Online and target encoders are two instances of this
/// type that differ only in their [`EncoderRole`].
///
/// Each instance owns its variables so that [`Encoder::named_parameters`]
/// yields the same names in the same order for two encoders built from the
/// same config.
pub struct Encoder {
    inner: EncoderBackbone,
    vars: VarMap,
    role: EncoderRole,
    observation: (usize, usize, usize),
    latent: (usize, usize, usize),
}

impl Encoder {
    pub fn new(config: &JepaConfig, ctx: &ExecutionContext, role: EncoderRole) -> JepaResult<Self> {
        config.validate_model()?;
        let vars = VarMap::new();
        let vb = VarBuilder::from_varmap(&vars, ctx.dtype(), ctx.device());
        let inner = EncoderBackbone::new(vb, config)?;
        Ok(Self {
            inner,
            vars,
            role,
            observation: (
                config.in_channels,
                config.observation_height,
                config.observation_width,
            ),
            latent: config.latent_shape(),
        })
    }

    pub fn role(&self) -> EncoderRole {
        self.role
    }

    pub fn latent_shape(&self) -> (usize, usize, usize) {
        self.latent
    }

    /// Variables the optimizer may update; empty for a target encoder.
    pub fn trainable_vars(&self) -> Vec<Var> {
        if self.role.is_trainable() {
            self.vars.all_vars()
        } else {
            Vec::new()
        }
    }

    /// All parameters sorted by name. Two encoders of the same config yield
    /// identical name sequences, which is what the EMA pairing relies on.
    pub fn named_parameters(&self) -> JepaResult<Vec<(String, Var)>> {
        let data = self
            .vars
            .data()
            .lock()
            .map_err(|_| JepaError::parameter_mismatch("encoder variable map lock poisoned"))?;
        let mut params: Vec<(String, Var)> = data
            .iter()
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect();
        params.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(params)
    }

    pub fn parameter_count(&self) -> usize {
        self.vars.all_vars().iter().map(|v| v.elem_count()).sum()
    }

    /// Copy out the `running_mean` / `running_var` buffers; empty without
    /// normalization.
    pub fn running_statistics(&self) -> JepaResult<RunningStatistics> {
        let saved = self
            .named_parameters()?
            .into_iter()
            .filter(|(name, _)| name.ends_with("running_mean") || name.ends_with("running_var"))
            .map(|(_, var)| {
                let value = var.as_tensor().copy()?;
                Ok((var, value))
            })
            .collect::<JepaResult<Vec<_>>>()?;
        Ok(RunningStatistics { saved })
    }

    /// Encode `(B, C, H, W)` frames into `(B, c, h, w)` latents, or
    /// `(B, T, C, H, W)` sequences into `(B, T, c, h, w)` latents in a single
    /// batched pass over `B*T` frames.
    ///
    /// A target encoder ignores `train` and always normalizes with its running
    /// statistics, so only the EMA update changes its state.
    pub fn forward_t(&self, x: &Tensor, train: bool) -> JepaResult<Tensor> {
        let (c, h, w) = self.observation;
        let train = train && self.role.is_trainable();
        let out = match x.rank() {
            4 => {
                let (_, xc, xh, xw) = x.dims4()?;
                self.check_frame((xc, xh, xw))?;
                self.inner.forward_frames(x, train)?
            }
            5 => {
                let (b, t, xc, xh, xw) = x.dims5()?;
                self.check_frame((xc, xh, xw))?;
                let frames = x.reshape((b * t, c, h, w))?;
                let latents = self.inner.forward_frames(&frames, train)?;
                let (lc, lh, lw) = self.latent;
                latents.reshape((b, t, lc, lh, lw))?
            }
            _ => {
                return Err(JepaError::shape_mismatch(
                    "encoder input",
                    format!("(B, {c}, {h}, {w}) or (B, T, {c}, {h}, {w})"),
                    format!("{:?}", x.dims()),
                ))
            }
        };
        if self.role.is_trainable() {
            Ok(out)
        } else {
            Ok(out.detach())
        }
    }

    /// Inference-mode forward pass.
    pub fn forward(&self, x: &Tensor) -> JepaResult<Tensor> {
        self.forward_t(x, false)
    }

    fn check_frame(&self, got: (usize, usize, usize)) -> JepaResult<()> {
        if got != self.observation {
            let (c, h, w) = self.observation;
            return Err(JepaError::shape_mismatch(
                "encoder frame",
                format!("({c}, {h}, {w})"),
                format!("{:?}", got),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, IndexOp};

    fn small_config(normalization: bool) -> JepaConfig {
        JepaConfig {
            observation_height: 16,
            observation_width: 16,
            encoder_channels: vec![4, 8],
            state_dim: 32,
            latent_channels: 2,
            latent_height: 4,
            latent_width: 4,
            normalization,
            ..JepaConfig::default()
        }
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> JepaResult<f32> {
        Ok((a - b)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()?)
    }

    #[test]
    fn batched_sequence_matches_per_frame_calls() -> JepaResult<()> {
        for normalization in [false, true] {
            let ctx = ExecutionContext::cpu();
            let encoder = Encoder::new(&small_config(normalization), &ctx, EncoderRole::Online)?;
            let obs = Tensor::randn(0f32, 1f32, (3, 5, 2, 16, 16), &Device::Cpu)?;

            let batched = encoder.forward(&obs)?;
            assert_eq!(batched.dims(), &[3, 5, 2, 4, 4]);
            for t in 0..5 {
                let frame = obs.i((.., t))?.contiguous()?;
                let looped = encoder.forward(&frame)?;
                let from_batch = batched.i((.., t))?;
                assert!(max_abs_diff(&looped, &from_batch)? < 1e-5);
            }
        }
        Ok(())
    }

    #[test]
    fn rejects_wrong_rank_and_frame_shape() -> JepaResult<()> {
        let ctx = ExecutionContext::cpu();
        let encoder = Encoder::new(&small_config(false), &ctx, EncoderRole::Online)?;

        let flat = Tensor::zeros((4, 512), ctx.dtype(), ctx.device())?;
        assert!(matches!(
            encoder.forward(&flat),
            Err(JepaError::ShapeMismatch { .. })
        ));

        let wrong_channels = Tensor::zeros((2, 3, 16, 16), ctx.dtype(), ctx.device())?;
        assert!(matches!(
            encoder.forward(&wrong_channels),
            Err(JepaError::ShapeMismatch { .. })
        ));
        Ok(())
    }

    #[test]
    fn target_role_is_not_trainable() -> JepaResult<()> {
        let ctx = ExecutionContext::cpu();
        let config = small_config(true);
        let online = Encoder::new(&config, &ctx, EncoderRole::Online)?;
        let target = Encoder::new(&config, &ctx, EncoderRole::Target)?;

        assert!(!online.trainable_vars().is_empty());
        assert!(target.trainable_vars().is_empty());

        let names = |e: &Encoder| -> JepaResult<Vec<String>> {
            Ok(e.named_parameters()?.into_iter().map(|(n, _)| n).collect())
        };
        assert_eq!(names(&online)?, names(&target)?);
        assert_eq!(online.parameter_count(), target.parameter_count());
        Ok(())
    }

    #[test]
    fn running_statistics_restore_undoes_training_pass() -> JepaResult<()> {
        let ctx = ExecutionContext::cpu();
        let encoder = Encoder::new(&small_config(true), &ctx, EncoderRole::Online)?;
        let saved = encoder.running_statistics()?;
        // Two stages, mean and var each.
        assert_eq!(saved.len(), 4);

        let frames = Tensor::randn(0f32, 1f32, (2, 2, 16, 16), &Device::Cpu)?;
        let before = encoder.forward(&frames)?;
        let obs = Tensor::randn(3f32, 2f32, (4, 2, 16, 16), &Device::Cpu)?;
        encoder.forward_t(&obs, true)?;
        assert!(max_abs_diff(&before, &encoder.forward(&frames)?)? > 0.0);

        saved.restore()?;
        assert_eq!(max_abs_diff(&before, &encoder.forward(&frames)?)?, 0.0);

        let plain = Encoder::new(&small_config(false), &ctx, EncoderRole::Online)?;
        assert!(plain.running_statistics()?.is_empty());
        Ok(())
    }

    #[test]
    fn construction_ignores_training_hyper_parameters() -> JepaResult<()> {
        let ctx = ExecutionContext::cpu();
        let config = JepaConfig {
            epochs: 0,
            batch_size: 0,
            learning_rate: 0.0,
            max_grad_norm: 0.0,
            ..small_config(false)
        };
        assert!(config.validate().is_err());
        let encoder = Encoder::new(&config, &ctx, EncoderRole::Target)?;
        assert_eq!(encoder.latent_shape(), (2, 4, 4));

        let broken = JepaConfig {
            state_dim: 31,
            ..config
        };
        assert!(matches!(
            Encoder::new(&broken, &ctx, EncoderRole::Online),
            Err(JepaError::InvalidConfig(_))
        ));
        Ok(())
    }
}
