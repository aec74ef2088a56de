use candle_core::{Tensor, Var};
use candle_nn::{VarBuilder, VarMap};

use super::encoders::{EmaTeacher, Encoder, EncoderRole};
use super::predictor::RecurrentPredictor;
use crate::config::{JepaConfig, TargetSource};
use crate::context::ExecutionContext;
use crate::error::{JepaError, JepaResult};

/// Output of one forward pass over a trajectory batch. Built fresh per pass.
pub struct Rollout {
    /// Predicted latents `(B, T-1, D)`; `None` when `T == 1`.
    pub predicted: Option<Tensor>,
    /// Regression targets `(B, T-1, D)`; `None` when `T == 1`.
    pub targets: Option<Tensor>,
    /// Encoded initial state followed by the predictions, `(B, T, D)`.
    pub all_states: Tensor,
    /// Per-step predicted grids `(B, c, h, w)`, `T-1` of them.
    pub steps: Vec<Tensor>,
}

impl Rollout {
    /// Number of predicted transitions (`T-1`).
    pub fn horizon(&self) -> usize {
        self.steps.len()
    }
}

/// Online encoder, EMA teacher and recurrent predictor.
pub struct WorldModel {
    config: JepaConfig,
    online: Encoder,
    teacher: EmaTeacher,
    predictor: RecurrentPredictor,
    predictor_vars: VarMap,
}

impl WorldModel {
    pub fn new(config: &JepaConfig, ctx: &ExecutionContext) -> JepaResult<Self> {
        config.validate_model()?;
        let online = Encoder::new(config, ctx, EncoderRole::Online)?;
        let teacher = EmaTeacher::new(&online, config, ctx)?;
        let predictor_vars = VarMap::new();
        let vb = VarBuilder::from_varmap(&predictor_vars, ctx.dtype(), ctx.device());
        let predictor = RecurrentPredictor::new(vb, config)?;
        Ok(Self {
            config: config.clone(),
            online,
            teacher,
            predictor,
            predictor_vars,
        })
    }

    pub fn config(&self) -> &JepaConfig {
        &self.config
    }

    pub fn online_encoder(&self) -> &Encoder {
        &self.online
    }

    pub fn target_encoder(&self) -> &Encoder {
        self.teacher.encoder()
    }

    pub fn teacher(&self) -> &EmaTeacher {
        &self.teacher
    }

    pub fn predictor(&self) -> &RecurrentPredictor {
        &self.predictor
    }

    /// Online encoder and predictor variables. The target encoder is never
    /// included.
    pub fn trainable_vars(&self) -> Vec<Var> {
        let mut vars = self.online.trainable_vars();
        vars.extend(self.predictor_vars.all_vars());
        vars
    }

    /// Predictor parameters sorted by name.
    pub fn predictor_parameters(&self) -> JepaResult<Vec<(String, Var)>> {
        let data = self
            .predictor_vars
            .data()
            .lock()
            .map_err(|_| JepaError::parameter_mismatch("predictor variable map lock poisoned"))?;
        let mut params: Vec<(String, Var)> = data
            .iter()
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect();
        params.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(params)
    }

    pub fn parameter_count(&self) -> usize {
        self.trainable_vars().iter().map(|v| v.elem_count()).sum()
    }

    /// EMA step of the target encoder towards the online encoder. Call once
    /// per committed optimizer step.
    pub fn update_target(&mut self) -> JepaResult<()> {
        self.teacher.update_target(&self.online)
    }

    /// Encode `observations` `(B, T, C, H, W)` and roll the predictor forward
    /// over `actions` `(B, T-1, A)`.
    ///
    /// `actions` may be `None` only for `T == 1`, the inference shape with no
    /// transitions; the rollout then has no predictions and no targets.
    pub fn forward(&self, observations: &Tensor, actions: Option<&Tensor>, train: bool) -> JepaResult<Rollout> {
        let (c, h, w) = (
            self.config.in_channels,
            self.config.observation_height,
            self.config.observation_width,
        );
        if observations.rank() != 5 {
            return Err(JepaError::shape_mismatch(
                "observations",
                format!("(B, T, {c}, {h}, {w})"),
                format!("{:?}", observations.dims()),
            ));
        }
        let (b, t, _, _, _) = observations.dims5()?;
        if t == 0 {
            return Err(JepaError::shape_mismatch(
                "observations",
                "at least one timestep",
                format!("{:?}", observations.dims()),
            ));
        }
        let horizon = t - 1;
        if let Some(actions) = actions {
            if actions.dims() != [b, horizon, self.config.action_dim] {
                return Err(JepaError::shape_mismatch(
                    "actions",
                    format!("({b}, {horizon}, {})", self.config.action_dim),
                    format!("{:?}", actions.dims()),
                ));
            }
        } else if horizon > 0 {
            return Err(JepaError::shape_mismatch(
                "actions",
                format!("({b}, {horizon}, {})", self.config.action_dim),
                "none",
            ));
        }

        let d = self.config.state_dim;
        let encoded = self.online.forward_t(observations, train)?;
        let initial = encoded.narrow(1, 0, 1)?.squeeze(1)?;

        let steps = match actions {
            Some(actions) if horizon > 0 => self.predictor.rollout(&initial, actions)?,
            _ => Vec::new(),
        };

        let initial_flat = initial.reshape((b, 1, d))?;
        if steps.is_empty() {
            return Ok(Rollout {
                predicted: None,
                targets: None,
                all_states: initial_flat,
                steps,
            });
        }

        let flat_steps = steps
            .iter()
            .map(|s| s.reshape((b, d)))
            .collect::<candle_core::Result<Vec<_>>>()?;
        let predicted = Tensor::stack(&flat_steps, 1)?;

        let targets = match self.config.target_source {
            TargetSource::Online => encoded.narrow(1, 1, horizon)?.reshape((b, horizon, d))?,
            TargetSource::Target => {
                let future = observations.narrow(1, 1, horizon)?.contiguous()?;
                self.teacher
                    .encoder()
                    .forward_t(&future, train)?
                    .reshape((b, horizon, d))?
            }
        };

        let all_states = Tensor::cat(&[&initial_flat, &predicted], 1)?;
        Ok(Rollout {
            predicted: Some(predicted),
            targets: Some(targets),
            all_states,
            steps,
        })
    }

    /// Variables grouped by component, for checkpointing.
    pub(crate) fn components(&self) -> JepaResult<Vec<(&'static str, Vec<(String, Var)>)>> {
        Ok(vec![
            ("online_encoder", self.online.named_parameters()?),
            ("target_encoder", self.teacher.encoder().named_parameters()?),
            ("predictor", self.predictor_parameters()?),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn config(target_source: TargetSource) -> JepaConfig {
        JepaConfig {
            observation_height: 16,
            observation_width: 16,
            encoder_channels: vec![4, 8],
            state_dim: 32,
            latent_channels: 2,
            latent_height: 4,
            latent_width: 4,
            hidden_dim: 16,
            cnn_channels: 8,
            target_source,
            ..JepaConfig::default()
        }
    }

    #[test]
    fn forward_shapes_for_multi_step_trajectory() -> JepaResult<()> {
        let ctx = ExecutionContext::cpu();
        for source in [TargetSource::Online, TargetSource::Target] {
            let model = WorldModel::new(&config(source), &ctx)?;
            let obs = Tensor::randn(0f32, 1f32, (3, 4, 2, 16, 16), &Device::Cpu)?;
            let actions = Tensor::randn(0f32, 1f32, (3, 3, 2), &Device::Cpu)?;
            let rollout = model.forward(&obs, Some(&actions), true)?;

            assert_eq!(rollout.horizon(), 3);
            assert_eq!(rollout.predicted.as_ref().map(|p| p.dims().to_vec()), Some(vec![3, 3, 32]));
            assert_eq!(rollout.targets.as_ref().map(|p| p.dims().to_vec()), Some(vec![3, 3, 32]));
            assert_eq!(rollout.all_states.dims(), &[3, 4, 32]);
        }
        Ok(())
    }

    #[test]
    fn single_frame_is_inference_only() -> JepaResult<()> {
        let ctx = ExecutionContext::cpu();
        let model = WorldModel::new(&config(TargetSource::Online), &ctx)?;
        let obs = Tensor::randn(0f32, 1f32, (2, 1, 2, 16, 16), &Device::Cpu)?;
        let rollout = model.forward(&obs, None, false)?;

        assert_eq!(rollout.horizon(), 0);
        assert!(rollout.predicted.is_none());
        assert!(rollout.targets.is_none());
        assert_eq!(rollout.all_states.dims(), &[2, 1, 32]);
        Ok(())
    }

    #[test]
    fn first_state_is_the_encoded_first_frame() -> JepaResult<()> {
        let ctx = ExecutionContext::cpu();
        let model = WorldModel::new(&config(TargetSource::Online), &ctx)?;
        let obs = Tensor::randn(0f32, 1f32, (2, 3, 2, 16, 16), &Device::Cpu)?;
        let actions = Tensor::randn(0f32, 1f32, (2, 2, 2), &Device::Cpu)?;
        let rollout = model.forward(&obs, Some(&actions), false)?;

        let first = obs.narrow(1, 0, 1)?.squeeze(1)?.contiguous()?;
        let encoded = model.online_encoder().forward(&first)?.reshape((2, 32))?;
        let seed = rollout.all_states.narrow(1, 0, 1)?.squeeze(1)?;
        let diff = (encoded - seed)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()?;
        assert!(diff < 1e-5);
        Ok(())
    }

    #[test]
    fn malformed_inputs_fail_fast() -> JepaResult<()> {
        let ctx = ExecutionContext::cpu();
        let model = WorldModel::new(&config(TargetSource::Online), &ctx)?;
        let obs = Tensor::zeros((2, 3, 2, 16, 16), DType::F32, &Device::Cpu)?;

        let short = Tensor::zeros((2, 1, 2), DType::F32, &Device::Cpu)?;
        assert!(matches!(
            model.forward(&obs, Some(&short), true),
            Err(JepaError::ShapeMismatch { .. })
        ));
        let wide = Tensor::zeros((2, 2, 5), DType::F32, &Device::Cpu)?;
        assert!(model.forward(&obs, Some(&wide), true).is_err());
        assert!(model.forward(&obs, None, true).is_err());

        let frames = Tensor::zeros((2, 2, 16, 16), DType::F32, &Device::Cpu)?;
        assert!(model.forward(&frames, None, false).is_err());
        Ok(())
    }

    #[test]
    fn trainable_vars_exclude_target_encoder() -> JepaResult<()> {
        let ctx = ExecutionContext::cpu();
        let model = WorldModel::new(&config(TargetSource::Target), &ctx)?;
        let trainable: Vec<_> = model.trainable_vars().iter().map(|v| v.id()).collect();
        for (_, var) in model.target_encoder().named_parameters()? {
            assert!(!trainable.contains(&var.id()));
        }
        assert_eq!(
            trainable.len(),
            model.online_encoder().trainable_vars().len() + model.predictor_parameters()?.len()
        );
        Ok(())
    }
}
