use candle_core::Var;
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use tracing::{debug, info};

use super::accumulator::GradientAccumulator;
use crate::config::JepaConfig;
use crate::context::ExecutionContext;
use crate::data::TrajectoryBatch;
use crate::error::{JepaError, JepaResult};
use crate::loss::{LossAssembly, LossTerms, LossValues};
use crate::model::WorldModel;

/// Micro-steps per optimizer step for `epoch`: shrinks linearly from
/// `initial` towards `final_steps`, never below it (or below 1).
pub fn accumulation_steps_for_epoch(epoch: usize, total_epochs: usize, initial: usize, final_steps: usize) -> usize {
    if total_epochs == 0 {
        return initial.max(1);
    }
    let (initial, final_steps) = (initial as i64, final_steps as i64);
    let decay = ((initial - final_steps) * epoch as i64).div_euclid(total_epochs as i64);
    final_steps.max(initial - decay).max(1) as usize
}

/// Per-epoch cosine annealing from `base` at epoch 0 to `min` at `total_epochs`.
pub fn cosine_learning_rate(epoch: usize, total_epochs: usize, base: f64, min: f64) -> f64 {
    if total_epochs == 0 {
        return base;
    }
    let progress = (epoch as f64 / total_epochs as f64).clamp(0.0, 1.0);
    min + 0.5 * (base - min) * (1.0 + (std::f64::consts::PI * progress).cos())
}

/// Outcome of one [`Trainer::train_step`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepReport {
    pub step: u64,
    /// `None` for single-frame batches, which carry no loss.
    pub loss: Option<LossValues>,
    pub optimizer_stepped: bool,
    /// Pre-clip gradient norm, set when the optimizer stepped.
    pub grad_norm: Option<f64>,
}

/// Owns the world model and drives accumulated AdamW steps over the online
/// encoder and predictor, followed by the EMA target update.
pub struct Trainer {
    model: WorldModel,
    ctx: ExecutionContext,
    vars: Vec<Var>,
    optimizer: AdamW,
    accumulator: GradientAccumulator,
    loss: LossAssembly,
    epoch: usize,
    total_epochs: usize,
    micro_steps: u64,
    optimizer_steps: u64,
}

impl Trainer {
    pub fn new(model: WorldModel, ctx: &ExecutionContext) -> JepaResult<Self> {
        let config = model.config().clone();
        let vars = model.trainable_vars();
        let params = ParamsAdamW {
            lr: config.learning_rate,
            beta1: config.beta1,
            beta2: config.beta2,
            eps: config.eps,
            weight_decay: config.weight_decay,
        };
        let optimizer = AdamW::new(vars.clone(), params)?;
        info!(
            parameters = model.parameter_count(),
            tensors = vars.len(),
            lr = config.learning_rate,
            "optimizer ready"
        );
        let mut trainer = Self {
            model,
            ctx: ctx.clone(),
            vars,
            optimizer,
            accumulator: GradientAccumulator::new(config.initial_accumulation_steps),
            loss: LossAssembly::new(&config),
            epoch: 0,
            total_epochs: config.epochs.max(1),
            micro_steps: 0,
            optimizer_steps: 0,
        };
        trainer.begin_epoch(0);
        Ok(trainer)
    }

    pub fn model(&self) -> &WorldModel {
        &self.model
    }

    pub fn into_model(self) -> WorldModel {
        self.model
    }

    fn config(&self) -> &JepaConfig {
        self.model.config()
    }

    pub fn epoch(&self) -> usize {
        self.epoch
    }

    pub fn micro_steps(&self) -> u64 {
        self.micro_steps
    }

    pub fn optimizer_steps(&self) -> u64 {
        self.optimizer_steps
    }

    pub fn learning_rate(&self) -> f64 {
        self.optimizer.learning_rate()
    }

    pub fn accumulation_steps(&self) -> usize {
        self.accumulator.steps()
    }

    /// Set the epoch's accumulation window and learning rate. Gradients left
    /// from an unfinished window are discarded.
    pub fn begin_epoch(&mut self, epoch: usize) {
        if self.accumulator.pending() > 0 {
            debug!(
                pending = self.accumulator.pending(),
                "discarding partial accumulation window"
            );
        }
        self.accumulator.clear();

        let config = self.config();
        let steps = accumulation_steps_for_epoch(
            epoch,
            self.total_epochs,
            config.initial_accumulation_steps,
            config.final_accumulation_steps,
        );
        let base = config.learning_rate;
        let lr = cosine_learning_rate(epoch, self.total_epochs, base, base * config.min_learning_rate_ratio);

        self.epoch = epoch;
        self.accumulator.set_steps(steps);
        self.optimizer.set_learning_rate(lr);
        debug!(epoch, accumulation_steps = steps, lr, "epoch configured");
    }

    /// Forward, loss and backward for one batch; steps the optimizer and the
    /// EMA target when the accumulation window fills.
    ///
    /// A NaN or infinite loss is returned as [`JepaError::NonFiniteLoss`]
    /// before any gradient is accumulated, with the online encoder's running
    /// statistics put back to their values before the forward pass.
    pub fn train_step(&mut self, batch: &TrajectoryBatch) -> JepaResult<StepReport> {
        self.micro_steps += 1;
        let step = self.micro_steps;

        let running = self.model.online_encoder().running_statistics()?;
        let (terms, values) = match self.forward_loss(batch, step) {
            Ok(Some(loss)) => loss,
            Ok(None) => {
                return Ok(StepReport {
                    step,
                    loss: None,
                    optimizer_stepped: false,
                    grad_norm: None,
                })
            }
            Err(e) => {
                running.restore()?;
                return Err(e);
            }
        };

        let grads = terms.total.backward()?;
        self.accumulator.accumulate(grads, &self.vars)?;

        let max_norm = self.config().max_grad_norm;
        let max_norm = (max_norm > 0.0).then_some(max_norm);
        let grad_norm = self
            .accumulator
            .apply_and_reset(&mut self.optimizer, &self.vars, max_norm)?;
        if grad_norm.is_some() {
            self.optimizer_steps += 1;
            self.model.update_target()?;
        }

        let log_every = self.config().log_every as u64;
        if log_every > 0 && step % log_every == 0 {
            info!(
                step,
                epoch = self.epoch,
                loss = values.total,
                regression = values.regression,
                contrastive = values.contrastive,
                variance = values.variance,
                covariance = values.covariance,
                "train step"
            );
        }

        Ok(StepReport {
            step,
            loss: Some(values),
            optimizer_stepped: grad_norm.is_some(),
            grad_norm,
        })
    }

    fn forward_loss(&self, batch: &TrajectoryBatch, step: u64) -> JepaResult<Option<(LossTerms, LossValues)>> {
        let rollout = self.model.forward(batch.observations(), Some(batch.actions()), true)?;
        let Some(terms) = self.loss.compute(&rollout, self.epoch, self.total_epochs, &self.ctx)? else {
            return Ok(None);
        };
        let values = terms.values()?;
        if !values.total.is_finite() {
            return Err(JepaError::NonFiniteLoss {
                step,
                value: values.total,
            });
        }
        Ok(Some((terms, values)))
    }
}
