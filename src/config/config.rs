use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{JepaError, JepaResult};

/// How per-timestep regression weights evolve over training.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", try_from = "String")]
pub enum ScheduleMode {
    Linear,
    Exponential,
}

impl FromStr for ScheduleMode {
    type Err = JepaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "linear" => Ok(Self::Linear),
            "exponential" => Ok(Self::Exponential),
            other => Err(JepaError::UnknownScheduleMode(other.to_string())),
        }
    }
}

impl TryFrom<String> for ScheduleMode {
    type Error = JepaError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl fmt::Display for ScheduleMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Linear => f.write_str("linear"),
            Self::Exponential => f.write_str("exponential"),
        }
    }
}

/// Which encoder produces the regression targets for timesteps 1..T-1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetSource {
    /// The online encoder's own latents (self-target regression).
    Online,
    /// The EMA teacher's latents, detached from the graph.
    Target,
}

impl FromStr for TargetSource {
    type Err = JepaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "online" => Ok(Self::Online),
            "target" => Ok(Self::Target),
            other => Err(JepaError::invalid_config(format!(
                "unknown target source {other:?} (expected \"online\" or \"target\")"
            ))),
        }
    }
}

/// Model and training hyper-parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JepaConfig {
    /// Channels per observation frame
    pub in_channels: usize,
    pub observation_height: usize,
    pub observation_width: usize,
    /// Output channels of each stride-2 downsampling stage
    pub encoder_channels: Vec<usize>,
    /// Flattened latent size; must equal channels * height * width
    pub state_dim: usize,
    pub latent_channels: usize,
    pub latent_height: usize,
    pub latent_width: usize,
    pub action_dim: usize,
    /// Width of the action embedding MLP
    pub hidden_dim: usize,
    /// Width of the predictor's convolutional refinement stack
    pub cnn_channels: usize,
    /// BatchNorm in the encoder and LayerNorm in the predictor
    pub normalization: bool,
    pub ema_rate: f64,
    pub target_source: TargetSource,
    pub schedule_mode: ScheduleMode,
    /// Apply the per-timestep weighting schedule to the regression term
    pub use_schedule: bool,
    pub temperature: f64,
    pub variance_floor: f64,
    pub variance_weight: f64,
    pub covariance_weight: f64,
    pub learning_rate: f64,
    /// Cosine annealing floor as a fraction of `learning_rate`; 1.0 keeps LR flat
    pub min_learning_rate_ratio: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    pub weight_decay: f64,
    pub max_grad_norm: f64,
    pub epochs: usize,
    pub batch_size: usize,
    pub initial_accumulation_steps: usize,
    pub final_accumulation_steps: usize,
    pub log_every: usize,
    pub seed: u64,
}

impl Default for JepaConfig {
    fn default() -> Self {
        Self {
            in_channels: 2,
            observation_height: 64,
            observation_width: 64,
            encoder_channels: vec![32, 64, 128, 256],
            state_dim: 256,
            latent_channels: 16,
            latent_height: 4,
            latent_width: 4,
            action_dim: 2,
            hidden_dim: 128,
            cnn_channels: 64,
            normalization: true,
            ema_rate: 0.99,
            target_source: TargetSource::Online,
            schedule_mode: ScheduleMode::Linear,
            use_schedule: true,
            temperature: 0.1,
            variance_floor: 1e-4,
            variance_weight: 0.01,
            covariance_weight: 0.01,
            learning_rate: 6e-4,
            min_learning_rate_ratio: 1.0,
            beta1: 0.9,
            beta2: 0.99,
            eps: 1e-8,
            weight_decay: 0.01,
            max_grad_norm: 1.0,
            epochs: 20,
            batch_size: 64,
            initial_accumulation_steps: 4,
            final_accumulation_steps: 4,
            log_every: 100,
            seed: 42,
        }
    }
}

impl JepaConfig {
    /// Three-stage encoder onto a 2x8x8 latent grid, no normalization layers,
    /// unweighted regression and cosine LR decay to 10%.
    pub fn compact() -> Self {
        Self {
            encoder_channels: vec![32, 64, 128],
            state_dim: 128,
            latent_channels: 2,
            latent_height: 8,
            latent_width: 8,
            normalization: false,
            use_schedule: false,
            learning_rate: 3e-4,
            min_learning_rate_ratio: 0.1,
            beta2: 0.95,
            epochs: 10,
            batch_size: 8,
            ..Self::default()
        }
    }

    /// Latent grid as (channels, height, width).
    pub fn latent_shape(&self) -> (usize, usize, usize) {
        (self.latent_channels, self.latent_height, self.latent_width)
    }

    /// Spatial size of the last encoder feature map.
    pub fn encoder_feature_size(&self) -> (usize, usize) {
        let factor = 1usize << self.encoder_channels.len();
        (
            self.observation_height / factor,
            self.observation_width / factor,
        )
    }

    /// Check the architecture fields: latent grid, encoder stages, widths and
    /// the EMA rate. Enough to build a model for inference.
    pub fn validate_model(&self) -> JepaResult<()> {
        let (c, h, w) = self.latent_shape();
        if c == 0 || h == 0 || w == 0 {
            return Err(JepaError::invalid_config("latent grid dimensions must be non-zero"));
        }
        if self.state_dim != c * h * w {
            return Err(JepaError::invalid_config(format!(
                "state_dim {} != latent_channels*latent_height*latent_width = {}",
                self.state_dim,
                c * h * w
            )));
        }
        if self.in_channels == 0 || self.action_dim == 0 {
            return Err(JepaError::invalid_config("in_channels and action_dim must be non-zero"));
        }
        if self.encoder_channels.is_empty() || self.encoder_channels.contains(&0) {
            return Err(JepaError::invalid_config(
                "encoder_channels must list at least one non-zero stage",
            ));
        }
        let factor = 1usize << self.encoder_channels.len();
        if self.observation_height % factor != 0
            || self.observation_width % factor != 0
            || self.observation_height < factor
            || self.observation_width < factor
        {
            return Err(JepaError::invalid_config(format!(
                "observation {}x{} is not divisible by 2^{} encoder stages",
                self.observation_height,
                self.observation_width,
                self.encoder_channels.len()
            )));
        }
        if self.hidden_dim == 0 || self.cnn_channels == 0 {
            return Err(JepaError::invalid_config("hidden_dim and cnn_channels must be non-zero"));
        }
        if !(0.0..=1.0).contains(&self.ema_rate) {
            return Err(JepaError::invalid_config(format!(
                "ema_rate must lie in [0, 1], got {}",
                self.ema_rate
            )));
        }
        Ok(())
    }

    /// [`validate_model`](Self::validate_model) plus the loss, optimizer and
    /// loop settings a training run needs.
    pub fn validate(&self) -> JepaResult<()> {
        self.validate_model()?;
        if self.temperature <= 0.0 {
            return Err(JepaError::invalid_config("temperature must be positive"));
        }
        if self.variance_floor < 0.0 || self.variance_weight < 0.0 || self.covariance_weight < 0.0 {
            return Err(JepaError::invalid_config(
                "variance_floor and regularizer weights must be non-negative",
            ));
        }
        if self.learning_rate <= 0.0 || !(0.0..=1.0).contains(&self.min_learning_rate_ratio) {
            return Err(JepaError::invalid_config(
                "learning_rate must be positive and min_learning_rate_ratio in [0, 1]",
            ));
        }
        if self.max_grad_norm <= 0.0 {
            return Err(JepaError::invalid_config("max_grad_norm must be positive"));
        }
        if self.epochs == 0 || self.batch_size == 0 {
            return Err(JepaError::invalid_config("epochs and batch_size must be non-zero"));
        }
        if self.initial_accumulation_steps == 0 || self.final_accumulation_steps == 0 {
            return Err(JepaError::invalid_config("accumulation steps must be non-zero"));
        }
        Ok(())
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> JepaResult<Self> {
        let text = fs::read_to_string(path.as_ref())?;
        let value: serde_json::Value = serde_json::from_str(&text)?;
        if let Some(mode) = value.get("schedule_mode").and_then(serde_json::Value::as_str) {
            mode.parse::<ScheduleMode>()?;
        }
        let config: Self = serde_json::from_value(value)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json_pretty(&self) -> JepaResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
