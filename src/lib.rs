//! Recurrent JEPA world model on candle.
//!
//! An online [`Encoder`] maps observation frames to latent grids, a
//! [`RecurrentPredictor`] rolls those latents forward under actions, and an
//! [`EmaTeacher`] keeps a slowly-moving copy of the encoder. Training
//! combines scheduled latent regression, contrastive alignment and
//! variance/covariance regularization ([`loss`]), driven with gradient
//! accumulation by [`Trainer`].

pub mod config;
pub mod context;
pub mod data;
pub mod error;
pub mod format;
pub mod loss;
pub mod model;
pub mod tasks;
pub mod trainer;

pub use config::{JepaConfig, ScheduleMode, TargetSource};
pub use context::ExecutionContext;
pub use data::{TrajectoryBatch, TrajectoryDataset, TrajectoryLoader};
pub use error::{JepaError, JepaResult};
pub use loss::{LossAssembly, LossTerms, LossValues};
pub use model::{EmaTeacher, Encoder, EncoderRole, Prober, RecurrentPredictor, Rollout, WorldModel};
pub use trainer::{CheckpointSink, GradientAccumulator, ModelSnapshot, SafetensorsSink, StepReport, Trainer};
