pub mod encoders;
pub mod predictor;
pub mod prober;
pub mod world_model;

pub use encoders::{copy_parameters, ema_update, EmaTeacher, Encoder, EncoderRole, RunningStatistics};
pub use predictor::RecurrentPredictor;
pub use prober::Prober;
pub use world_model::{Rollout, WorldModel};
