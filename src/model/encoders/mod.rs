pub mod ema;
pub mod encoder;
mod shared;

pub use ema::{copy_parameters, ema_update, EmaTeacher};
pub use encoder::{Encoder, EncoderRole, RunningStatistics};
