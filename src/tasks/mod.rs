pub mod train;

pub use train::{run as run_training, TrainOptions, TrainSummary};
