pub mod accumulator;
pub mod checkpoint;
#[allow(clippy::module_inception)]
pub mod trainer;

pub use accumulator::GradientAccumulator;
pub use checkpoint::{load_snapshot, CheckpointSink, ModelSnapshot, SafetensorsSink};
pub use trainer::{accumulation_steps_for_epoch, cosine_learning_rate, StepReport, Trainer};
