pub mod npy;
pub mod trajectory;

pub use npy::{NpyArray, NpyDtype};
pub use trajectory::{TrajectoryBatch, TrajectoryDataset, TrajectoryLoader};
