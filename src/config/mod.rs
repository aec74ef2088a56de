#[allow(clippy::module_inception)]
pub mod config;

pub use config::{JepaConfig, ScheduleMode, TargetSource};
