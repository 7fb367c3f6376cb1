pub mod batch;
mod checkpoint;
mod config;
pub mod imaging;
pub mod jobs;
pub mod pipelines;
pub mod schedulers;
pub mod tokenizers;

pub use checkpoint::{Checkpoint, CheckpointLoadError, CheckpointPaths};
pub use config::{ConfigError, Device, DeviceConfig, DeviceId, ModelConfig};
pub use ort;
