use std::fs::File;
use std::io;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug)]
pub struct DeviceConfig {
    pub text_encoder: Device,
    pub vae_encoder: Device,
    pub vae_decoder: Device,
    pub unet: Device,
}

impl DeviceConfig {
    pub fn uniform(device: Device) -> Self {
        Self {
            text_encoder: device,
            vae_encoder: device,
            vae_decoder: device,
            unet: device,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DeviceId(i32);

impl DeviceId {
    pub fn new(id: i32) -> Self {
        Self(id)
    }
}

#[derive(Debug, Clone, Copy)]
#[non_exhaustive]
pub enum Device {
    Cpu,
    Cuda(DeviceId),
    TensorRt(DeviceId),
    DirectMl(DeviceId),
    RocM(DeviceId),
}

impl Device {
    pub(crate) fn execution_providers(self) -> [ort::ExecutionProvider; 1] {
        [self.into()]
    }
}

impl From<Device> for ort::ExecutionProvider {
    fn from(value: Device) -> Self {
        match value {
            Device::Cpu => ort::ExecutionProvider::cpu(),
            Device::Cuda(id) => ort::ExecutionProvider::cuda().with_device_id(id.0),
            Device::TensorRt(id) => ort::ExecutionProvider::tensorrt().with_device_id(id.0),
            Device::DirectMl(id) => ort::ExecutionProvider::directml().with_device_id(id.0),
            Device::RocM(id) => ort::ExecutionProvider::rocm().with_device_id(id.0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ModelConfig {
    pub num_train_timesteps: usize,
    pub beta_start: f64,
    pub beta_end: f64,
    /// Latents are divided by this before being handed to the VAE decoder.
    pub scale_factor: f32,
    pub latent_channels: usize,
    pub max_text_length: usize,
    pub prompt_template: String,
}

impl ModelConfig {
    pub const OBJECT_PLACEHOLDER: &'static str = "{object}";

    pub fn open(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let file = io::BufReader::new(File::open(path.as_ref())?);
        let config: Self = serde_json::from_reader(file)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_schedule(self.num_train_timesteps, self.beta_start, self.beta_end)?;
        if self.scale_factor <= 0. {
            return Err(ConfigError::Invalid("scale_factor must be positive".into()));
        }
        if self.latent_channels == 0 || self.max_text_length < 2 {
            return Err(ConfigError::Invalid(
                "latent_channels must be non-zero and max_text_length at least 2".into(),
            ));
        }
        if !self.prompt_template.contains(Self::OBJECT_PLACEHOLDER) {
            return Err(ConfigError::Invalid(format!(
                "prompt_template must contain {}",
                Self::OBJECT_PLACEHOLDER
            )));
        }
        Ok(())
    }

    pub fn instruction(&self, object: &str) -> String {
        self.prompt_template.replace(Self::OBJECT_PLACEHOLDER, object)
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            num_train_timesteps: 1000,
            beta_start: 0.00085,
            beta_end: 0.012,
            scale_factor: 0.18215,
            latent_channels: 4,
            max_text_length: 77,
            prompt_template: "add a {object}, image quality is five out of five".to_owned(),
        }
    }
}

pub(crate) fn validate_schedule(
    num_train_timesteps: usize,
    beta_start: f64,
    beta_end: f64,
) -> Result<(), ConfigError> {
    if num_train_timesteps < 2 {
        return Err(ConfigError::Invalid(
            "num_train_timesteps must be at least 2".into(),
        ));
    }
    if !(beta_start > 0. && beta_start < beta_end && beta_end < 1.) {
        return Err(ConfigError::Invalid(format!(
            "betas must satisfy 0 < beta_start < beta_end < 1, got {beta_start} and {beta_end}"
        )));
    }
    Ok(())
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("I/O error when reading the model config: {0}")]
    Io(#[from] io::Error),
    #[error("failed to parse model config JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid model config: {0}")]
    Invalid(String),
}
