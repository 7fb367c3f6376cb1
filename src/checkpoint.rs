use std::path::{Path, PathBuf};
use std::sync::Arc;

use ndarray::prelude::*;
use ndarray::{concatenate, Dimension};
use ort::tensor::{DynOrtTensor, FromArray, InputTensor, OrtOwnedTensor};
use ort::OrtError;
use thiserror::Error;

use crate::config::{Device, DeviceConfig, ModelConfig};
use crate::pipelines::{EditModel, PipelineError, PipelineMode, Stage};
use crate::tokenizers::clip::{ClipTokenizer, TokenizerError};

/// `vae_dir` replaces the encoder and decoder of `model_dir` when set.
#[derive(Debug, Clone)]
pub struct CheckpointPaths {
    pub model_dir: PathBuf,
    pub vae_dir: Option<PathBuf>,
}

impl CheckpointPaths {
    pub fn new(model_dir: impl Into<PathBuf>) -> Self {
        Self {
            model_dir: model_dir.into(),
            vae_dir: None,
        }
    }

    pub fn with_vae(mut self, vae_dir: impl Into<PathBuf>) -> Self {
        self.vae_dir = Some(vae_dir.into());
        self
    }

    fn vae_dir(&self) -> &Path {
        self.vae_dir.as_deref().unwrap_or(&self.model_dir)
    }
}

#[derive(Debug)]
pub struct Checkpoint<Mode> {
    clip: ClipTokenizer,
    vae_encoder: ort::Session,
    vae_decoder: ort::Session,
    text_encoder: ort::Session,
    unet: ort::Session,
    scale_factor: f32,
    latent_channels: usize,
    _mode: Mode,
}

impl<Mode: PipelineMode> Checkpoint<Mode> {
    const TEXT_ENCODER_INPUTS: &'static [&'static str] = &["input_ids"];
    const VAE_ENCODER_INPUTS: &'static [&'static str] = &["sample"];
    const VAE_DECODER_INPUTS: &'static [&'static str] = &["latent_sample"];
    const UNET_INPUTS: &'static [&'static str] = &["sample", "timestep", "encoder_hidden_states"];

    pub fn load(
        env: Arc<ort::Environment>,
        devices: &DeviceConfig,
        paths: &CheckpointPaths,
        config: &ModelConfig,
    ) -> Result<Self, CheckpointLoadError> {
        tracing::info!(checkpoint = %paths.model_dir.display(), "loading checkpoint");
        if let Some(vae_dir) = &paths.vae_dir {
            tracing::info!(vae = %vae_dir.display(), "loading replacement VAE");
        }

        let clip =
            ClipTokenizer::open(paths.model_dir.join("tokenizer"), config.max_text_length)?;
        let text_encoder = load_session(
            &env,
            devices.text_encoder,
            &paths.model_dir.join("text_encoder"),
            Self::TEXT_ENCODER_INPUTS,
        )?;
        let vae_encoder = load_session(
            &env,
            devices.vae_encoder,
            &paths.vae_dir().join("vae_encoder"),
            Self::VAE_ENCODER_INPUTS,
        )?;
        let vae_decoder = load_session(
            &env,
            devices.vae_decoder,
            &paths.vae_dir().join("vae_decoder"),
            Self::VAE_DECODER_INPUTS,
        )?;
        let unet = load_session(
            &env,
            devices.unet,
            &paths.model_dir.join("unet"),
            Self::UNET_INPUTS,
        )?;

        Ok(Self {
            clip,
            vae_encoder,
            vae_decoder,
            text_encoder,
            unet,
            scale_factor: config.scale_factor,
            latent_channels: config.latent_channels,
            _mode: Mode::default(),
        })
    }

    fn extract<D: Dimension>(
        outputs: &[DynOrtTensor<'_, IxDyn>],
        stage: Stage,
    ) -> Result<Array<f32, D>, PipelineError> {
        let Some(output) = outputs.first() else {
            return Err(PipelineError::OutputError(stage));
        };
        let output: OrtOwnedTensor<'_, Mode::Float, IxDyn> = output.try_extract()?;
        let view = output.view().clone().into_dimensionality::<D>()?;
        Ok(Mode::into_f32_array(view.into()).into_owned())
    }
}

impl<Mode: PipelineMode> EditModel for Checkpoint<Mode> {
    fn encode_text(&self, text: &str) -> Result<Array3<f32>, PipelineError> {
        let tokens = self.clip.encode(text)?;
        let array = Array2::from_shape_vec((1, tokens.len()), tokens)?;
        let result = self
            .text_encoder
            .run([InputTensor::from_array(array.into_dyn())])?;
        Self::extract(&result, Stage::Text)
    }

    fn encode_image(&self, pixels: ArrayView4<'_, f32>) -> Result<Array4<f32>, PipelineError> {
        let result = self
            .vae_encoder
            .run([Mode::create_tensor(pixels.into())])?;
        let moments: Array4<f32> = Self::extract(&result, Stage::VaeEncode)?;
        // Exports that return the posterior parameters stack mean and log-variance.
        if moments.dim().1 == 2 * self.latent_channels {
            Ok(moments
                .slice(s![.., ..self.latent_channels, .., ..])
                .to_owned())
        } else {
            Ok(moments)
        }
    }

    fn predict_noise(
        &self,
        latent: ArrayView4<'_, f32>,
        timesteps: ArrayView1<'_, f32>,
        text: ArrayView3<'_, f32>,
        image: ArrayView4<'_, f32>,
    ) -> Result<Array4<f32>, PipelineError> {
        let sample = concatenate(Axis(1), &[latent.view(), image.view()])?;
        let result = self.unet.run([
            Mode::create_tensor(sample.into()),
            Mode::create_tensor(timesteps.into()),
            Mode::create_tensor(text.into()),
        ])?;
        Self::extract(&result, Stage::Unet)
    }

    fn decode_latents(&self, latent: ArrayView4<'_, f32>) -> Result<Array4<f32>, PipelineError> {
        let latent = &latent / self.scale_factor;
        let result = self
            .vae_decoder
            .run([Mode::create_tensor(latent.into())])?;
        Self::extract(&result, Stage::VaeDecode)
    }
}

fn load_session(
    env: &Arc<ort::Environment>,
    device: Device,
    dir: &Path,
    expected_inputs: &[&str],
) -> Result<ort::Session, CheckpointLoadError> {
    let path = dir.join("model.onnx");
    if !path.is_file() {
        return Err(CheckpointLoadError::MissingModel(path));
    }
    let session = ort::SessionBuilder::new(env)?
        .with_execution_providers(device.execution_providers())?
        .with_optimization_level(ort::GraphOptimizationLevel::Level3)?
        .with_model_from_file(&path)?;

    let declared: Vec<&str> = session.inputs.iter().map(|input| input.name.as_str()).collect();
    let (missing, unexpected) = input_mismatch(&declared, expected_inputs);
    if !missing.is_empty() {
        tracing::warn!(model = %path.display(), ?missing, "missing inputs");
    }
    if !unexpected.is_empty() {
        tracing::warn!(model = %path.display(), ?unexpected, "unexpected inputs");
    }
    tracing::debug!(model = %path.display(), ?device, "loaded session");

    Ok(session)
}

// (missing, unexpected)
fn input_mismatch<'a>(declared: &[&'a str], expected: &[&'a str]) -> (Vec<&'a str>, Vec<&'a str>) {
    let missing = expected
        .iter()
        .filter(|name| !declared.contains(*name))
        .copied()
        .collect();
    let unexpected = declared
        .iter()
        .filter(|name| !expected.contains(*name))
        .copied()
        .collect();
    (missing, unexpected)
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CheckpointLoadError {
    #[error("ORT error: {0}")]
    Ort(#[from] OrtError),
    #[error("{0}")]
    Tokenizer(#[from] TokenizerError),
    #[error("missing ONNX model {0}")]
    MissingModel(PathBuf),
}
