use std::fmt;

use half::f16;
use ndarray::{Array3, Array4, ArrayView1, ArrayView3, ArrayView4, CowArray, Dimension};
use ort::tensor::{InputTensor, TensorDataToType};
use ort::OrtError;
use thiserror::Error;

use crate::imaging::ImagingError;
use crate::tokenizers::clip::TokenizerError;

mod conditioning;
mod edit;
mod guidance;

pub use conditioning::{Conditioning, ConditioningPair};
pub use edit::{EditPipeline, EditSettings};
pub use guidance::{combine_guidance, GuidanceScales, GuidedDenoiser};

/// Latents are `[batch, channels, height / 8, width / 8]` and pixels are
/// `[batch, 3, height, width]` in `[-1, 1]`.
pub trait EditModel {
    fn encode_text(&self, text: &str) -> Result<Array3<f32>, PipelineError>;

    /// Encodes pixels to the mode of the first stage posterior, without latent scaling.
    fn encode_image(&self, pixels: ArrayView4<'_, f32>) -> Result<Array4<f32>, PipelineError>;

    /// `image` is concatenated to `latent` along the channel axis.
    fn predict_noise(
        &self,
        latent: ArrayView4<'_, f32>,
        timesteps: ArrayView1<'_, f32>,
        text: ArrayView3<'_, f32>,
        image: ArrayView4<'_, f32>,
    ) -> Result<Array4<f32>, PipelineError>;

    fn decode_latents(&self, latent: ArrayView4<'_, f32>) -> Result<Array4<f32>, PipelineError>;
}

impl<M: EditModel + ?Sized> EditModel for &M {
    fn encode_text(&self, text: &str) -> Result<Array3<f32>, PipelineError> {
        (**self).encode_text(text)
    }

    fn encode_image(&self, pixels: ArrayView4<'_, f32>) -> Result<Array4<f32>, PipelineError> {
        (**self).encode_image(pixels)
    }

    fn predict_noise(
        &self,
        latent: ArrayView4<'_, f32>,
        timesteps: ArrayView1<'_, f32>,
        text: ArrayView3<'_, f32>,
        image: ArrayView4<'_, f32>,
    ) -> Result<Array4<f32>, PipelineError> {
        (**self).predict_noise(latent, timesteps, text, image)
    }

    fn decode_latents(&self, latent: ArrayView4<'_, f32>) -> Result<Array4<f32>, PipelineError> {
        (**self).decode_latents(latent)
    }
}

pub trait PipelineMode: Default {
    type Float: Copy + Default + fmt::Debug + Into<f32> + TensorDataToType + 'static;

    fn from_f32_array<D: Dimension>(array: CowArray<'_, f32, D>) -> CowArray<'_, Self::Float, D>;
    fn into_f32_array<D: Dimension>(array: CowArray<'_, Self::Float, D>) -> CowArray<'_, f32, D>;
    fn create_tensor<D: Dimension>(cow: CowArray<'_, f32, D>) -> InputTensor;
}

#[derive(Debug, Default)]
pub struct Fp32Mode;

impl PipelineMode for Fp32Mode {
    type Float = f32;

    #[inline]
    fn from_f32_array<D: Dimension>(array: CowArray<'_, f32, D>) -> CowArray<'_, Self::Float, D> {
        array
    }

    #[inline]
    fn into_f32_array<D: Dimension>(array: CowArray<'_, Self::Float, D>) -> CowArray<'_, f32, D> {
        array
    }

    #[inline]
    fn create_tensor<D: Dimension>(cow: CowArray<'_, f32, D>) -> InputTensor {
        InputTensor::FloatTensor(cow.as_standard_layout().into_owned().into_dyn())
    }
}

#[derive(Debug, Default)]
pub struct Fp16Mode;

impl PipelineMode for Fp16Mode {
    type Float = f16;

    fn from_f32_array<D: Dimension>(array: CowArray<'_, f32, D>) -> CowArray<'_, Self::Float, D> {
        array.map(|&x| f16::from_f32(x)).into()
    }

    fn into_f32_array<D: Dimension>(array: CowArray<'_, Self::Float, D>) -> CowArray<'_, f32, D> {
        array.map(|&x| x.into()).into()
    }

    fn create_tensor<D: Dimension>(cow: CowArray<'_, f32, D>) -> InputTensor {
        InputTensor::Float16Tensor(Self::from_f32_array(cow).into_owned().into_dyn())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Text,
    VaeEncode,
    VaeDecode,
    Unet,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text => write!(f, "text encoder"),
            Self::VaeEncode => write!(f, "vae encoder"),
            Self::VaeDecode => write!(f, "vae decoder"),
            Self::Unet => write!(f, "unet"),
        }
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PipelineError {
    #[error("ORT error: {0}")]
    Ort(#[from] OrtError),
    #[error("unexpected tensor shape: {0}")]
    ShapeError(#[from] ndarray::ShapeError),
    #[error("shape mismatch in {what}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        what: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    #[error("unexpected output error in {0}")]
    OutputError(Stage),
    #[error("{0}")]
    Tokenizer(#[from] TokenizerError),
    #[error("{0}")]
    Imaging(#[from] ImagingError),
    #[error("the schedule has no steps")]
    EmptySchedule,
}

pub(crate) fn ensure_shape(
    what: &'static str,
    expected: &[usize],
    actual: &[usize],
) -> Result<(), PipelineError> {
    if expected == actual {
        Ok(())
    } else {
        Err(PipelineError::ShapeMismatch {
            what,
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        })
    }
}
