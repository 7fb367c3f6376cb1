use ndarray::{Array3, Array4, ArrayView4};

use super::{ensure_shape, EditModel, PipelineError};

#[derive(Debug, Clone, PartialEq)]
pub struct Conditioning {
    pub text: Array3<f32>,
    pub image: Array4<f32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConditioningPair {
    pub cond: Conditioning,
    pub uncond: Conditioning,
}

impl ConditioningPair {
    pub fn build<M: EditModel>(
        model: &M,
        pixels: ArrayView4<'_, f32>,
        instruction: &str,
        null_text: &Array3<f32>,
    ) -> Result<Self, PipelineError> {
        let text = model.encode_text(instruction)?;
        let image = model.encode_image(pixels)?;
        let uncond = Conditioning {
            text: null_text.clone(),
            image: Array4::zeros(image.raw_dim()),
        };
        let pair = Self {
            cond: Conditioning { text, image },
            uncond,
        };
        pair.validate()?;
        Ok(pair)
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        ensure_shape("text embedding", self.cond.text.shape(), self.uncond.text.shape())?;
        ensure_shape("image latent", self.cond.image.shape(), self.uncond.image.shape())?;
        if self.cond.text.dim().0 != 1 || self.cond.image.dim().0 != 1 {
            return Err(PipelineError::ShapeMismatch {
                what: "conditioning batch",
                expected: vec![1],
                actual: vec![self.cond.text.dim().0, self.cond.image.dim().0],
            });
        }
        Ok(())
    }
}
