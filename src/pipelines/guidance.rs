use ndarray::{concatenate, s, Array1, Array4, ArrayView4, Axis};

use super::{ensure_shape, ConditioningPair, EditModel, PipelineError};
use crate::schedulers::NoiseSchedule;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GuidanceScales {
    pub text: f32,
    pub image: f32,
}

impl Default for GuidanceScales {
    fn default() -> Self {
        Self {
            text: 7.5,
            image: 1.5,
        }
    }
}

/// `uncond + text * (cond - image_cond) + image * (image_cond - uncond)`
pub fn combine_guidance(
    out_cond: ArrayView4<'_, f32>,
    out_img_cond: ArrayView4<'_, f32>,
    out_uncond: ArrayView4<'_, f32>,
    scales: GuidanceScales,
) -> Array4<f32> {
    (&out_cond - &out_img_cond) * scales.text
        + (&out_img_cond - &out_uncond) * scales.image
        + &out_uncond
}

#[derive(Debug)]
pub struct GuidedDenoiser<'a, M> {
    model: &'a M,
    noise: &'a NoiseSchedule,
}

impl<'a, M: EditModel> GuidedDenoiser<'a, M> {
    const BRANCHES: usize = 3;

    pub fn new(model: &'a M, noise: &'a NoiseSchedule) -> Self {
        Self { model, noise }
    }

    /// Branches are batched as (instruction, image), (null, image), (null, null).
    pub fn denoise(
        &self,
        latent: ArrayView4<'_, f32>,
        sigma: f32,
        conditioning: &ConditioningPair,
        scales: GuidanceScales,
    ) -> Result<Array4<f32>, PipelineError> {
        let ConditioningPair { cond, uncond } = conditioning;
        ensure_shape("latent", cond.image.shape(), latent.shape())?;

        let batch_latent = concatenate(Axis(0), &[latent, latent, latent])?;
        let text = concatenate(
            Axis(0),
            &[cond.text.view(), uncond.text.view(), uncond.text.view()],
        )?;
        let image = concatenate(
            Axis(0),
            &[cond.image.view(), cond.image.view(), uncond.image.view()],
        )?;

        let timesteps = Array1::from_elem(Self::BRANCHES, self.noise.sigma_to_t(sigma));
        let scaled = &batch_latent * NoiseSchedule::input_scale(sigma);
        let eps = self
            .model
            .predict_noise(scaled.view(), timesteps.view(), text.view(), image.view())?;
        ensure_shape("noise prediction", batch_latent.shape(), eps.shape())?;

        let denoised = &batch_latent - &(eps * sigma);
        Ok(combine_guidance(
            denoised.slice(s![0..1, .., .., ..]),
            denoised.slice(s![1..2, .., .., ..]),
            denoised.slice(s![2..3, .., .., ..]),
            scales,
        ))
    }
}
