use std::time::Instant;

use image::RgbImage;
use ndarray::{Array3, Array4};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

use super::{ConditioningPair, EditModel, GuidanceScales, GuidedDenoiser, PipelineError};
use crate::imaging;
use crate::schedulers::{NoiseSchedule, Schedule, Scheduler};

#[derive(Debug, Clone, PartialEq)]
pub struct EditSettings {
    pub steps: usize,
    pub seed: u64,
    pub guidance: GuidanceScales,
}

impl EditSettings {
    pub fn with_steps(mut self, steps: usize) -> Self {
        self.steps = steps;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_text_guidance(mut self, scale: f32) -> Self {
        self.guidance.text = scale;
        self
    }

    pub fn with_image_guidance(mut self, scale: f32) -> Self {
        self.guidance.image = scale;
        self
    }
}

impl Default for EditSettings {
    fn default() -> Self {
        Self {
            steps: 100,
            seed: 0,
            guidance: GuidanceScales::default(),
        }
    }
}

#[derive(Debug)]
pub struct EditPipeline<'m, M> {
    model: &'m M,
    noise: NoiseSchedule,
    schedule: Schedule,
    null_text: Array3<f32>,
    settings: EditSettings,
}

impl<'m, M: EditModel> EditPipeline<'m, M> {
    pub fn new(
        model: &'m M,
        noise: NoiseSchedule,
        settings: EditSettings,
    ) -> Result<Self, PipelineError> {
        let schedule = noise.discretize(settings.steps);
        if schedule.is_empty() {
            return Err(PipelineError::EmptySchedule);
        }
        let null_text = model.encode_text("")?;
        Ok(Self {
            model,
            noise,
            schedule,
            null_text,
            settings,
        })
    }

    pub fn execute(
        &self,
        scheduler: &mut impl Scheduler,
        background: &RgbImage,
        instruction: &str,
    ) -> Result<RgbImage, PipelineError> {
        let pixels = imaging::image_to_tensor(background)?;
        let conditioning =
            ConditioningPair::build(self.model, pixels.view(), instruction, &self.null_text)?;

        let latent = self.sample(scheduler, &conditioning)?;
        let decoded = self.model.decode_latents(latent.view())?;
        Ok(imaging::tensor_to_image(decoded.view())?)
    }

    /// Every call reseeds the generator, so each edit starts from the same noise.
    pub fn sample(
        &self,
        scheduler: &mut impl Scheduler,
        conditioning: &ConditioningPair,
    ) -> Result<Array4<f32>, PipelineError> {
        let mut rng = StdRng::seed_from_u64(self.settings.seed);
        let denoiser = GuidedDenoiser::new(self.model, &self.noise);

        let mut latent = Array4::<f32>::from_shape_simple_fn(
            conditioning.cond.image.raw_dim(),
            || rng.sample(StandardNormal),
        ) * self.schedule.initial_sigma();

        let now = Instant::now();
        for (i, &sigma) in self.schedule.sigmas[..self.schedule.len()].iter().enumerate() {
            tracing::trace!(
                step = i,
                steps = self.schedule.len(),
                sigma,
                elapsed = now.elapsed().as_secs_f32(),
                "denoising step"
            );

            let denoised =
                denoiser.denoise(latent.view(), sigma, conditioning, self.settings.guidance)?;
            latent = scheduler.step(i, &self.schedule, latent.view(), denoised.view(), &mut rng);
        }

        Ok(latent)
    }
}
