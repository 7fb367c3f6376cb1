use ndarray::{Array4, ArrayView4};
use rand::Rng;

mod euler;
mod euler_ancestral;
mod noise;

pub use euler::Euler;
pub use euler_ancestral::EulerAncestral;
pub use noise::NoiseSchedule;

/// Advances a latent from `sigmas[step]` to `sigmas[step + 1]`.
pub trait Scheduler {
    fn step(
        &mut self,
        step: usize,
        schedule: &Schedule,
        sample: ArrayView4<'_, f32>,
        denoised: ArrayView4<'_, f32>,
        rng: &mut impl Rng,
    ) -> Array4<f32>;
}

/// `sigmas` ends with a trailing zero.
#[derive(Debug, Clone, PartialEq)]
pub struct Schedule {
    pub sigmas: Vec<f32>,
    pub timesteps: Vec<f32>,
}

impl Schedule {
    pub fn len(&self) -> usize {
        self.sigmas.len().saturating_sub(1)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn initial_sigma(&self) -> f32 {
        self.sigmas.first().copied().unwrap_or(0.)
    }
}

#[inline]
pub(crate) fn derivative(
    sample: ArrayView4<'_, f32>,
    denoised: ArrayView4<'_, f32>,
    sigma: f32,
) -> Array4<f32> {
    (&sample - &denoised) / sigma
}
