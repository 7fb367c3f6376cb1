use ndarray::{Array4, ArrayView4};
use rand::Rng;
use rand_distr::StandardNormal;

use super::{derivative, Schedule, Scheduler};

#[derive(Debug, Default, Clone, Copy)]
pub struct EulerAncestral;

impl EulerAncestral {
    /// Returns `(sigma_down, sigma_up)` for eta = 1.
    pub fn ancestral_step(from: f32, to: f32) -> (f32, f32) {
        let up = (to.powi(2) * (from.powi(2) - to.powi(2)) / from.powi(2))
            .max(0.)
            .sqrt()
            .min(to);
        let down = (to.powi(2) - up.powi(2)).max(0.).sqrt();
        (down, up)
    }
}

impl Scheduler for EulerAncestral {
    #[inline]
    fn step(
        &mut self,
        step: usize,
        schedule: &Schedule,
        sample: ArrayView4<'_, f32>,
        denoised: ArrayView4<'_, f32>,
        rng: &mut impl Rng,
    ) -> Array4<f32> {
        let from = schedule.sigmas[step];
        let to = schedule.sigmas[step + 1];
        let (down, up) = Self::ancestral_step(from, to);
        let next = &sample + derivative(sample, denoised, from) * (down - from);
        if to > 0. {
            let noise =
                Array4::<f32>::from_shape_simple_fn(sample.dim(), || rng.sample(StandardNormal));
            next + noise * up
        } else {
            next
        }
    }
}
