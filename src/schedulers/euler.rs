use ndarray::{Array4, ArrayView4};
use rand::Rng;

use super::{derivative, Schedule, Scheduler};

#[derive(Debug, Default, Clone, Copy)]
pub struct Euler;

impl Scheduler for Euler {
    fn step(
        &mut self,
        step: usize,
        schedule: &Schedule,
        sample: ArrayView4<'_, f32>,
        denoised: ArrayView4<'_, f32>,
        _rng: &mut impl Rng,
    ) -> Array4<f32> {
        let from = schedule.sigmas[step];
        let to = schedule.sigmas[step + 1];
        &sample + derivative(sample, denoised, from) * (to - from)
    }
}
