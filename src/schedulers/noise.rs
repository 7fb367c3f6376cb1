use ndarray::Array1;

use super::Schedule;
use crate::config::{validate_schedule, ConfigError, ModelConfig};

#[derive(Debug, Clone)]
pub struct NoiseSchedule {
    log_sigmas: Array1<f32>,
}

impl NoiseSchedule {
    pub fn new(
        num_train_timesteps: usize,
        beta_start: f64,
        beta_end: f64,
    ) -> Result<Self, ConfigError> {
        validate_schedule(num_train_timesteps, beta_start, beta_end)?;
        Ok(Self::from_betas(num_train_timesteps, beta_start, beta_end))
    }

    pub fn from_config(config: &ModelConfig) -> Result<Self, ConfigError> {
        Self::new(config.num_train_timesteps, config.beta_start, config.beta_end)
    }

    fn from_betas(num_train_timesteps: usize, beta_start: f64, beta_end: f64) -> Self {
        let mut betas = Array1::linspace(beta_start.sqrt(), beta_end.sqrt(), num_train_timesteps);
        betas.iter_mut().for_each(|f| *f = f.powi(2));

        let log_sigmas = betas
            .iter()
            .scan(1.0f64, |alpha_cumprod, &beta| {
                *alpha_cumprod *= 1. - beta;
                Some(*alpha_cumprod)
            })
            .map(|x| (((1. - x) / x).sqrt().ln()) as f32)
            .collect();

        Self { log_sigmas }
    }

    pub fn sigma_min(&self) -> f32 {
        self.log_sigmas[0].exp()
    }

    pub fn sigma_max(&self) -> f32 {
        self.log_sigmas[self.log_sigmas.len() - 1].exp()
    }

    pub fn discretize(&self, steps: usize) -> Schedule {
        let t_max = (self.log_sigmas.len() - 1) as f32;
        let timesteps: Vec<f32> = match steps {
            0 => vec![],
            1 => vec![t_max],
            _ => (0..steps)
                .map(|i| t_max - t_max * i as f32 / (steps - 1) as f32)
                .collect(),
        };
        let sigmas = timesteps
            .iter()
            .map(|&t| self.t_to_sigma(t))
            .chain([0.])
            .collect();

        Schedule { sigmas, timesteps }
    }

    pub fn t_to_sigma(&self, t: f32) -> f32 {
        let t = t.clamp(0., (self.log_sigmas.len() - 1) as f32);
        let low = t.floor() as usize;
        let high = t.ceil() as usize;
        let w = t.fract();
        ((1. - w) * self.log_sigmas[low] + w * self.log_sigmas[high]).exp()
    }

    // Inverse of `t_to_sigma`, clamped to the training range.
    pub fn sigma_to_t(&self, sigma: f32) -> f32 {
        let log_sigma = sigma.ln();
        let low = self
            .log_sigmas
            .iter()
            .rposition(|&l| log_sigma >= l)
            .unwrap_or(0)
            .min(self.log_sigmas.len() - 2);
        let high = low + 1;
        let (lo, hi) = (self.log_sigmas[low], self.log_sigmas[high]);
        let w = ((lo - log_sigma) / (lo - hi)).clamp(0., 1.);
        (1. - w) * low as f32 + w * high as f32
    }

    #[inline]
    pub fn input_scale(sigma: f32) -> f32 {
        1. / (sigma.powi(2) + 1.).sqrt()
    }
}

impl Default for NoiseSchedule {
    fn default() -> Self {
        let config = ModelConfig::default();
        Self::from_betas(config.num_train_timesteps, config.beta_start, config.beta_end)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn training_sigmas_match_stable_diffusion() {
        let noise = NoiseSchedule::default();
        assert!((noise.sigma_min() - 0.0292).abs() < 1e-3);
        assert!((noise.sigma_max() - 14.6146).abs() < 1e-2);
    }

    #[test]
    fn discretized_schedule_decreases_to_zero() {
        let schedule = NoiseSchedule::default().discretize(100);
        assert_eq!(schedule.sigmas.len(), 101);
        assert_eq!(schedule.len(), 100);
        assert_eq!(schedule.sigmas.last(), Some(&0.));
        assert!(schedule.sigmas.windows(2).all(|w| w[0] > w[1]));
        assert!((schedule.initial_sigma() - NoiseSchedule::default().sigma_max()).abs() < 1e-4);
    }

    #[test]
    fn single_step_schedule_starts_at_max_sigma() {
        let noise = NoiseSchedule::default();
        let schedule = noise.discretize(1);
        assert_eq!(schedule.timesteps, vec![999.]);
        assert_eq!(schedule.sigmas.len(), 2);
        assert_eq!(schedule.sigmas[1], 0.);
    }

    #[test]
    fn sigma_to_t_inverts_t_to_sigma() {
        let noise = NoiseSchedule::default();
        for t in [0., 1.5, 250.25, 998.9, 999.] {
            let roundtrip = noise.sigma_to_t(noise.t_to_sigma(t));
            assert!((roundtrip - t).abs() < 1e-2, "{t} -> {roundtrip}");
        }
    }

    #[test]
    fn degenerate_training_schedules_are_rejected() {
        assert!(matches!(
            NoiseSchedule::new(1, 0.00085, 0.012),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            NoiseSchedule::new(1000, 0.012, 0.00085),
            Err(ConfigError::Invalid(_))
        ));
        let config = ModelConfig {
            num_train_timesteps: 0,
            ..ModelConfig::default()
        };
        assert!(NoiseSchedule::from_config(&config).is_err());
        assert!(NoiseSchedule::new(2, 0.00085, 0.012).is_ok());
    }

    #[test]
    fn sigma_to_t_clamps_out_of_range() {
        let noise = NoiseSchedule::default();
        assert_eq!(noise.sigma_to_t(1e-6), 0.);
        assert_eq!(noise.sigma_to_t(1e6), 999.);
    }
}
