//! Flow matching scheduler.
//!
//! Sigmas are spaced linearly between `sigma_max` and `sigma_min`, then
//! shifted with `shift * sigma / (1 + (shift - 1) * sigma)`. The model
//! predicts the flow `noise - clean`; one Euler step moves a sample from
//! its level to the next one along that flow.

use ndarray::Array4;

use crate::config::SchedulerConfig;
use crate::error::{PipelineError, Result};

/// Flow Matching Euler scheduler.
#[derive(Debug, Clone)]
pub struct FlowMatchScheduler {
    config: SchedulerConfig,
    /// Sigma values for each applied level (high to low).
    sigmas: Vec<f32>,
    /// Timesteps for each applied level (sigmas * num_train_timesteps).
    timesteps: Vec<f32>,
}

impl FlowMatchScheduler {
    /// Creates a scheduler with no schedule set.
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            sigmas: Vec::new(),
            timesteps: Vec::new(),
        }
    }

    /// Computes the schedule for a call.
    ///
    /// A full schedule of `num_steps` levels is built; with
    /// `denoising_strength < 1` only its trailing
    /// `round(num_steps * denoising_strength)` levels are kept (at least one).
    pub fn set_timesteps(&mut self, num_steps: u32, denoising_strength: f32) -> Result<()> {
        if num_steps == 0 {
            return Err(PipelineError::invalid_config("inference_steps must be > 0"));
        }
        if !(denoising_strength > 0.0 && denoising_strength <= 1.0) {
            return Err(PipelineError::invalid_config(format!(
                "denoising_strength {} must be in (0, 1]",
                denoising_strength
            )));
        }

        let full = compute_flow_matching_schedule(num_steps, &self.config);
        let applied = ((num_steps as f32 * denoising_strength).round() as usize)
            .clamp(1, num_steps as usize);
        let skipped = num_steps as usize - applied;

        self.sigmas = full[skipped..].to_vec();
        self.timesteps = self
            .sigmas
            .iter()
            .map(|s| s * self.config.num_train_timesteps)
            .collect();
        Ok(())
    }

    /// Returns true once `set_timesteps` has succeeded.
    pub fn is_set(&self) -> bool {
        !self.sigmas.is_empty()
    }

    /// Returns the applied sigmas.
    pub fn sigmas(&self) -> &[f32] {
        &self.sigmas
    }

    /// Returns the applied timesteps.
    pub fn timesteps(&self) -> &[f32] {
        &self.timesteps
    }

    /// Returns the number of applied levels.
    pub fn len(&self) -> usize {
        self.sigmas.len()
    }

    /// Returns true when no schedule is set.
    pub fn is_empty(&self) -> bool {
        self.sigmas.is_empty()
    }

    /// Returns the sigma at schedule position `index`.
    pub fn sigma_at(&self, index: usize) -> Result<f32> {
        if !self.is_set() {
            return Err(PipelineError::schedule_not_set());
        }
        self.sigmas.get(index).copied().ok_or_else(|| {
            PipelineError::invalid_request(format!(
                "schedule index {} out of range ({} levels)",
                index,
                self.sigmas.len()
            ))
        })
    }

    /// Blends `clean` towards `noise` at the level nearest `timestep`.
    pub fn add_noise(
        &self,
        clean: &Array4<f32>,
        noise: &Array4<f32>,
        timestep: f32,
    ) -> Result<Array4<f32>> {
        if clean.dim() != noise.dim() {
            return Err(PipelineError::shape_mismatch("noise", noise.shape(), clean.shape()));
        }
        let sigma = self.sigmas[self.level_of(timestep)?];
        Ok(clean * (1.0 - sigma) + noise * sigma)
    }

    /// Advances `sample` from the level nearest `timestep` to the next level.
    ///
    /// After the last level the target sigma is zero, i.e. the clean estimate.
    pub fn step(
        &self,
        model_output: &Array4<f32>,
        timestep: f32,
        sample: &Array4<f32>,
    ) -> Result<Array4<f32>> {
        if model_output.dim() != sample.dim() {
            return Err(PipelineError::shape_mismatch(
                "model output",
                model_output.shape(),
                sample.shape(),
            ));
        }
        let index = self.level_of(timestep)?;
        let sigma = self.sigmas[index];
        let sigma_next = self.sigmas.get(index + 1).copied().unwrap_or(0.0);
        Ok(sample + &(model_output * (sigma_next - sigma)))
    }

    fn level_of(&self, timestep: f32) -> Result<usize> {
        self.timesteps
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| (*a - timestep).abs().total_cmp(&(*b - timestep).abs()))
            .map(|(i, _)| i)
            .ok_or_else(PipelineError::schedule_not_set)
    }
}

impl Default for FlowMatchScheduler {
    fn default() -> Self {
        Self::new(SchedulerConfig::default())
    }
}

/// Computes `num_steps` shifted sigmas from `sigma_max` down to `sigma_min`.
fn compute_flow_matching_schedule(num_steps: u32, config: &SchedulerConfig) -> Vec<f32> {
    let shift = config.shift;
    (0..num_steps)
        .map(|i| {
            let t = if num_steps == 1 {
                0.0
            } else {
                i as f32 / (num_steps - 1) as f32
            };
            let sigma = config.sigma_max + (config.sigma_min - config.sigma_max) * t;
            shift * sigma / (1.0 + (shift - 1.0) * sigma)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::pipeline::latent::generate_noise;

    fn distance(a: &Array4<f32>, b: &Array4<f32>) -> f32 {
        (a - b).mapv(|v| v * v).sum().sqrt()
    }

    #[test]
    fn schedule_is_monotonic() {
        let mut scheduler = FlowMatchScheduler::default();
        scheduler.set_timesteps(30, 1.0).unwrap();
        let sigmas = scheduler.sigmas();

        assert_eq!(sigmas.len(), 30);
        assert!((sigmas[0] - 1.0).abs() < 1e-6, "first sigma should be 1.0, got {}", sigmas[0]);
        for i in 1..sigmas.len() {
            assert!(
                sigmas[i] < sigmas[i - 1],
                "sigma {} ({}) >= sigma {} ({})",
                i,
                sigmas[i],
                i - 1,
                sigmas[i - 1]
            );
        }
        for (t, s) in scheduler.timesteps().iter().zip(sigmas) {
            assert!((t - s * 1000.0).abs() < 1e-3);
        }
    }

    #[test]
    fn last_sigma_is_shifted_minimum() {
        let mut scheduler = FlowMatchScheduler::default();
        scheduler.set_timesteps(10, 1.0).unwrap();
        let sigma_min = 0.003_f32 / 1.002;
        let expected = 3.0 * sigma_min / (1.0 + 2.0 * sigma_min);
        assert!((scheduler.sigmas()[9] - expected).abs() < 1e-6);
    }

    #[test]
    fn partial_strength_keeps_tail() {
        let mut full = FlowMatchScheduler::default();
        full.set_timesteps(20, 1.0).unwrap();

        let mut partial = FlowMatchScheduler::default();
        partial.set_timesteps(20, 0.5).unwrap();

        assert_eq!(partial.len(), 10);
        assert_eq!(partial.sigmas(), &full.sigmas()[10..]);
    }

    #[test]
    fn tiny_strength_keeps_one_level() {
        let mut scheduler = FlowMatchScheduler::default();
        scheduler.set_timesteps(10, 0.01).unwrap();
        assert_eq!(scheduler.len(), 1);
    }

    #[test]
    fn invalid_arguments() {
        let mut scheduler = FlowMatchScheduler::default();
        assert_eq!(scheduler.set_timesteps(0, 1.0).unwrap_err().code, ErrorCode::InvalidConfig);
        assert_eq!(scheduler.set_timesteps(10, 0.0).unwrap_err().code, ErrorCode::InvalidConfig);
        assert_eq!(scheduler.set_timesteps(10, 1.5).unwrap_err().code, ErrorCode::InvalidConfig);
    }

    #[test]
    fn queries_before_set_fail() {
        let scheduler = FlowMatchScheduler::default();
        let x = Array4::zeros((1, 16, 2, 2));
        let not_set = |err: PipelineError| err.code == ErrorCode::ScheduleNotSet;
        assert!(not_set(scheduler.step(&x, 1000.0, &x).unwrap_err()));
        assert!(not_set(scheduler.add_noise(&x, &x, 1000.0).unwrap_err()));
        assert!(not_set(scheduler.sigma_at(0).unwrap_err()));
    }

    #[test]
    fn add_noise_interpolates() {
        let mut scheduler = FlowMatchScheduler::default();
        scheduler.set_timesteps(4, 1.0).unwrap();
        let clean = Array4::from_elem((1, 16, 2, 2), 2.0);
        let noise = Array4::from_elem((1, 16, 2, 2), -1.0);

        let t = scheduler.timesteps()[1];
        let sigma = scheduler.sigmas()[1];
        let noisy = scheduler.add_noise(&clean, &noise, t).unwrap();
        let expected = 2.0 * (1.0 - sigma) - sigma;
        assert!(noisy.iter().all(|v| (v - expected).abs() < 1e-5));
    }

    #[test]
    fn exact_flow_reaches_clean() {
        let mut scheduler = FlowMatchScheduler::default();
        scheduler.set_timesteps(8, 1.0).unwrap();

        let clean = generate_noise((1, 16, 4, 4), 1);
        let noise = generate_noise((1, 16, 4, 4), 2);
        let flow = &noise - &clean;

        let timesteps = scheduler.timesteps().to_vec();
        let mut sample = scheduler.add_noise(&clean, &noise, timesteps[0]).unwrap();
        let mut last_distance = distance(&sample, &clean);

        for (i, &t) in timesteps.iter().enumerate() {
            sample = scheduler.step(&flow, t, &sample).unwrap();
            let d = distance(&sample, &clean);
            assert!(d < last_distance, "step {} did not approach the clean latent", i);
            last_distance = d;

            // Each step lands exactly on the next level of the schedule.
            if let Some(&next_t) = timesteps.get(i + 1) {
                let expected = scheduler.add_noise(&clean, &noise, next_t).unwrap();
                assert!(distance(&sample, &expected) < 1e-4);
            }
        }
        assert!(distance(&sample, &clean) < 1e-4);
    }

    #[test]
    fn zero_prediction_keeps_sample() {
        let mut scheduler = FlowMatchScheduler::default();
        scheduler.set_timesteps(5, 1.0).unwrap();
        let sample = generate_noise((1, 16, 2, 2), 3);
        let zero = Array4::zeros((1, 16, 2, 2));
        let out = scheduler.step(&zero, scheduler.timesteps()[2], &sample).unwrap();
        assert_eq!(out, sample);
    }
}
