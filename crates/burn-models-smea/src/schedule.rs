//! Sigma schedule numerics shared by all samplers

use burn::prelude::*;

use crate::error::{Result, SamplerError};

/// Lower bound applied to the churn factor inside the churn window
pub const MIN_CHURN_GAMMA: f64 = std::f64::consts::SQRT_2 - 1.0;

/// ODE direction `d = (x - denoised) / sigma`
pub fn to_d<B: Backend>(x: Tensor<B, 4>, sigma: f32, denoised: Tensor<B, 4>) -> Tensor<B, 4> {
    (x - denoised) / sigma
}

/// Stochastic churn settings
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Churn {
    /// Total churn spread over the schedule
    pub s_churn: f32,
    /// Lowest sigma that receives churn
    pub s_tmin: f32,
    /// Highest sigma that receives churn
    pub s_tmax: f32,
}

/// Zero `s_churn` with an open window still churns at the `sqrt(2) - 1` floor
impl Default for Churn {
    fn default() -> Self {
        Self {
            s_churn: 0.0,
            s_tmin: 0.0,
            s_tmax: f32::INFINITY,
        }
    }
}

impl Churn {
    /// Churn disabled at every noise level
    pub fn disabled() -> Self {
        Self {
            s_churn: 0.0,
            s_tmin: 0.0,
            s_tmax: 0.0,
        }
    }

    /// Churn factor for a step at `sigma` in a run of `steps` steps
    ///
    /// Inside `[s_tmin, s_tmax]` this is `max(s_churn / steps, sqrt(2) - 1)`,
    /// zero outside.
    pub fn gamma(&self, sigma: f32, steps: usize) -> f64 {
        if self.s_tmin <= sigma && sigma <= self.s_tmax {
            (self.s_churn as f64 / steps as f64).max(MIN_CHURN_GAMMA)
        } else {
            0.0
        }
    }
}

/// Check that `sigmas` is a usable schedule
///
/// At least two entries, finite, non-negative and non-increasing.
pub fn validate_sigmas(sigmas: &[f32]) -> Result<()> {
    if sigmas.len() < 2 {
        return Err(SamplerError::ScheduleTooShort { len: sigmas.len() });
    }

    for (index, &sigma) in sigmas.iter().enumerate() {
        if !sigma.is_finite() || sigma < 0.0 {
            return Err(SamplerError::InvalidSchedule {
                index,
                reason: format!("sigma {} is not a finite non-negative value", sigma),
            });
        }
        if index > 0 && sigma > sigmas[index - 1] {
            return Err(SamplerError::InvalidSchedule {
                index,
                reason: format!("sigma increases from {} to {}", sigmas[index - 1], sigma),
            });
        }
    }

    Ok(())
}

/// Karras et al. (2022) sigma schedule with a trailing zero
///
/// Returns `n + 1` values from `sigma_max` down to `sigma_min`, then `0.0`.
pub fn karras_sigmas(n: usize, sigma_min: f32, sigma_max: f32, rho: f32) -> Vec<f32> {
    let min_inv_rho = sigma_min.powf(1.0 / rho);
    let max_inv_rho = sigma_max.powf(1.0 / rho);

    let mut sigmas: Vec<f32> = (0..n)
        .map(|i| {
            let ramp = i as f32 / (n - 1).max(1) as f32;
            (max_inv_rho + ramp * (min_inv_rho - max_inv_rho)).powf(rho)
        })
        .collect();
    sigmas.push(0.0);
    sigmas
}
