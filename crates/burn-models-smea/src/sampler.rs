//! Euler DY / SMEA samplers
//!
//! Six variants share one integration loop over the sigma schedule. Every
//! step applies optional churn, queries the model once at `sigma_hat`, and
//! advances the latent; the variants differ in:
//!
//! - the update rule (Euler, or CFG++ which needs the unconditional estimate)
//! - which refinement pass runs on which step, and whether it runs before or
//!   after the update
//! - a sign flip of the update on steps 2 and 3 ("negative" variants)
//! - when the progress callback observes the latent
//! - whether churn noise is drawn every step or only when churn is active
//!
//! Refinement never runs on the final transition to `sigma = 0`.

use std::fmt;
use std::str::FromStr;

use burn::prelude::*;
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::conditioning::{HostSurface, RescalePolicy};
use crate::error::{Result, SamplerError};
use crate::guidance::GuidanceCapture;
use crate::model::{DenoiseModel, ExtraArgs, sigma_vector};
use crate::noise::NoiseSource;
use crate::refine::{Refinement, StepSigmas, UpdateRule, refine};
use crate::resample::ResampleMode;
use crate::schedule::{Churn, validate_sigmas};

/// Layout of the step progress bar
const PROGRESS_TEMPLATE: &str = "{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}";

/// Sampler variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplerKind {
    /// Euler with a DY pass before the update on steps 2 and 3
    EulerDy,
    /// Euler with SMEA after step 0 and DY after step 1
    EulerSmeaDy,
    /// Euler with the update sign flipped on steps 2 and 3
    EulerNegative,
    /// Negative variant with a DY pass before the flipped update
    EulerDyNegative,
    /// CFG++ update with a DY pass on steps 2 and 3
    EulerDyCfgPp,
    /// CFG++ update with SMEA after step 0 and DY after step 1
    EulerSmeaDyCfgPp,
}

impl SamplerKind {
    /// All variants
    pub const ALL: [SamplerKind; 6] = [
        SamplerKind::EulerDy,
        SamplerKind::EulerSmeaDy,
        SamplerKind::EulerNegative,
        SamplerKind::EulerDyNegative,
        SamplerKind::EulerDyCfgPp,
        SamplerKind::EulerSmeaDyCfgPp,
    ];

    /// Machine name
    pub fn name(self) -> &'static str {
        match self {
            SamplerKind::EulerDy => "euler_dy",
            SamplerKind::EulerSmeaDy => "euler_smea_dy",
            SamplerKind::EulerNegative => "euler_negative",
            SamplerKind::EulerDyNegative => "euler_dy_negative",
            SamplerKind::EulerDyCfgPp => "euler_dy_cfg_pp",
            SamplerKind::EulerSmeaDyCfgPp => "euler_smea_dy_cfg_pp",
        }
    }

    /// Human readable name
    pub fn display_name(self) -> &'static str {
        match self {
            SamplerKind::EulerDy => "Euler Dy",
            SamplerKind::EulerSmeaDy => "Euler SMEA Dy",
            SamplerKind::EulerNegative => "Euler Negative",
            SamplerKind::EulerDyNegative => "Euler Dy Negative",
            SamplerKind::EulerDyCfgPp => "Euler Dy CFG++",
            SamplerKind::EulerSmeaDyCfgPp => "Euler SMEA Dy CFG++",
        }
    }

    /// Whether the variant uses the CFG++ update
    pub fn is_cfg_pp(self) -> bool {
        self.plan().rule == UpdateRule::CfgPlusPlus
    }

    fn plan(self) -> StepPlan {
        let euler = StepPlan {
            rule: UpdateRule::Euler,
            gate: RefineGate::Never,
            refine_before_update: false,
            flip_sign: false,
            callback: CallbackPoint::EndOfStep,
            noise: NoiseDraw::EveryStep,
        };
        let cfg_pp = StepPlan {
            rule: UpdateRule::CfgPlusPlus,
            noise: NoiseDraw::WhenChurning,
            ..euler
        };

        match self {
            SamplerKind::EulerDy => StepPlan {
                gate: RefineGate::DyOnSecondPair,
                refine_before_update: true,
                callback: CallbackPoint::BeforeUpdate,
                ..euler
            },
            SamplerKind::EulerSmeaDy => StepPlan {
                gate: RefineGate::SmeaThenDy,
                ..euler
            },
            SamplerKind::EulerNegative => StepPlan {
                flip_sign: true,
                callback: CallbackPoint::AfterQuery,
                ..euler
            },
            SamplerKind::EulerDyNegative => StepPlan {
                gate: RefineGate::DyOnSecondPair,
                refine_before_update: true,
                flip_sign: true,
                callback: CallbackPoint::AfterQuery,
                ..euler
            },
            SamplerKind::EulerDyCfgPp => StepPlan {
                gate: RefineGate::DyOnSecondPair,
                ..cfg_pp
            },
            SamplerKind::EulerSmeaDyCfgPp => StepPlan {
                gate: RefineGate::SmeaThenDy,
                ..cfg_pp
            },
        }
    }
}

impl fmt::Display for SamplerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

impl FromStr for SamplerKind {
    type Err = SamplerError;

    fn from_str(s: &str) -> Result<Self> {
        SamplerKind::ALL
            .into_iter()
            .find(|kind| kind.name() == s || kind.display_name() == s)
            .ok_or_else(|| SamplerError::UnknownSampler(s.to_string()))
    }
}

/// Step indices that receive a refinement pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RefineGate {
    Never,
    /// DY on steps with `i / 2 == 1`, i.e. steps 2 and 3
    DyOnSecondPair,
    /// SMEA on step 0, DY on step 1
    SmeaThenDy,
}

impl RefineGate {
    fn select(self, i: usize) -> Option<Refinement> {
        match self {
            RefineGate::Never => None,
            RefineGate::DyOnSecondPair => on_second_pair(i).then_some(Refinement::Dy),
            RefineGate::SmeaThenDy => match i {
                0 => Some(Refinement::Smea),
                1 => Some(Refinement::Dy),
                _ => None,
            },
        }
    }
}

fn on_second_pair(i: usize) -> bool {
    i / 2 == 1
}

/// Where in the step the callback observes `x`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallbackPoint {
    AfterQuery,
    BeforeUpdate,
    EndOfStep,
}

/// When churn noise is drawn from the noise source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NoiseDraw {
    EveryStep,
    WhenChurning,
}

#[derive(Debug, Clone, Copy)]
struct StepPlan {
    rule: UpdateRule,
    gate: RefineGate,
    refine_before_update: bool,
    flip_sign: bool,
    callback: CallbackPoint,
    noise: NoiseDraw,
}

/// Sampler configuration
#[derive(Debug, Clone, PartialEq)]
pub struct SmeaConfig {
    /// Total churn spread over the schedule
    pub s_churn: f32,
    /// Lowest sigma that receives churn
    pub s_tmin: f32,
    /// Highest sigma that receives churn
    pub s_tmax: f32,
    /// Churn noise multiplier
    pub s_noise: f32,
    /// Fixed churn factor overriding the computed one
    pub s_gamma: Option<f32>,
    /// Conditioning field convention of the host
    pub surface: HostSurface,
    /// Interpolation for SMEA and conditioning rescales
    pub resample_mode: ResampleMode,
    /// Draw a progress bar over the steps
    pub show_progress: bool,
}

impl Default for SmeaConfig {
    fn default() -> Self {
        let churn = Churn::default();
        Self {
            s_churn: churn.s_churn,
            s_tmin: churn.s_tmin,
            s_tmax: churn.s_tmax,
            s_noise: 1.0,
            s_gamma: None,
            surface: HostSurface::default(),
            resample_mode: ResampleMode::default(),
            show_progress: false,
        }
    }
}

impl SmeaConfig {
    /// Configuration with churn disabled at every noise level
    pub fn deterministic() -> Self {
        let churn = Churn::disabled();
        Self {
            s_churn: churn.s_churn,
            s_tmin: churn.s_tmin,
            s_tmax: churn.s_tmax,
            ..Self::default()
        }
    }

    /// Churn settings
    pub fn churn(&self) -> Churn {
        Churn {
            s_churn: self.s_churn,
            s_tmin: self.s_tmin,
            s_tmax: self.s_tmax,
        }
    }

    /// Conditioning rescale policy
    pub fn rescale_policy(&self) -> RescalePolicy {
        RescalePolicy {
            surface: self.surface,
            mode: self.resample_mode,
        }
    }

    fn gamma(&self, sigma: f32, steps: usize) -> f64 {
        match self.s_gamma {
            Some(gamma) => gamma as f64,
            None => self.churn().gamma(sigma, steps),
        }
    }
}

/// Telemetry passed to the step callback
#[derive(Debug, Clone)]
pub struct StepInfo<B: Backend> {
    /// Step index
    pub i: usize,
    /// Scheduled sigma
    pub sigma: f32,
    /// Churn-inflated sigma the model was queried at
    pub sigma_hat: f32,
    /// Denoised estimate of the step
    pub denoised: Tensor<B, 4>,
    /// Current latent
    pub x: Tensor<B, 4>,
}

/// DY / SMEA sampler
#[derive(Debug, Clone)]
pub struct SmeaSampler {
    kind: SamplerKind,
    config: SmeaConfig,
}

impl SmeaSampler {
    /// Create a sampler of the given variant
    pub fn new(kind: SamplerKind, config: SmeaConfig) -> Self {
        Self { kind, config }
    }

    /// Sampler variant
    pub fn kind(&self) -> SamplerKind {
        self.kind
    }

    /// Configuration
    pub fn config(&self) -> &SmeaConfig {
        &self.config
    }

    /// Integrate `x` over `sigmas`
    pub fn sample<B, M, N>(
        &self,
        model: &mut M,
        x: Tensor<B, 4>,
        sigmas: &[f32],
        extra_args: &ExtraArgs<B>,
        noise: &mut N,
    ) -> Result<Tensor<B, 4>>
    where
        B: Backend,
        M: DenoiseModel<B> + ?Sized,
        N: NoiseSource<B> + ?Sized,
    {
        self.sample_with_callback(model, x, sigmas, extra_args, noise, |_| {})
    }

    /// Integrate `x` over `sigmas`, reporting every step to `callback`
    pub fn sample_with_callback<B, M, N, F>(
        &self,
        model: &mut M,
        x: Tensor<B, 4>,
        sigmas: &[f32],
        extra_args: &ExtraArgs<B>,
        noise: &mut N,
        mut callback: F,
    ) -> Result<Tensor<B, 4>>
    where
        B: Backend,
        M: DenoiseModel<B> + ?Sized,
        N: NoiseSource<B> + ?Sized,
        F: FnMut(&StepInfo<B>),
    {
        validate_sigmas(sigmas)?;

        let plan = self.kind.plan();
        let steps = sigmas.len() - 1;
        let policy = self.config.rescale_policy();
        let args = plan.rule.query_args(extra_args);
        let progress = self.progress_bar(steps);

        debug!(sampler = self.kind.name(), steps, dims = ?x.dims(), "sampling");

        let mut x = x;
        for i in 0..steps {
            let sigma = sigmas[i];
            let sigma_next = sigmas[i + 1];

            let gamma = self.config.gamma(sigma, steps);
            let eps = match plan.noise {
                NoiseDraw::EveryStep => Some(noise.randn_like(&x) * self.config.s_noise),
                NoiseDraw::WhenChurning if gamma > 0.0 => {
                    Some(noise.randn_like(&x) * self.config.s_noise)
                }
                NoiseDraw::WhenChurning => None,
            };
            let sigma_hat = sigma * (gamma + 1.0) as f32;
            let step = StepSigmas {
                step: i,
                sigma_hat,
                sigma_next,
            };
            if gamma > 0.0
                && let Some(eps) = eps
            {
                x = x - eps * (sigma_hat.powi(2) - sigma.powi(2)).sqrt();
            }

            let mut capture = GuidanceCapture::new();
            let denoised =
                model.denoise(x.clone(), sigma_vector(&x, sigma_hat), &args, &mut capture)?;
            let d = plan.rule.direction(&x, &denoised, &mut capture, step)?;

            let active = sigma_next > 0.0;
            let refinement = if active { plan.gate.select(i) } else { None };
            let flip = plan.flip_sign && active && on_second_pair(i);
            trace!(i, sigma, sigma_hat, gamma, ?refinement, flip, "step");

            let report = |x: &Tensor<B, 4>| StepInfo {
                i,
                sigma,
                sigma_hat,
                denoised: denoised.clone(),
                x: x.clone(),
            };

            if plan.callback == CallbackPoint::AfterQuery {
                callback(&report(&x));
            }
            if plan.refine_before_update
                && let Some(refinement) = refinement
            {
                x = refine(refinement, plan.rule, model, x, step, &args, policy)?;
            }
            if plan.callback == CallbackPoint::BeforeUpdate {
                callback(&report(&x));
            }

            x = if flip {
                x.neg() - d * step.dt()
            } else {
                plan.rule.advance(x, denoised.clone(), d, step)
            };

            if !plan.refine_before_update
                && let Some(refinement) = refinement
            {
                x = refine(refinement, plan.rule, model, x, step, &args, policy)?;
            }
            if plan.callback == CallbackPoint::EndOfStep {
                callback(&report(&x));
            }

            progress.inc(1);
        }

        progress.finish_and_clear();
        Ok(x)
    }

    fn progress_bar(&self, steps: usize) -> ProgressBar {
        if !self.config.show_progress {
            return ProgressBar::hidden();
        }

        let pb = ProgressBar::new(steps as u64);
        match ProgressStyle::default_bar().template(PROGRESS_TEMPLATE) {
            Ok(style) => pb.set_style(style.progress_chars("#>-")),
            Err(err) => warn!(%err, "invalid progress bar template, using the default style"),
        }
        pb.set_message(self.kind.display_name());
        pb
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = SmeaConfig::default();
        assert_eq!(config.s_churn, 0.0);
        assert_eq!(config.s_tmax, f32::INFINITY);
        assert_eq!(config.s_noise, 1.0);
        assert_eq!(config.surface, HostSurface::ComfyUi);
        assert_eq!(config.resample_mode, ResampleMode::NearestExact);
    }

    #[test]
    fn test_deterministic_config_has_no_churn() {
        let config = SmeaConfig::deterministic();
        for sigma in [14.6, 1.0, 0.03] {
            assert_eq!(config.gamma(sigma, 10), 0.0);
        }
    }

    #[test]
    fn test_zero_s_churn_keeps_gamma_floor() {
        let config = SmeaConfig::default();
        assert_eq!(config.s_churn, 0.0);
        assert_eq!(config.gamma(1.0, 10), crate::schedule::MIN_CHURN_GAMMA);
        assert_eq!(config.gamma(14.6, 4), crate::schedule::MIN_CHURN_GAMMA);
    }

    #[test]
    fn test_s_gamma_overrides_churn() {
        let config = SmeaConfig {
            s_gamma: Some(0.25),
            ..SmeaConfig::deterministic()
        };
        assert_eq!(config.gamma(1.0, 10), 0.25);
    }

    #[test]
    fn test_second_pair_gate() {
        let gate = RefineGate::DyOnSecondPair;
        let picked: Vec<usize> = (0..8).filter(|&i| gate.select(i).is_some()).collect();
        assert_eq!(picked, vec![2, 3]);
    }

    #[test]
    fn test_smea_then_dy_gate() {
        let gate = RefineGate::SmeaThenDy;
        assert_eq!(gate.select(0), Some(Refinement::Smea));
        assert_eq!(gate.select(1), Some(Refinement::Dy));
        assert!((2..10).all(|i| gate.select(i).is_none()));
    }

    #[test]
    fn test_plans() {
        assert!(SamplerKind::EulerDyCfgPp.is_cfg_pp());
        assert!(SamplerKind::EulerSmeaDyCfgPp.is_cfg_pp());
        assert!(!SamplerKind::EulerDy.is_cfg_pp());

        let negative = SamplerKind::EulerNegative.plan();
        assert!(negative.flip_sign);
        assert_eq!(negative.gate, RefineGate::Never);

        let cfg_pp = SamplerKind::EulerDyCfgPp.plan();
        assert_eq!(cfg_pp.noise, NoiseDraw::WhenChurning);
        assert!(!cfg_pp.refine_before_update);
    }

    #[test]
    fn test_progress_template_parses() {
        assert!(ProgressStyle::default_bar().template(PROGRESS_TEMPLATE).is_ok());
    }

    #[test]
    fn test_progress_bar_hidden_by_default() {
        let sampler = SmeaSampler::new(SamplerKind::EulerDy, SmeaConfig::default());
        assert!(sampler.progress_bar(4).is_hidden());
    }

    #[test]
    fn test_kind_names_round_trip() {
        for kind in SamplerKind::ALL {
            assert_eq!(kind.name().parse::<SamplerKind>().unwrap(), kind);
            assert_eq!(kind.display_name().parse::<SamplerKind>().unwrap(), kind);

            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.name()));
        }
        assert!(matches!(
            "euler_a".parse::<SamplerKind>(),
            Err(SamplerError::UnknownSampler(_))
        ));
    }
}
