//! DY and SMEA refinement steps
//!
//! Both refinements re-query the model on a transformed view of the latent
//! and fold the result back at native resolution:
//!
//! - **DY** works on the checkerboard proxy grid (bottom-right cell of every
//!   2×2 block), a quarter of the original area.
//! - **SMEA** upscales the whole latent by 1.25 on both axes, queries there,
//!   and resizes the update back down.
//!
//! Each can advance with a plain Euler step or with the CFG++ rule, which
//! steers by the unconditional denoised estimate instead of the guided one.

use burn::prelude::*;
use tracing::debug;

use crate::checkerboard::Checkerboard;
use crate::conditioning::{RescalePolicy, RescaleScope};
use crate::error::{Result, SamplerError};
use crate::guidance::{GuidanceCapture, set_post_cfg_capture};
use crate::model::{DenoiseModel, ExtraArgs, sigma_vector};
use crate::resample::{rescale, resize};
use crate::schedule::to_d;

/// Linear upscale factor of the SMEA query
pub const SMEA_SCALE: f64 = 1.25;

/// Which refinement pass to run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refinement {
    /// Sub-pixel pass on the checkerboard proxy grid
    Dy,
    /// Pass on a 1.25× upscaled latent
    Smea,
}

/// How a denoised estimate turns into the next latent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateRule {
    /// `x + d * (sigma_next - sigma_hat)` with `d` from the guided estimate
    Euler,
    /// `denoised + d * sigma_next` with `d` from the unconditional estimate
    CfgPlusPlus,
}

/// Noise levels of one integrator step
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepSigmas {
    /// Step index
    pub step: usize,
    /// Churn-inflated current sigma
    pub sigma_hat: f32,
    /// Target sigma of the step
    pub sigma_next: f32,
}

impl StepSigmas {
    /// Euler step size
    pub fn dt(&self) -> f32 {
        self.sigma_next - self.sigma_hat
    }
}

impl UpdateRule {
    /// Arguments for a query under this rule
    ///
    /// CFG++ needs the unconditional estimate, so the capture is installed.
    pub fn query_args<B: Backend>(self, args: &ExtraArgs<B>) -> ExtraArgs<B> {
        let mut args = args.clone();
        if self == UpdateRule::CfgPlusPlus {
            args.model_options = set_post_cfg_capture(&args.model_options);
        }
        args
    }

    /// Step direction at `x` after a query that produced `denoised`
    pub fn direction<B: Backend>(
        self,
        x: &Tensor<B, 4>,
        denoised: &Tensor<B, 4>,
        capture: &mut GuidanceCapture<B>,
        sigmas: StepSigmas,
    ) -> Result<Tensor<B, 4>> {
        let reference = match self {
            UpdateRule::Euler => denoised.clone(),
            UpdateRule::CfgPlusPlus => capture
                .take()
                .ok_or(SamplerError::MissingUncondDenoised { step: sigmas.step })?,
        };
        Ok(to_d(x.clone(), sigmas.sigma_hat, reference))
    }

    /// Advance `x` along `d`
    pub fn advance<B: Backend>(
        self,
        x: Tensor<B, 4>,
        denoised: Tensor<B, 4>,
        d: Tensor<B, 4>,
        sigmas: StepSigmas,
    ) -> Tensor<B, 4> {
        match self {
            UpdateRule::Euler => x + d * sigmas.dt(),
            UpdateRule::CfgPlusPlus => denoised + d * sigmas.sigma_next,
        }
    }
}

/// Run one refinement pass over `x`
pub fn refine<B: Backend, M: DenoiseModel<B> + ?Sized>(
    refinement: Refinement,
    rule: UpdateRule,
    model: &mut M,
    x: Tensor<B, 4>,
    sigmas: StepSigmas,
    args: &ExtraArgs<B>,
    policy: RescalePolicy,
) -> Result<Tensor<B, 4>> {
    debug!(step = sigmas.step, ?refinement, ?rule, "applying refinement");
    match refinement {
        Refinement::Dy => dy_step(rule, model, x, sigmas, args, policy),
        Refinement::Smea => smea_step(rule, model, x, sigmas, args, policy),
    }
}

/// DY pass: update the checkerboard proxy grid and write it back
///
/// Latents with fewer than 2 rows or columns have no proxy grid and are
/// returned unchanged.
pub fn dy_step<B: Backend, M: DenoiseModel<B> + ?Sized>(
    rule: UpdateRule,
    model: &mut M,
    x: Tensor<B, 4>,
    sigmas: StepSigmas,
    args: &ExtraArgs<B>,
    policy: RescalePolicy,
) -> Result<Tensor<B, 4>> {
    let Some((board, proxy)) = Checkerboard::split(&x) else {
        debug!(dims = ?x.dims(), "latent too small for a checkerboard pass, skipping");
        return Ok(x);
    };

    let proxy = scoped_update(rule, model, proxy, sigmas, args, policy)?;
    Ok(board.merge(proxy))
}

/// SMEA pass: update at 1.25× resolution and resize back
pub fn smea_step<B: Backend, M: DenoiseModel<B> + ?Sized>(
    rule: UpdateRule,
    model: &mut M,
    x: Tensor<B, 4>,
    sigmas: StepSigmas,
    args: &ExtraArgs<B>,
    policy: RescalePolicy,
) -> Result<Tensor<B, 4>> {
    let [_, _, height, width] = x.dims();
    let upscaled = rescale(x, [SMEA_SCALE, SMEA_SCALE], policy.mode);

    let updated = scoped_update(rule, model, upscaled, sigmas, args, policy)?;
    Ok(resize(updated, [height, width], policy.mode))
}

/// Query at `x`'s resolution with rescaled conditioning, then advance `x`
fn scoped_update<B: Backend, M: DenoiseModel<B> + ?Sized>(
    rule: UpdateRule,
    model: &mut M,
    x: Tensor<B, 4>,
    sigmas: StepSigmas,
    args: &ExtraArgs<B>,
    policy: RescalePolicy,
) -> Result<Tensor<B, 4>> {
    let args = rule.query_args(args);
    let mut capture = GuidanceCapture::new();

    let denoised = {
        let mut scope = RescaleScope::enter(model, &x, &args, policy);
        scope.denoise(x.clone(), sigma_vector(&x, sigmas.sigma_hat), &mut capture)?
    };

    let d = rule.direction(&x, &denoised, &mut capture, sigmas)?;
    Ok(rule.advance(x, denoised, d, sigmas))
}
