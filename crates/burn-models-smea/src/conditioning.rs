//! Scoped rescaling of a model's conditioning tensors
//!
//! Refinement passes query the model at a resolution that differs from the
//! latent's. Per-pixel conditioning tensors (init latents, masks, reference
//! noise) have to follow, so [`RescaleScope`] installs resized copies for one
//! query and puts the originals back when it is dropped.

use burn::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::ModelError;
use crate::guidance::GuidanceCapture;
use crate::model::{DenoiseModel, ExtraArgs};
use crate::resample::{ResampleMode, resize, resize_mask};

/// Which conditioning field convention the host uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostSurface {
    /// `init_latent`, `mask`, `nmask` on the model
    WebUi,
    /// `latent_image`, `noise` on the model, `denoise_mask` in the arguments
    #[default]
    ComfyUi,
}

/// How conditioning tensors follow a change of working resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RescalePolicy {
    /// Field convention of the host
    pub surface: HostSurface,
    /// Interpolation used for the conditioning tensors
    pub mode: ResampleMode,
}

/// Guard that keeps the model's conditioning resized for its lifetime
///
/// Holds the model exclusively; the originals are restored on drop, which
/// also covers early returns and unwinding out of a failed query.
pub struct RescaleScope<'a, B: Backend, M: DenoiseModel<B> + ?Sized> {
    model: &'a mut M,
    args: ExtraArgs<B>,
    policy: RescalePolicy,
    saved: Saved<B>,
}

enum Saved<B: Backend> {
    WebUi {
        init_latent: Option<Tensor<B, 4>>,
        mask: Option<Tensor<B, 3>>,
        nmask: Option<Tensor<B, 3>>,
    },
    ComfyUi {
        latent_image: Option<Tensor<B, 4>>,
        noise: Option<Tensor<B, 4>>,
    },
}

impl<'a, B: Backend, M: DenoiseModel<B> + ?Sized> RescaleScope<'a, B, M> {
    /// Resize the model's conditioning to the spatial size of `target`
    ///
    /// `args` is copied; the copy carries the resized denoise mask and is
    /// what [`Self::denoise`] passes to the model.
    pub fn enter(
        model: &'a mut M,
        target: &Tensor<B, 4>,
        args: &ExtraArgs<B>,
        policy: RescalePolicy,
    ) -> Self {
        let [_, _, height, width] = target.dims();
        let size = [height, width];
        let mode = policy.mode;
        let mut args = args.clone();
        let fields = model.conditioning_mut();

        let saved = match policy.surface {
            HostSurface::WebUi => {
                let saved = Saved::WebUi {
                    init_latent: fields.init_latent.clone(),
                    mask: fields.mask.clone(),
                    nmask: fields.nmask.clone(),
                };
                fields.init_latent = fields.init_latent.take().map(|t| resize(t, size, mode));
                fields.mask = fields.mask.take().map(|t| resize_mask(t, size, mode));
                fields.nmask = fields.nmask.take().map(|t| resize_mask(t, size, mode));
                saved
            }
            HostSurface::ComfyUi => {
                let saved = Saved::ComfyUi {
                    latent_image: fields.latent_image.clone(),
                    noise: fields.noise.clone(),
                };
                fields.latent_image = fields.latent_image.take().map(|t| resize(t, size, mode));
                fields.noise = fields.noise.take().map(|t| resize(t, size, mode));
                args.denoise_mask = args.denoise_mask.take().map(|t| resize(t, size, mode));
                saved
            }
        };

        trace!(surface = ?policy.surface, height, width, "conditioning rescaled");

        Self {
            model,
            args,
            policy,
            saved,
        }
    }

    /// The scoped model
    pub fn model(&self) -> &M {
        &*self.model
    }

    /// Arguments as seen by the scoped query
    pub fn args(&self) -> &ExtraArgs<B> {
        &self.args
    }

    /// Query the model with the rescaled conditioning
    pub fn denoise(
        &mut self,
        x: Tensor<B, 4>,
        sigma: Tensor<B, 1>,
        capture: &mut GuidanceCapture<B>,
    ) -> Result<Tensor<B, 4>, ModelError> {
        self.model.denoise(x, sigma, &self.args, capture)
    }
}

impl<B: Backend, M: DenoiseModel<B> + ?Sized> Drop for RescaleScope<'_, B, M> {
    fn drop(&mut self) {
        let fields = self.model.conditioning_mut();
        match &mut self.saved {
            Saved::WebUi {
                init_latent,
                mask,
                nmask,
            } => {
                fields.init_latent = init_latent.take();
                fields.mask = mask.take();
                fields.nmask = nmask.take();
            }
            Saved::ComfyUi {
                latent_image,
                noise,
            } => {
                fields.latent_image = latent_image.take();
                fields.noise = noise.take();
            }
        }
        trace!(surface = ?self.policy.surface, "conditioning restored");
    }
}
