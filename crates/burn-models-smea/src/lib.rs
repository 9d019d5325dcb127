//! SMEA and DY Euler samplers for diffusion models
//!
//! Euler-method integrators over a k-diffusion sigma schedule, augmented with
//! refinement passes that re-query the model on a transformed view of the
//! latent:
//!
//! - [`refine::Refinement::Dy`] - sub-pixel pass on a checkerboard proxy grid
//! - [`refine::Refinement::Smea`] - pass on a 1.25× upscaled latent
//!
//! CFG++ variants steer with the unconditional denoised estimate, which the
//! model reports through a [`GuidanceCapture`].
//!
//! # Modules
//!
//! - [`sampler`] - the six sampler variants behind one loop
//! - [`refine`] - DY / SMEA passes and update rules
//! - [`checkerboard`] - 2×2 block decomposition
//! - [`conditioning`] - scoped rescaling of the model's conditioning tensors
//! - [`resample`] - nearest / nearest-exact resizing
//! - [`guidance`] - guidance options, capture mailbox, CFG adapter
//! - [`model`] - the model contract
//! - [`schedule`] - `to_d`, churn and schedule helpers
//! - [`noise`] - churn noise sources
//!
//! # Example
//!
//! ```ignore
//! use burn_models_smea::{
//!     ExtraArgs, SamplerKind, SeededNoise, SmeaConfig, SmeaSampler, karras_sigmas,
//! };
//!
//! let sigmas = karras_sigmas(20, 0.0292, 14.6146, 7.0);
//! let sampler = SmeaSampler::new(SamplerKind::EulerSmeaDy, SmeaConfig::default());
//! let mut noise = SeededNoise::new(42);
//! let latent = sampler.sample(&mut model, noise_latent, &sigmas, &ExtraArgs::new(), &mut noise)?;
//! ```

pub mod checkerboard;
pub mod conditioning;
pub mod error;
pub mod guidance;
pub mod model;
pub mod noise;
pub mod refine;
pub mod resample;
pub mod sampler;
pub mod schedule;

pub use checkerboard::Checkerboard;
pub use conditioning::{HostSurface, RescalePolicy, RescaleScope};
pub use error::{ModelError, Result, SamplerError};
pub use guidance::{
    CfgDenoiser, DenoisePredictor, GuidanceCapture, ModelOptions, apply_guidance,
    set_post_cfg_capture,
};
pub use model::{Conditioning, DenoiseModel, ExtraArgs, sigma_vector};
pub use noise::{BackendNoise, NoiseSource, SeededNoise};
pub use refine::{Refinement, StepSigmas, UpdateRule, dy_step, refine, smea_step};
pub use resample::{ResampleMode, rescale, resize, resize_mask};
pub use sampler::{SamplerKind, SmeaConfig, SmeaSampler, StepInfo};
pub use schedule::{Churn, karras_sigmas, to_d, validate_sigmas};
