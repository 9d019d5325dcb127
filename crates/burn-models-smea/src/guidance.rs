//! Classifier-free guidance plumbing
//!
//! CFG++ samplers need the unconditional denoised estimate that the model
//! computes internally while combining cond/uncond predictions. The model
//! hands it back through a [`GuidanceCapture`] passed to every query; the
//! samplers opt in by installing the capture into [`ModelOptions`] with
//! [`set_post_cfg_capture`].

use burn::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::ModelError;
use crate::model::{Conditioning, DenoiseModel, ExtraArgs};

/// Embedding name for the positive prompt
pub const COND_KEY: &str = "cond";
/// Embedding name for the negative / empty prompt
pub const UNCOND_KEY: &str = "uncond";

/// Guidance options forwarded to the model
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelOptions {
    /// Report the unconditional denoised estimate through the capture
    pub capture_uncond: bool,
    /// Always run the uncond pass, even at guidance scale 1
    pub disable_cfg1_optimization: bool,
}

/// Install the post-CFG capture into a copy of `options`
///
/// The CFG=1 shortcut is disabled as well, since it would skip the
/// unconditional pass whose result is being captured.
pub fn set_post_cfg_capture(options: &ModelOptions) -> ModelOptions {
    ModelOptions {
        capture_uncond: true,
        disable_cfg1_optimization: true,
        ..options.clone()
    }
}

/// Single-slot mailbox for the unconditional denoised estimate
///
/// Written by the model during one query, read right after it.
#[derive(Debug, Clone)]
pub struct GuidanceCapture<B: Backend> {
    uncond_denoised: Option<Tensor<B, 4>>,
}

impl<B: Backend> Default for GuidanceCapture<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: Backend> GuidanceCapture<B> {
    /// Create an empty capture
    pub fn new() -> Self {
        Self {
            uncond_denoised: None,
        }
    }

    /// Store the unconditional estimate, replacing any previous value
    pub fn store(&mut self, uncond_denoised: Tensor<B, 4>) {
        self.uncond_denoised = Some(uncond_denoised);
    }

    /// Take the captured estimate, leaving the slot empty
    pub fn take(&mut self) -> Option<Tensor<B, 4>> {
        self.uncond_denoised.take()
    }

    /// Whether nothing has been captured
    pub fn is_empty(&self) -> bool {
        self.uncond_denoised.is_none()
    }
}

/// Standard classifier-free guidance combination
pub fn apply_guidance<B: Backend>(
    uncond: Tensor<B, 4>,
    cond: Tensor<B, 4>,
    guidance_scale: f32,
) -> Tensor<B, 4> {
    uncond.clone() + (cond - uncond) * guidance_scale
}

/// A raw denoiser evaluated under a single conditioning context
pub trait DenoisePredictor<B: Backend> {
    /// Predict the denoised latent under `context` (`None` = unconditional)
    fn predict(
        &mut self,
        x: Tensor<B, 4>,
        sigma: Tensor<B, 1>,
        context: Option<&Tensor<B, 3>>,
    ) -> Result<Tensor<B, 4>, ModelError>;
}

/// Wraps a [`DenoisePredictor`] with classifier-free guidance
///
/// Reads the `"cond"` and `"uncond"` embeddings from the argument bag,
/// combines both predictions with [`apply_guidance`], and reports the
/// unconditional prediction through the capture when asked to.
#[derive(Debug, Clone)]
pub struct CfgDenoiser<B: Backend, P> {
    /// Underlying predictor
    pub predictor: P,
    /// Guidance scale
    pub cfg_scale: f32,
    /// Auxiliary tensors installed by the host
    pub conditioning: Conditioning<B>,
}

impl<B: Backend, P: DenoisePredictor<B>> CfgDenoiser<B, P> {
    /// Create a guided denoiser
    pub fn new(predictor: P, cfg_scale: f32) -> Self {
        Self {
            predictor,
            cfg_scale,
            conditioning: Conditioning::default(),
        }
    }
}

impl<B: Backend, P: DenoisePredictor<B>> DenoiseModel<B> for CfgDenoiser<B, P> {
    fn denoise(
        &mut self,
        x: Tensor<B, 4>,
        sigma: Tensor<B, 1>,
        args: &ExtraArgs<B>,
        capture: &mut GuidanceCapture<B>,
    ) -> Result<Tensor<B, 4>, ModelError> {
        let options = &args.model_options;
        let cond = self
            .predictor
            .predict(x.clone(), sigma.clone(), args.embeddings.get(COND_KEY))?;

        if self.cfg_scale == 1.0 && !options.disable_cfg1_optimization {
            return Ok(cond);
        }

        let uncond = self
            .predictor
            .predict(x, sigma, args.embeddings.get(UNCOND_KEY))?;
        let denoised = apply_guidance(uncond.clone(), cond, self.cfg_scale);

        if options.capture_uncond {
            capture.store(uncond);
        }

        Ok(denoised)
    }

    fn conditioning(&self) -> &Conditioning<B> {
        &self.conditioning
    }

    fn conditioning_mut(&mut self) -> &mut Conditioning<B> {
        &mut self.conditioning
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray;

    /// Returns `x * 0.5` with a context, `x * 0.25` without
    struct HalvingPredictor {
        calls: usize,
    }

    impl DenoisePredictor<TestBackend> for HalvingPredictor {
        fn predict(
            &mut self,
            x: Tensor<TestBackend, 4>,
            _sigma: Tensor<TestBackend, 1>,
            context: Option<&Tensor<TestBackend, 3>>,
        ) -> Result<Tensor<TestBackend, 4>, ModelError> {
            self.calls += 1;
            Ok(match context {
                Some(_) => x * 0.5,
                None => x * 0.25,
            })
        }
    }

    fn args_with_cond() -> ExtraArgs<TestBackend> {
        ExtraArgs::new().with_embedding(COND_KEY, Tensor::zeros([1, 4, 8], &Default::default()))
    }

    #[test]
    fn test_set_post_cfg_capture() {
        let options = set_post_cfg_capture(&ModelOptions::default());
        assert!(options.capture_uncond);
        assert!(options.disable_cfg1_optimization);
    }

    #[test]
    fn test_capture_take_empties_slot() {
        let mut capture = GuidanceCapture::<TestBackend>::new();
        assert!(capture.is_empty());
        capture.store(Tensor::ones([1, 1, 2, 2], &Default::default()));
        assert!(!capture.is_empty());
        assert!(capture.take().is_some());
        assert!(capture.take().is_none());
    }

    #[test]
    fn test_cfg_denoiser_captures_uncond() {
        let mut model = CfgDenoiser::<TestBackend, _>::new(HalvingPredictor { calls: 0 }, 3.0);
        let x: Tensor<TestBackend, 4> = Tensor::ones([1, 1, 2, 2], &Default::default()) * 4.0;
        let sigma = Tensor::full([1], 1.0, &Default::default());
        let mut args = args_with_cond();
        args.model_options = set_post_cfg_capture(&args.model_options);

        let mut capture = GuidanceCapture::new();
        let denoised = model.denoise(x, sigma, &args, &mut capture).unwrap();

        // uncond = 1, cond = 2, guided = 1 + (2 - 1) * 3 = 4
        let denoised = denoised.into_data().to_vec::<f32>().unwrap();
        assert!(denoised.iter().all(|&v| (v - 4.0).abs() < 1e-6));
        let uncond = capture.take().unwrap().into_data().to_vec::<f32>().unwrap();
        assert!(uncond.iter().all(|&v| (v - 1.0).abs() < 1e-6));
    }

    #[test]
    fn test_cfg1_shortcut_skips_uncond() {
        let mut model = CfgDenoiser::<TestBackend, _>::new(HalvingPredictor { calls: 0 }, 1.0);
        let x: Tensor<TestBackend, 4> = Tensor::ones([1, 1, 2, 2], &Default::default());
        let sigma = Tensor::full([1], 1.0, &Default::default());
        let mut capture = GuidanceCapture::new();

        let mut args = args_with_cond();
        args.model_options.capture_uncond = true;
        model.denoise(x.clone(), sigma.clone(), &args, &mut capture).unwrap();
        assert_eq!(model.predictor.calls, 1);
        assert!(capture.is_empty());

        let args = ExtraArgs {
            model_options: set_post_cfg_capture(&ModelOptions::default()),
            ..args_with_cond()
        };
        model.denoise(x, sigma, &args, &mut capture).unwrap();
        assert_eq!(model.predictor.calls, 3);
        assert!(!capture.is_empty());
    }
}
