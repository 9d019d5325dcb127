//! Denoising model contract
//!
//! Samplers only see the model through [`DenoiseModel`]: one blocking query
//! that maps a noisy latent and a per-batch sigma vector to a denoised latent,
//! plus access to the auxiliary per-pixel tensors the host keeps on the model.

use std::collections::BTreeMap;

use burn::prelude::*;

use crate::error::ModelError;
use crate::guidance::{GuidanceCapture, ModelOptions};

/// Auxiliary per-pixel tensors held by the model handle
///
/// Two field sets exist, one per host surface (see
/// [`HostSurface`](crate::conditioning::HostSurface)). Only the fields of the
/// active surface are rescaled by a
/// [`RescaleScope`](crate::conditioning::RescaleScope).
#[derive(Debug, Clone, Default)]
pub struct Conditioning<B: Backend> {
    /// Full-resolution init latent (WebUI img2img/inpaint)
    pub init_latent: Option<Tensor<B, 4>>,
    /// Weighting mask `[n, h, w]` (WebUI)
    pub mask: Option<Tensor<B, 3>>,
    /// Inverse weighting mask `[n, h, w]` (WebUI)
    pub nmask: Option<Tensor<B, 3>>,
    /// Reference latent (ComfyUI)
    pub latent_image: Option<Tensor<B, 4>>,
    /// Reference noise (ComfyUI)
    pub noise: Option<Tensor<B, 4>>,
}

/// Named auxiliary inputs passed to every model query
#[derive(Debug, Clone, Default)]
pub struct ExtraArgs<B: Backend> {
    /// Conditioning embeddings by name, e.g. `"cond"` / `"uncond"`
    pub embeddings: BTreeMap<String, Tensor<B, 3>>,
    /// Batched denoise mask (ComfyUI)
    pub denoise_mask: Option<Tensor<B, 4>>,
    /// Guidance options
    pub model_options: ModelOptions,
}

impl<B: Backend> ExtraArgs<B> {
    /// Create an empty argument bag
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a named embedding
    pub fn with_embedding(mut self, name: impl Into<String>, embedding: Tensor<B, 3>) -> Self {
        self.embeddings.insert(name.into(), embedding);
        self
    }

    /// Set the denoise mask
    pub fn with_denoise_mask(mut self, mask: Tensor<B, 4>) -> Self {
        self.denoise_mask = Some(mask);
        self
    }
}

/// A denoiser queried by the samplers
pub trait DenoiseModel<B: Backend> {
    /// Predict the denoised latent for `x` at noise level `sigma` (`[batch]`)
    ///
    /// When `args.model_options.capture_uncond` is set, the model stores its
    /// unconditional denoised estimate in `capture` before returning.
    fn denoise(
        &mut self,
        x: Tensor<B, 4>,
        sigma: Tensor<B, 1>,
        args: &ExtraArgs<B>,
        capture: &mut GuidanceCapture<B>,
    ) -> Result<Tensor<B, 4>, ModelError>;

    /// Auxiliary tensors currently installed on the model
    fn conditioning(&self) -> &Conditioning<B>;

    /// Mutable access to the auxiliary tensors
    fn conditioning_mut(&mut self) -> &mut Conditioning<B>;
}

/// Broadcast `sigma` to a `[batch]` vector matching `x`
pub fn sigma_vector<B: Backend>(x: &Tensor<B, 4>, sigma: f32) -> Tensor<B, 1> {
    let [batch, _, _, _] = x.dims();
    Tensor::full([batch], sigma, &x.device())
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray;

    #[test]
    fn test_sigma_vector_matches_batch() {
        let x: Tensor<TestBackend, 4> = Tensor::zeros([3, 4, 2, 2], &Default::default());
        let sigma = sigma_vector(&x, 2.5);
        assert_eq!(sigma.dims(), [3]);
        assert_eq!(sigma.into_data().to_vec::<f32>().unwrap(), vec![2.5; 3]);
    }

    #[test]
    fn test_extra_args_builder() {
        let device = Default::default();
        let args = ExtraArgs::<TestBackend>::new()
            .with_embedding("cond", Tensor::zeros([1, 77, 8], &device))
            .with_denoise_mask(Tensor::ones([1, 1, 8, 8], &device));

        assert!(args.embeddings.contains_key("cond"));
        assert_eq!(args.denoise_mask.unwrap().dims(), [1, 1, 8, 8]);
        assert!(!args.model_options.capture_uncond);
    }
}
