//! Gaussian noise sources for churn

use burn::prelude::*;
use burn::tensor::Distribution as TensorDistribution;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal};

/// Source of standard normal noise shaped like a latent
pub trait NoiseSource<B: Backend> {
    /// Standard normal tensor with the shape and device of `x`
    fn randn_like(&mut self, x: &Tensor<B, 4>) -> Tensor<B, 4>;
}

/// Draws from the backend's own RNG
#[derive(Debug, Clone, Copy, Default)]
pub struct BackendNoise;

impl<B: Backend> NoiseSource<B> for BackendNoise {
    fn randn_like(&mut self, x: &Tensor<B, 4>) -> Tensor<B, 4> {
        Tensor::random(x.shape(), TensorDistribution::Normal(0.0, 1.0), &x.device())
    }
}

/// Seeded host-side noise, identical across backends
#[derive(Debug, Clone)]
pub struct SeededNoise {
    rng: ChaCha8Rng,
}

impl SeededNoise {
    /// Create a source from `seed`
    pub fn new(seed: u64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }
}

impl<B: Backend> NoiseSource<B> for SeededNoise {
    fn randn_like(&mut self, x: &Tensor<B, 4>) -> Tensor<B, 4> {
        let shape = x.dims();
        let n: usize = shape.iter().product();
        let values: Vec<f32> = (0..n).map(|_| StandardNormal.sample(&mut self.rng)).collect();
        Tensor::from_data(TensorData::new(values, shape), &x.device())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray;

    fn draw(source: &mut SeededNoise) -> Vec<f32> {
        let x: Tensor<TestBackend, 4> = Tensor::zeros([1, 2, 3, 3], &Default::default());
        source.randn_like(&x).into_data().to_vec::<f32>().unwrap()
    }

    #[test]
    fn test_seeded_noise_is_reproducible() {
        assert_eq!(draw(&mut SeededNoise::new(7)), draw(&mut SeededNoise::new(7)));
        assert_ne!(draw(&mut SeededNoise::new(7)), draw(&mut SeededNoise::new(8)));
    }

    #[test]
    fn test_backend_noise_shape() {
        let x: Tensor<TestBackend, 4> = Tensor::zeros([2, 4, 5, 3], &Default::default());
        let eps = BackendNoise.randn_like(&x);
        assert_eq!(eps.dims(), [2, 4, 5, 3]);
    }
}
