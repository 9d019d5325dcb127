//! Nearest-neighbour grid resampling
//!
//! Resizes `[batch, channel, height, width]` tensors by gathering source rows
//! and columns, so the result is exact and never blends neighbouring values.
//! Index math follows the usual `nearest` / `nearest-exact` conventions:
//!
//! - nearest: `src = min(floor(dst * scale), in - 1)`
//! - nearest-exact: `src = min(floor((dst + 0.5) * scale), in - 1)`
//!
//! where `scale = in / out` when a target size is given, and `1 / factor` when
//! a scale factor is given.

use burn::prelude::*;
use serde::{Deserialize, Serialize};

/// Interpolation policy for [`resize`] and [`rescale`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResampleMode {
    /// Pixel-centre aligned nearest neighbour
    #[default]
    NearestExact,
    /// Legacy nearest neighbour (top-left aligned)
    Nearest,
}

impl ResampleMode {
    fn source_index(self, dst: usize, scale: f32, in_size: usize) -> usize {
        let src = match self {
            ResampleMode::NearestExact => ((dst as f32 + 0.5) * scale).floor(),
            ResampleMode::Nearest => (dst as f32 * scale).floor(),
        };
        (src as usize).min(in_size - 1)
    }
}

/// Resize a 4D tensor to `size = [height, width]`
pub fn resize<B: Backend>(x: Tensor<B, 4>, size: [usize; 2], mode: ResampleMode) -> Tensor<B, 4> {
    let [_, _, h, w] = x.dims();
    let scale = [h as f32 / size[0] as f32, w as f32 / size[1] as f32];
    gather(x, size, scale, mode)
}

/// Resize a 4D tensor by `factor = [height_factor, width_factor]`
///
/// The output size is `floor(in * factor)` on each axis.
pub fn rescale<B: Backend>(x: Tensor<B, 4>, factor: [f64; 2], mode: ResampleMode) -> Tensor<B, 4> {
    let [_, _, h, w] = x.dims();
    let size = [scaled_len(h, factor[0]), scaled_len(w, factor[1])];
    let scale = [(1.0 / factor[0]) as f32, (1.0 / factor[1]) as f32];
    gather(x, size, scale, mode)
}

/// Resize a 3D mask `[n, height, width]` to `size`
pub fn resize_mask<B: Backend>(
    mask: Tensor<B, 3>,
    size: [usize; 2],
    mode: ResampleMode,
) -> Tensor<B, 3> {
    let [n, _, _] = mask.dims();
    resize(mask.unsqueeze::<4>(), size, mode).reshape([n, size[0], size[1]])
}

/// Output length of an axis scaled by `factor`
pub fn scaled_len(len: usize, factor: f64) -> usize {
    (len as f64 * factor).floor() as usize
}

fn gather<B: Backend>(
    x: Tensor<B, 4>,
    size: [usize; 2],
    scale: [f32; 2],
    mode: ResampleMode,
) -> Tensor<B, 4> {
    let [_, _, h, w] = x.dims();
    if size == [h, w] && scale == [1.0, 1.0] {
        return x;
    }

    let device = x.device();
    let rows = index_tensor::<B>(&source_indices(h, size[0], scale[0], mode), &device);
    let cols = index_tensor::<B>(&source_indices(w, size[1], scale[1], mode), &device);

    x.select(2, rows).select(3, cols)
}

fn source_indices(in_size: usize, out_size: usize, scale: f32, mode: ResampleMode) -> Vec<i64> {
    (0..out_size)
        .map(|dst| mode.source_index(dst, scale, in_size) as i64)
        .collect()
}

fn index_tensor<B: Backend>(indices: &[i64], device: &B::Device) -> Tensor<B, 1, Int> {
    Tensor::from_data(TensorData::new(indices.to_vec(), [indices.len()]), device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray;

    fn ramp(shape: [usize; 4]) -> Tensor<TestBackend, 4> {
        let n: usize = shape.iter().product();
        let values: Vec<f32> = (0..n).map(|v| v as f32).collect();
        Tensor::from_data(TensorData::new(values, shape), &Default::default())
    }

    fn values(x: Tensor<TestBackend, 4>) -> Vec<f32> {
        x.into_data().to_vec::<f32>().unwrap()
    }

    #[test]
    fn test_source_indices_nearest_exact() {
        // 4 -> 2 picks the second row of each pair
        assert_eq!(source_indices(4, 2, 2.0, ResampleMode::NearestExact), vec![1, 3]);
        // 2 -> 4 repeats each row twice
        assert_eq!(source_indices(2, 4, 0.5, ResampleMode::NearestExact), vec![0, 0, 1, 1]);
    }

    #[test]
    fn test_source_indices_nearest() {
        assert_eq!(source_indices(4, 2, 2.0, ResampleMode::Nearest), vec![0, 2]);
        assert_eq!(source_indices(3, 5, 0.6, ResampleMode::Nearest), vec![0, 0, 1, 1, 2]);
    }

    #[test]
    fn test_rescale_by_smea_factor() {
        let x = ramp([1, 2, 8, 6]);
        let up = rescale(x, [1.25, 1.25], ResampleMode::NearestExact);
        assert_eq!(up.dims(), [1, 2, 10, 7]);
    }

    #[test]
    fn test_upscale_indices_clamp_to_edge() {
        // 8 * 1.25 = 10 outputs, scale 0.8: last index floor(9.5 * 0.8) = 7
        let idx = source_indices(8, 10, 0.8, ResampleMode::NearestExact);
        assert_eq!(idx, vec![0, 1, 2, 2, 3, 4, 5, 6, 6, 7]);
    }

    #[test]
    fn test_resize_same_size_is_identity() {
        let x = ramp([2, 3, 5, 7]);
        let expected = values(x.clone());
        let y = resize(x, [5, 7], ResampleMode::NearestExact);
        assert_eq!(values(y), expected);
    }

    #[test]
    fn test_down_up_round_trip_on_block_constant_input() {
        // 2x2 blocks of constant value
        let small = ramp([1, 1, 3, 2]);
        let big = resize(small, [6, 4], ResampleMode::NearestExact);
        let expected = values(big.clone());

        let down = resize(big, [3, 2], ResampleMode::NearestExact);
        let back = resize(down, [6, 4], ResampleMode::NearestExact);
        assert_eq!(values(back), expected);
    }

    #[test]
    fn test_resize_preserves_batch_and_channels() {
        let x = ramp([3, 4, 6, 6]);
        let y = resize(x, [2, 9], ResampleMode::Nearest);
        assert_eq!(y.dims(), [3, 4, 2, 9]);
    }

    #[test]
    fn test_resize_mask() {
        let mask: Tensor<TestBackend, 3> = Tensor::ones([1, 4, 4], &Default::default());
        let resized = resize_mask(mask, [2, 3], ResampleMode::NearestExact);
        assert_eq!(resized.dims(), [1, 2, 3]);
        assert!(resized.into_data().to_vec::<f32>().unwrap().iter().all(|&v| v == 1.0));
    }

    #[test]
    fn test_mode_serde_names() {
        let json = serde_json::to_string(&ResampleMode::NearestExact).unwrap();
        assert_eq!(json, "\"nearest_exact\"");
    }
}
