//! Checkerboard decomposition of a latent grid
//!
//! The latent is cut into non-overlapping 2×2 blocks and the bottom-right cell
//! of every block forms a half-resolution proxy grid. After the proxy has been
//! updated it is written back into the same cells; the other three cells of
//! each block are untouched.
//!
//! Odd heights/widths leave a trailing row/column that is carried verbatim.
//! When both exist, the shared corner cell is taken from the trailing column
//! (its last entry, one row above the corner), not from the trailing row.

use burn::prelude::*;

/// Full-resolution remainder of a latent after its proxy grid was extracted
#[derive(Debug, Clone)]
pub struct Checkerboard<B: Backend> {
    shape: [usize; 4],
    /// Even part as `[b, c, m, 2, n, 2]` blocks
    blocks: Tensor<B, 6>,
    extra_row: Option<Tensor<B, 4>>,
    extra_col: Option<Tensor<B, 4>>,
}

impl<B: Backend> Checkerboard<B> {
    /// Split `x` into blocks and return the `[b, c, h / 2, w / 2]` proxy grid
    ///
    /// Returns `None` when the grid has fewer than 2 rows or columns, since
    /// there is no complete block to take a proxy from.
    pub fn split(x: &Tensor<B, 4>) -> Option<(Self, Tensor<B, 4>)> {
        let shape = x.dims();
        let [b, c, h, w] = shape;
        if h < 2 || w < 2 {
            return None;
        }
        let (m, n) = (h / 2, w / 2);

        let mut body = x.clone();
        let extra_row = (h % 2 == 1).then(|| {
            let row = body.clone().slice([0..b, 0..c, h - 1..h, 0..w]);
            body = body.clone().slice([0..b, 0..c, 0..h - 1, 0..w]);
            row
        });
        let extra_col = (w % 2 == 1).then(|| {
            let col = body.clone().slice([0..b, 0..c, 0..2 * m, w - 1..w]);
            body = body.clone().slice([0..b, 0..c, 0..2 * m, 0..w - 1]);
            col
        });

        let blocks: Tensor<B, 6> = body.reshape([b, c, m, 2, n, 2]);
        let proxy = blocks
            .clone()
            .slice([0..b, 0..c, 0..m, 1..2, 0..n, 1..2])
            .reshape([b, c, m, n]);

        let board = Self {
            shape,
            blocks,
            extra_row,
            extra_col,
        };
        Some((board, proxy))
    }

    /// Spatial shape of the proxy grid
    pub fn proxy_dims(&self) -> [usize; 4] {
        let [b, c, h, w] = self.shape;
        [b, c, h / 2, w / 2]
    }

    /// Write `proxy` back and rebuild the full-resolution grid
    pub fn merge(self, proxy: Tensor<B, 4>) -> Tensor<B, 4> {
        let [b, c, h, w] = self.shape;
        let (m, n) = (h / 2, w / 2);

        let blocks = self.blocks.slice_assign(
            [0..b, 0..c, 0..m, 1..2, 0..n, 1..2],
            proxy.reshape([b, c, m, 1, n, 1]),
        );
        let mut x: Tensor<B, 4> = blocks.reshape([b, c, 2 * m, 2 * n]);

        if let Some(col) = &self.extra_col {
            x = Tensor::cat(vec![x, col.clone()], 3);
        }

        if let Some(row) = self.extra_row {
            let row = match &self.extra_col {
                Some(col) => {
                    let corner = col.clone().slice([0..b, 0..c, 2 * m - 1..2 * m, 0..1]);
                    row.slice_assign([0..b, 0..c, 0..1, w - 1..w], corner)
                }
                None => row,
            };
            x = Tensor::cat(vec![x, row], 2);
        }

        x
    }
}
