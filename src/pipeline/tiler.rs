//! Tiled evaluation over the latent grid.
//!
//! The grid is covered by overlapping square tiles. Each tile result is
//! weighted by a ramp that rises from the tile border towards its centre
//! (borders on the edge of the full grid are not ramped), accumulated,
//! and normalised by the summed weights.

use ndarray::{s, Array2, Array4};

use crate::error::{PipelineError, Result};

/// Latent rows `h_start..h_end` and columns `w_start..w_end` of one tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileBounds {
    pub h_start: usize,
    pub h_end: usize,
    pub w_start: usize,
    pub w_end: usize,
}

impl TileBounds {
    /// Tile height.
    pub fn height(&self) -> usize {
        self.h_end - self.h_start
    }

    /// Tile width.
    pub fn width(&self) -> usize {
        self.w_end - self.w_start
    }
}

/// Everything a tile evaluation needs to know about its tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileContext {
    /// Position of the tile in evaluation order.
    pub index: usize,
    /// Tile bounds in the full grid.
    pub bounds: TileBounds,
    /// Full grid height.
    pub full_height: usize,
    /// Full grid width.
    pub full_width: usize,
}

impl TileContext {
    /// Which tile edges lie on the full grid border: `[top, bottom, left, right]`.
    pub fn on_border(&self) -> [bool; 4] {
        [
            self.bounds.h_start == 0,
            self.bounds.h_end >= self.full_height,
            self.bounds.w_start == 0,
            self.bounds.w_end >= self.full_width,
        ]
    }
}

/// Evaluates one tile. The returned tensor must cover exactly the tile bounds.
pub trait TileEvaluator {
    /// Evaluates the tile described by `tile`.
    fn evaluate_tile(&mut self, tile: &TileContext) -> Result<Array4<f32>>;
}

/// Splits a grid into tiles and stitches tile results back together.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileWorker {
    tile_size: usize,
    tile_stride: usize,
}

impl TileWorker {
    /// Creates a worker; `tile_stride` must be in `1..=tile_size`.
    pub fn new(tile_size: usize, tile_stride: usize) -> Result<Self> {
        if tile_size == 0 || tile_stride == 0 || tile_stride > tile_size {
            return Err(PipelineError::invalid_config(format!(
                "invalid tiling: size {} stride {}",
                tile_size, tile_stride
            )));
        }
        Ok(Self {
            tile_size,
            tile_stride,
        })
    }

    /// Returns true if a `height`×`width` grid spans more than one tile.
    pub fn needs_tiling(&self, height: usize, width: usize) -> bool {
        height > self.tile_size || width > self.tile_size
    }

    /// Lists the tiles covering a `height`×`width` grid, row-major.
    pub fn plan(&self, height: usize, width: usize) -> Vec<TileContext> {
        let rows = spans(height, self.tile_size, self.tile_stride);
        let cols = spans(width, self.tile_size, self.tile_stride);
        rows.iter()
            .flat_map(|&(h_start, h_end)| {
                cols.iter().map(move |&(w_start, w_end)| TileBounds {
                    h_start,
                    h_end,
                    w_start,
                    w_end,
                })
            })
            .enumerate()
            .map(|(index, bounds)| TileContext {
                index,
                bounds,
                full_height: height,
                full_width: width,
            })
            .collect()
    }

    /// Evaluates every tile of a `height`×`width` grid and blends the results.
    pub fn tiled_forward<E>(
        &self,
        height: usize,
        width: usize,
        evaluator: &mut E,
    ) -> Result<Array4<f32>>
    where
        E: TileEvaluator + ?Sized,
    {
        let mut values: Option<Array4<f32>> = None;
        let mut weight = Array2::<f32>::zeros((height, width));

        for tile in self.plan(height, width) {
            let b = tile.bounds;
            let output = evaluator.evaluate_tile(&tile)?;
            let (batch, channels, th, tw) = output.dim();
            if th != b.height() || tw != b.width() {
                return Err(PipelineError::shape_mismatch(
                    "tile output",
                    output.shape(),
                    &[batch, channels, b.height(), b.width()],
                ));
            }

            let acc = values.get_or_insert_with(|| Array4::zeros((batch, channels, height, width)));
            if acc.dim().0 != batch || acc.dim().1 != channels {
                return Err(PipelineError::shape_mismatch(
                    "tile output",
                    output.shape(),
                    &[acc.dim().0, acc.dim().1, th, tw],
                ));
            }

            let mask = build_mask(th, tw, tile.on_border());
            let mut region = acc.slice_mut(s![.., .., b.h_start..b.h_end, b.w_start..b.w_end]);
            region += &(&output * &mask);
            let mut w = weight.slice_mut(s![b.h_start..b.h_end, b.w_start..b.w_end]);
            w += &mask;
        }

        let mut values = values
            .ok_or_else(|| PipelineError::invalid_request("tiled evaluation over an empty grid"))?;
        values /= &weight;
        Ok(values)
    }
}

/// Start/end pairs covering `len` with windows of `size` every `stride`.
///
/// The last window is shifted back to end exactly at `len`; windows that
/// would only repeat the end of the previous window are skipped.
fn spans(len: usize, size: usize, stride: usize) -> Vec<(usize, usize)> {
    if len <= size {
        return vec![(0, len)];
    }
    let mut out = Vec::new();
    let mut start = 0;
    while start < len {
        if start >= stride && start - stride + size >= len {
            break;
        }
        if start + size > len {
            out.push((len - size, len));
        } else {
            out.push((start, start + size));
        }
        start += stride;
    }
    out
}

/// Blend weights for one tile: distance to the nearest inner border,
/// clipped to `[1, (h + w) / 4]` and normalised to `(0, 1]`.
fn build_mask(height: usize, width: usize, on_border: [bool; 4]) -> Array2<f32> {
    let border_width = ((height + width) / 4).max(1);
    let [top, bottom, left, right] = on_border;
    Array2::from_shape_fn((height, width), |(y, x)| {
        let distances = [
            if top { border_width } else { y + 1 },
            if bottom { border_width } else { height - y },
            if left { border_width } else { x + 1 },
            if right { border_width } else { width - x },
        ];
        let d = distances.into_iter().min().unwrap_or(border_width).clamp(1, border_width);
        d as f32 / border_width as f32
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::latent::generate_noise;

    struct AffineTiles<'a> {
        input: &'a Array4<f32>,
        calls: Vec<TileBounds>,
    }

    impl TileEvaluator for AffineTiles<'_> {
        fn evaluate_tile(&mut self, tile: &TileContext) -> Result<Array4<f32>> {
            self.calls.push(tile.bounds);
            let b = tile.bounds;
            let slice = self.input.slice(s![.., .., b.h_start..b.h_end, b.w_start..b.w_end]);
            Ok(slice.mapv(|v| 2.0 * v + 1.0))
        }
    }

    #[test]
    fn spans_cover_and_clamp() {
        assert_eq!(spans(8, 16, 8), vec![(0, 8)]);
        assert_eq!(spans(16, 16, 8), vec![(0, 16)]);
        assert_eq!(spans(20, 8, 4), vec![(0, 8), (4, 12), (8, 16), (12, 20)]);
        assert_eq!(spans(22, 8, 4), vec![(0, 8), (4, 12), (8, 16), (12, 20), (14, 22)]);
    }

    #[test]
    fn plan_is_row_major() {
        let worker = TileWorker::new(8, 4).unwrap();
        let plan = worker.plan(12, 16);
        assert_eq!(plan.len(), 2 * 3);
        assert_eq!(plan[0].bounds, TileBounds { h_start: 0, h_end: 8, w_start: 0, w_end: 8 });
        assert_eq!(plan[1].bounds, TileBounds { h_start: 0, h_end: 8, w_start: 4, w_end: 12 });
        assert_eq!(plan[5].bounds, TileBounds { h_start: 4, h_end: 12, w_start: 8, w_end: 16 });
        assert_eq!(plan[5].on_border(), [false, true, false, true]);
    }

    #[test]
    fn mask_ramps_on_inner_edges_only() {
        let mask = build_mask(8, 8, [true, false, true, true]);
        // border width = 4: rows near the bottom fade, top rows stay at 1.
        assert_eq!(mask[[0, 3]], 1.0);
        assert_eq!(mask[[7, 3]], 0.25);
        assert_eq!(mask[[6, 3]], 0.5);
        assert!(mask.iter().all(|&v| v > 0.0 && v <= 1.0));
    }

    #[test]
    fn tiled_matches_untiled_for_local_model() {
        let input = generate_noise((1, 16, 24, 20), 5);
        let expected = input.mapv(|v| 2.0 * v + 1.0);

        let worker = TileWorker::new(8, 4).unwrap();
        let mut evaluator = AffineTiles { input: &input, calls: Vec::new() };
        let stitched = worker.tiled_forward(24, 20, &mut evaluator).unwrap();

        assert!(evaluator.calls.len() > 1);
        let max_err = (&stitched - &expected).mapv(f32::abs).fold(0.0_f32, |a, &b| a.max(b));
        assert!(max_err < 1e-5, "max error {}", max_err);
    }

    #[test]
    fn wrong_tile_shape_is_rejected() {
        struct Broken;
        impl TileEvaluator for Broken {
            fn evaluate_tile(&mut self, _tile: &TileContext) -> Result<Array4<f32>> {
                Ok(Array4::zeros((1, 1, 3, 3)))
            }
        }
        let worker = TileWorker::new(8, 4).unwrap();
        assert!(worker.tiled_forward(16, 16, &mut Broken).is_err());
    }

    #[test]
    fn invalid_worker() {
        assert!(TileWorker::new(8, 0).is_err());
        assert!(TileWorker::new(8, 16).is_err());
        assert!(!TileWorker::new(8, 4).unwrap().needs_tiling(8, 8));
        assert!(TileWorker::new(8, 4).unwrap().needs_tiling(8, 9));
    }
}
