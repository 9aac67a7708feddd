//! Pixel-space image and mask types.
//!
//! Images are held as `(batch, channels, height, width)` tensors with values
//! in `[-1, 1]`, the range the latent encoder consumes and the decoder emits.
//! Masks are single-channel weight maps in `[0, 1]` at pixel resolution.

use ndarray::{Array2, Array4, Axis};

use crate::error::{PipelineError, Result};

/// Mask values above this threshold count as "inside" the mask.
pub const MASK_THRESHOLD: f32 = 0.5;

/// Relative aspect-ratio difference tolerated between a mask and its target.
const ASPECT_TOLERANCE: f64 = 0.01;

/// An image in pixel space with values in `[-1, 1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct PixelImage {
    data: Array4<f32>,
}

impl PixelImage {
    /// Wraps a `(batch, channels, height, width)` tensor.
    pub fn new(data: Array4<f32>) -> Self {
        Self { data }
    }

    /// Builds an image from interleaved 8-bit RGB pixels, mapping `[0, 255]` to `[-1, 1]`.
    pub fn from_rgb8(width: usize, height: usize, pixels: &[u8]) -> Result<Self> {
        if pixels.len() != width * height * 3 {
            return Err(PipelineError::shape_mismatch(
                "RGB pixel buffer",
                &[pixels.len()],
                &[width * height * 3],
            ));
        }
        let data = Array4::from_shape_fn((1, 3, height, width), |(_, c, y, x)| {
            pixels[(y * width + x) * 3 + c] as f32 / 127.5 - 1.0
        });
        Ok(Self { data })
    }

    /// Converts the first image of the batch to interleaved 8-bit RGB.
    ///
    /// Values are mapped from `[-1, 1]` to `[0, 255]` and clamped.
    pub fn to_rgb8(&self) -> Vec<u8> {
        let (_, channels, height, width) = self.data.dim();
        let mut out = Vec::with_capacity(height * width * 3);
        for y in 0..height {
            for x in 0..width {
                for c in 0..3 {
                    let v = self.data[[0, c.min(channels - 1), y, x]];
                    out.push(((v + 1.0) * 127.5).round().clamp(0.0, 255.0) as u8);
                }
            }
        }
        out
    }

    /// Returns the image height in pixels.
    pub fn height(&self) -> usize {
        self.data.dim().2
    }

    /// Returns the image width in pixels.
    pub fn width(&self) -> usize {
        self.data.dim().3
    }

    /// Returns the underlying tensor.
    pub fn tensor(&self) -> &Array4<f32> {
        &self.data
    }

    /// Consumes the image and returns the underlying tensor.
    pub fn into_tensor(self) -> Array4<f32> {
        self.data
    }

    /// Resizes the image with bilinear interpolation (half-pixel centres).
    pub fn resize_bilinear(&self, height: usize, width: usize) -> Self {
        let (batch, channels, in_h, in_w) = self.data.dim();
        if in_h == height && in_w == width {
            return self.clone();
        }
        let ys: Vec<(usize, usize, f32)> =
            (0..height).map(|y| bilinear_taps(y, in_h, height)).collect();
        let xs: Vec<(usize, usize, f32)> =
            (0..width).map(|x| bilinear_taps(x, in_w, width)).collect();

        let data = Array4::from_shape_fn((batch, channels, height, width), |(b, c, y, x)| {
            let (y0, y1, ty) = ys[y];
            let (x0, x1, tx) = xs[x];
            let top = self.data[[b, c, y0, x0]] * (1.0 - tx) + self.data[[b, c, y0, x1]] * tx;
            let bottom = self.data[[b, c, y1, x0]] * (1.0 - tx) + self.data[[b, c, y1, x1]] * tx;
            top * (1.0 - ty) + bottom * ty
        });
        Self { data }
    }

    /// Blacks out every pixel covered by `mask`.
    ///
    /// The mask is resized to the image with nearest-neighbour sampling.
    pub fn masked(&self, mask: &Mask) -> Self {
        let (_, _, height, width) = self.data.dim();
        let inside = mask.binarize(height, width);
        let mut data = self.data.clone();
        for mut image in data.axis_iter_mut(Axis(0)) {
            for mut channel in image.axis_iter_mut(Axis(0)) {
                channel.zip_mut_with(&inside, |v, &m| {
                    if m {
                        *v = -1.0;
                    }
                });
            }
        }
        Self { data }
    }
}

/// A single-channel spatial mask with weights in `[0, 1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Mask {
    data: Array2<f32>,
}

impl Mask {
    /// Wraps a `(height, width)` weight map.
    pub fn new(data: Array2<f32>) -> Self {
        Self { data }
    }

    /// Builds a mask from 8-bit luminance values.
    pub fn from_luma8(width: usize, height: usize, pixels: &[u8]) -> Result<Self> {
        let data = Array2::from_shape_vec(
            (height, width),
            pixels.iter().map(|&p| p as f32 / 255.0).collect(),
        )?;
        Ok(Self { data })
    }

    /// Returns the mask height in pixels.
    pub fn height(&self) -> usize {
        self.data.nrows()
    }

    /// Returns the mask width in pixels.
    pub fn width(&self) -> usize {
        self.data.ncols()
    }

    /// Returns the raw weight map.
    pub fn weights(&self) -> &Array2<f32> {
        &self.data
    }

    /// Resizes the mask with nearest-neighbour sampling.
    pub fn resize_nearest(&self, height: usize, width: usize) -> Array2<f32> {
        let (in_h, in_w) = self.data.dim();
        Array2::from_shape_fn((height, width), |(y, x)| {
            self.data[[nearest_index(y, in_h, height), nearest_index(x, in_w, width)]]
        })
    }

    /// Resizes with nearest-neighbour sampling and thresholds at [`MASK_THRESHOLD`].
    pub fn binarize(&self, height: usize, width: usize) -> Array2<bool> {
        self.resize_nearest(height, width).mapv(|v| v > MASK_THRESHOLD)
    }

    /// Fails unless the mask has the same aspect ratio as a `height`×`width` target.
    ///
    /// Masks are stretched to the target grid, never cropped or padded, so a
    /// different aspect ratio would silently move region boundaries.
    pub fn check_aspect(&self, height: usize, width: usize) -> Result<()> {
        let mask_ratio = self.height() as f64 / self.width().max(1) as f64;
        let target_ratio = height as f64 / width.max(1) as f64;
        if self.height() == 0
            || self.width() == 0
            || ((mask_ratio - target_ratio) / target_ratio).abs() > ASPECT_TOLERANCE
        {
            return Err(PipelineError::mask_mismatch(
                (self.height(), self.width()),
                (height, width),
            ));
        }
        Ok(())
    }
}

fn nearest_index(dst: usize, in_len: usize, out_len: usize) -> usize {
    let src = ((dst as f64 + 0.5) * in_len as f64 / out_len as f64).floor() as usize;
    src.min(in_len - 1)
}

fn bilinear_taps(dst: usize, in_len: usize, out_len: usize) -> (usize, usize, f32) {
    let scale = in_len as f32 / out_len as f32;
    let src = ((dst as f32 + 0.5) * scale - 0.5).clamp(0.0, (in_len - 1) as f32);
    let i0 = src.floor() as usize;
    let i1 = (i0 + 1).min(in_len - 1);
    (i0, i1, src - i0 as f32)
}
