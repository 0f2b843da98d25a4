//! Borrowed views of the renderer's per-pixel accumulation buffers.
//!
//! The renderer owns the sums; the engine only reads them for the duration of
//! one pass. All shapes are checked against the image size before any
//! computation, so a mis-sized buffer is a reported error instead of an
//! out-of-bounds read.

use ndarray::{ArrayView1, ArrayView2};

use crate::config::FeatureMode;
use crate::error::LwrError;

/// Image dimensions. Pixels are addressed row-major, `i = y * width + x`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageDims {
    pub width: usize,
    pub height: usize,
}

impl ImageDims {
    pub fn new(width: usize, height: usize) -> Result<Self, LwrError> {
        if width == 0 || height == 0 || width.checked_mul(height).is_none() {
            return Err(LwrError::InvalidDimensions { width, height });
        }
        Ok(Self { width, height })
    }

    #[inline]
    pub fn n_pix(&self) -> usize {
        self.width * self.height
    }

    /// `(rows, cols)` shape of a single-channel plane.
    #[inline]
    pub fn shape(&self) -> (usize, usize) {
        (self.height, self.width)
    }
}

/// Moving-sample sums, present only in motion feature mode.
#[derive(Debug, Clone, Copy)]
pub struct MotionAccumulators<'a> {
    /// Number of samples per pixel that hit moving geometry.
    pub moving_counts: ArrayView1<'a, u32>,
    /// Sum of texture over moving samples, `(n_pix, 3)`.
    pub texture: ArrayView2<'a, f32>,
    /// Sum of squared texture over moving samples, `(n_pix, 3)`.
    pub texture2: ArrayView2<'a, f32>,
}

/// First and second moment sums for one pass.
///
/// Three-channel buffers are `(n_pix, 3)`; depth and counts are `(n_pix,)`.
#[derive(Debug, Clone, Copy)]
pub struct AccumulatedStats<'a> {
    pub color: ArrayView2<'a, f32>,
    pub color2: ArrayView2<'a, f32>,
    pub normal: ArrayView2<'a, f32>,
    pub normal2: ArrayView2<'a, f32>,
    pub texture: ArrayView2<'a, f32>,
    pub texture2: ArrayView2<'a, f32>,
    pub depth: ArrayView1<'a, f32>,
    pub depth2: ArrayView1<'a, f32>,
    pub sample_counts: ArrayView1<'a, u32>,
    pub motion: Option<MotionAccumulators<'a>>,
}

impl<'a> AccumulatedStats<'a> {
    /// Check shapes and sample counts against `n_pix` and the feature mode.
    pub fn validate(&self, n_pix: usize, mode: FeatureMode) -> Result<(), LwrError> {
        let rgb = [
            ("color", self.color),
            ("color2", self.color2),
            ("normal", self.normal),
            ("normal2", self.normal2),
            ("texture", self.texture),
            ("texture2", self.texture2),
        ];
        for (name, view) in rgb {
            check_shape(name, view.dim(), (n_pix, 3))?;
        }
        check_shape("depth", (self.depth.len(), 1), (n_pix, 1))?;
        check_shape("depth2", (self.depth2.len(), 1), (n_pix, 1))?;
        check_shape(
            "sample_counts",
            (self.sample_counts.len(), 1),
            (n_pix, 1),
        )?;

        if let Some(pixel) = self.sample_counts.iter().position(|&spp| spp == 0) {
            return Err(LwrError::ZeroSampleCount { pixel });
        }

        if mode.is_motion() {
            let motion = self.motion.as_ref().ok_or(LwrError::MovingSamplesRequired)?;
            check_shape(
                "moving_counts",
                (motion.moving_counts.len(), 1),
                (n_pix, 1),
            )?;
            check_shape("texture_moving", motion.texture.dim(), (n_pix, 3))?;
            check_shape("texture_moving2", motion.texture2.dim(), (n_pix, 3))?;

            let over = self
                .sample_counts
                .iter()
                .zip(motion.moving_counts.iter())
                .position(|(&total, &moving)| moving > total);
            if let Some(pixel) = over {
                return Err(LwrError::MovingCountExceeds {
                    pixel,
                    moving: motion.moving_counts[pixel],
                    total: self.sample_counts[pixel],
                });
            }
        }
        Ok(())
    }
}

/// View an interleaved `[c0, c1, c2, c0, ...]` slice as `(n_pix, channels)`.
pub fn channel_view<'a>(
    name: &'static str,
    data: &'a [f32],
    n_pix: usize,
    channels: usize,
) -> Result<ArrayView2<'a, f32>, LwrError> {
    if data.len() != n_pix * channels {
        return Err(LwrError::BufferShape {
            name,
            expected: (n_pix, channels),
            actual: (data.len(), 1),
        });
    }
    ArrayView2::from_shape((n_pix, channels), data).map_err(|_| LwrError::BufferShape {
        name,
        expected: (n_pix, channels),
        actual: (data.len(), 1),
    })
}

fn check_shape(
    name: &'static str,
    actual: (usize, usize),
    expected: (usize, usize),
) -> Result<(), LwrError> {
    if actual != expected {
        return Err(LwrError::BufferShape {
            name,
            expected,
            actual,
        });
    }
    Ok(())
}
