//! Predicted relative error of the final filtered image.
//!
//! At the chosen bandwidth the fitted models give
//!
//! ```text
//! mse = max(0, (c0_var + c1_var * h^-rank) / n + (c1_bias * h^2)^2)
//! ```
//!
//! which is rescaled to a one-sample equivalent with the asymptotic rate
//! `n^(-4/(rank+4))` and divided by squared luminance. The map drives adaptive
//! sampling of the next pass.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rayon::prelude::*;

use crate::config::RAYON_MIN_CHUNK_LEN;
use crate::curve_fit::CurveCoefficients;

/// Keeps the relative error bounded in near-black pixels.
pub const LUMINANCE_EPSILON: f64 = 0.001;

/// Per-channel weight of the luminance average.
const LUMINANCE_WEIGHT: f32 = 0.33333;

/// Quantile at which the sampling density is clamped.
pub const SAMPLING_QUANTILE: f64 = 0.95;

/// Per-pixel fitted model at one bandwidth.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PixelModel {
    pub coef0_var: f64,
    pub coef1_var: f64,
    pub coef1_bias: f64,
    pub rank: f64,
    pub spp: u32,
}

impl PixelModel {
    /// Predicted mean squared error at bandwidth `h`.
    pub fn mse(&self, h: f64) -> f64 {
        let n = self.spp as f64;
        let v = (self.coef0_var + self.coef1_var * h.powf(-self.rank)) / n;
        let b = self.coef1_bias * h * h;
        (v + b * b).max(0.0)
    }

    /// `mse` rescaled to one sample and divided by squared luminance.
    pub fn relative_error(&self, h: f64, luminance: f64) -> f64 {
        let per_sample = self.mse(h) * (self.spp as f64).powf(-4.0 / (self.rank + 4.0));
        per_sample / (luminance * luminance + LUMINANCE_EPSILON)
    }
}

/// Average of the three filtered color channels.
#[inline]
pub fn luminance(rgb: ArrayView1<f32>) -> f64 {
    (rgb[0] * LUMINANCE_WEIGHT + rgb[1] * LUMINANCE_WEIGHT + rgb[2] * LUMINANCE_WEIGHT) as f64
}

/// Fill `map_mse` (`(n_pix, 3)`) with the relative error of every pixel.
///
/// The scalar value is replicated across the three channels.
pub fn estimate_mse_opt_img(
    width_img: ArrayView1<f32>,
    bias: &CurveCoefficients,
    variance: &CurveCoefficients,
    ranks: ArrayView1<f32>,
    counts: ArrayView1<u32>,
    opt_img: ArrayView2<f32>,
    map_mse: &mut Array2<f32>,
) {
    map_mse
        .axis_iter_mut(Axis(0))
        .into_par_iter()
        .enumerate()
        .with_min_len(RAYON_MIN_CHUNK_LEN)
        .for_each(|(i, mut out)| {
            let model = PixelModel {
                coef0_var: variance.coef0[i],
                coef1_var: variance.coef1[i],
                coef1_bias: bias.coef1[i],
                rank: ranks[i] as f64,
                spp: counts[i],
            };
            let rel = model.relative_error(width_img[i] as f64, luminance(opt_img.row(i)));
            out.fill(rel as f32);
        });
}

/// Turn a relative error map into adaptive-sampling weights.
///
/// Uses channel 0, clamps outliers at the 95th percentile and scales by the
/// unclamped mean error, so the weights average to at most one. An empty or
/// all-zero map gives uniform weights.
pub fn sampling_density(error_map: ArrayView2<f32>) -> Array1<f32> {
    let values = error_map.column(0);
    let n = values.len();
    if n == 0 {
        return Array1::zeros(0);
    }

    let mut sorted: Vec<f32> = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let q_idx = ((n as f64 * SAMPLING_QUANTILE) as usize).min(n - 1);
    let cap = sorted[q_idx];

    let sum: f64 = values.iter().map(|&v| v as f64).sum();
    if !(sum.is_finite() && sum > 0.0) {
        return Array1::ones(n);
    }

    let scale = n as f64 / sum;
    values.mapv(|v| (v.min(cap) as f64 * scale) as f32)
}
