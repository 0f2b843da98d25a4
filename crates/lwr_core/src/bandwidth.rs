//! MISE-optimal bandwidth per pixel.
//!
//! With bias `~ b * h^2` and variance `~ v * h^-d / n`, the mean integrated
//! squared error is minimized at
//!
//! ```text
//! h_opt = (d * v / (4 * b^2 * n)) ^ (1 / (d + 4))
//! ```
//!
//! where `d` is the pixel's rank. The result is capped at the largest tested
//! bandwidth (no extrapolation) and then floored at `MIN_BANDWIDTH`.

use ndarray::{Array1, ArrayView1, ArrayView2, Zip};

use crate::curve_fit::CurveCoefficients;

/// Lower bound of every estimated bandwidth.
pub const MIN_BANDWIDTH: f64 = 0.01;

/// Optimal bandwidth for one pixel.
///
/// `bias_slope` and `var_slope` are the `coef1` values of the two curve fits,
/// `max_tested` the largest bandwidth of the sweep.
///
/// A zero bias slope yields the floor rather than the cap.
pub fn optimal_bandwidth(bias_slope: f64, var_slope: f64, rank: f64, spp: u32, max_tested: f64) -> f64 {
    let n = spp as f64;
    let b = bias_slope;
    let v = var_slope;

    let opt_h = if v <= 0.0 {
        0.0
    } else if b != 0.0 {
        ((rank * v) / (4.0 * b * b * n)).powf(1.0 / (4.0 + rank))
    } else {
        0.0
    };

    // Cap first, floor last: degenerate pixels end on the floor.
    opt_h.min(max_tested).max(MIN_BANDWIDTH)
}

/// Estimate `width_img` for every pixel.
///
/// `width_guess` is `(num_test, n_pix)`; its last row bounds the result.
pub fn estimate_optimal_width(
    width_guess: ArrayView2<f32>,
    bias: &CurveCoefficients,
    variance: &CurveCoefficients,
    ranks: ArrayView1<f32>,
    counts: ArrayView1<u32>,
    width_img: &mut Array1<f32>,
) {
    let last = width_guess.nrows() - 1;
    Zip::from(width_img)
        .and(&bias.coef1)
        .and(&variance.coef1)
        .and(ranks)
        .and(counts)
        .and(width_guess.row(last))
        .par_for_each(|out, &b, &v, &rank, &spp, &max_h| {
            *out = optimal_bandwidth(b, v, rank as f64, spp, max_h as f64) as f32;
        });
}

/// Pull `width_img` back into `[MIN_BANDWIDTH, largest tested bandwidth]`.
///
/// Smoothing a map that sits on either bound can drift past it by an ulp.
pub fn clamp_to_tested(width_guess: ArrayView2<f32>, width_img: &mut Array1<f32>) {
    let last = width_guess.nrows() - 1;
    let floor = MIN_BANDWIDTH as f32;
    Zip::from(width_img)
        .and(width_guess.row(last))
        .par_for_each(|h, &max_h| *h = h.min(max_h).max(floor));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NUM_TEST;

    fn rel_close(a: f64, b: f64, tol: f64) -> bool {
        (a - b).abs() <= tol * b.abs()
    }

    #[test]
    fn test_zero_bias_slope_falls_to_floor() {
        let h = optimal_bandwidth(0.0, 5.0, 2.0, 1000, 1.0);
        assert_eq!(h, MIN_BANDWIDTH);
    }

    #[test]
    fn test_typical_pixel_matches_closed_form() {
        let expected = (2.0f64 * 2.0 / (4.0 * 0.01 * 16.0)).powf(1.0 / 6.0);
        // Cap above the optimum so the closed form is observable.
        let h = optimal_bandwidth(0.1, 2.0, 2.0, 16, 10.0);
        assert!(rel_close(h, expected, 1e-6), "h = {h}, expected {expected}");
    }

    #[test]
    fn test_typical_pixel_capped_by_sweep() {
        // (4 / 0.64)^(1/6) ~ 1.357 exceeds the unit sweep.
        let h = optimal_bandwidth(0.1, 2.0, 2.0, 16, 1.0);
        assert_eq!(h, 1.0);
    }

    #[test]
    fn test_non_positive_variance_slope_floors() {
        assert_eq!(optimal_bandwidth(0.3, 0.0, 2.0, 8, 1.0), MIN_BANDWIDTH);
        assert_eq!(optimal_bandwidth(0.3, -1.0, 2.0, 8, 1.0), MIN_BANDWIDTH);
    }

    #[test]
    fn test_negative_bias_slope_uses_square() {
        let pos = optimal_bandwidth(0.2, 0.01, 3.0, 64, 1.0);
        let neg = optimal_bandwidth(-0.2, 0.01, 3.0, 64, 1.0);
        assert_eq!(pos, neg);
    }

    #[test]
    fn test_more_samples_shrink_bandwidth() {
        let few = optimal_bandwidth(1.0, 0.01, 2.0, 4, 1.0);
        let many = optimal_bandwidth(1.0, 0.01, 2.0, 4096, 1.0);
        assert!(many < few);
    }

    #[test]
    fn test_clamp_restores_bounds_after_smoothing() {
        let dims = crate::accumulators::ImageDims::new(13, 5).unwrap();
        let n_pix = dims.n_pix();
        let guesses =
            ndarray::Array2::from_shape_fn((NUM_TEST, n_pix), |(k, _)| (k + 1) as f32 / NUM_TEST as f32);
        let mut width = Array1::from_elem(n_pix, MIN_BANDWIDTH as f32);
        width[7] = 1.0;
        width[8] = 1.0;

        crate::smoothing::gaussian_smooth(width.view_mut().insert_axis(ndarray::Axis(1)), dims, 1.0);
        clamp_to_tested(guesses.view(), &mut width);

        for i in 0..n_pix {
            assert!(width[i] >= MIN_BANDWIDTH as f32, "pixel {i}: {}", width[i]);
            assert!(width[i] <= guesses[[NUM_TEST - 1, i]], "pixel {i}: {}", width[i]);
        }
    }

    #[test]
    fn test_clamp_keeps_smoothed_floor_exact() {
        let dims = crate::accumulators::ImageDims::new(7, 7).unwrap();
        let n_pix = dims.n_pix();
        let guesses =
            ndarray::Array2::from_shape_fn((NUM_TEST, n_pix), |(k, _)| (k + 1) as f32 / NUM_TEST as f32);
        let mut width = Array1::from_elem(n_pix, MIN_BANDWIDTH as f32);

        crate::smoothing::gaussian_smooth(width.view_mut().insert_axis(ndarray::Axis(1)), dims, 1.0);
        clamp_to_tested(guesses.view(), &mut width);

        assert!(width.iter().all(|&h| h == MIN_BANDWIDTH as f32));
    }

    #[test]
    fn test_clamp_caps_at_largest_guess() {
        let guesses = ndarray::Array2::from_shape_fn((NUM_TEST, 3), |(k, i)| {
            (k + 1) as f32 / NUM_TEST as f32 * (i + 1) as f32 * 0.25
        });
        let mut width = Array1::from_vec(vec![0.5f32, 0.0, 2.0]);
        clamp_to_tested(guesses.view(), &mut width);
        assert_eq!(width[0], 0.25);
        assert_eq!(width[1], MIN_BANDWIDTH as f32);
        assert_eq!(width[2], 0.75);
    }

    #[test]
    fn test_width_image_bounds() {
        let n_pix = 200;
        let guesses =
            ndarray::Array2::from_shape_fn((NUM_TEST, n_pix), |(k, _)| (k + 1) as f32 / NUM_TEST as f32);
        let mut bias = CurveCoefficients::zeros(n_pix);
        let mut variance = CurveCoefficients::zeros(n_pix);
        for i in 0..n_pix {
            bias.coef1[i] = (i as f64 - 100.0) * 0.01;
            variance.coef1[i] = (i % 5) as f64 * 0.7;
        }
        let ranks = Array1::from_shape_fn(n_pix, |i| 1.0 + (i % 3) as f32);
        let counts = Array1::from_shape_fn(n_pix, |i| 1 + i as u32);
        let mut width = Array1::zeros(n_pix);

        estimate_optimal_width(
            guesses.view(),
            &bias,
            &variance,
            ranks.view(),
            counts.view(),
            &mut width,
        );

        for i in 0..n_pix {
            assert!(width[i] >= MIN_BANDWIDTH as f32);
            assert!(width[i] <= guesses[[NUM_TEST - 1, i]]);
            if variance.coef1[i] == 0.0 || bias.coef1[i] == 0.0 {
                assert_eq!(width[i], MIN_BANDWIDTH as f32);
            }
        }
    }
}
