//! Per-pixel parametric fits of variance and bias across the bandwidth sweep.
//!
//! Both models are linear in two coefficients, so each pixel solves a 2x2
//! normal-equations system in closed form:
//!
//! - variance: `n * var(h) ~ a0 + a1 * h^-rank`
//! - bias:     `bias(h)    ~ a0 + a1 * h^2`
//!
//! The determinant is regularized before inversion so coincident or
//! degenerate bandwidth samples still produce finite coefficients.

use ndarray::{Array1, ArrayView1, ArrayView2, Zip};

/// Added to the 2x2 determinant before inversion.
pub const DETERMINANT_REGULARIZER: f64 = 1e-4;

/// Accumulated `XᵀX` and `Xᵀb` for design rows of the form `[1, x]`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct NormalEquations2 {
    xtx: [[f64; 2]; 2],
    xtb: [f64; 2],
}

impl NormalEquations2 {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one observation with regressor `x` and target `y`.
    #[inline]
    pub fn add(&mut self, x: f64, y: f64) {
        self.xtx[0][0] += 1.0;
        self.xtx[0][1] += x;
        self.xtx[1][0] += x;
        self.xtx[1][1] += x * x;
        self.xtb[0] += y;
        self.xtb[1] += x * y;
    }

    /// Regularized determinant of `XᵀX`.
    #[inline]
    pub fn determinant(&self) -> f64 {
        self.xtx[0][0] * self.xtx[1][1] - self.xtx[1][0] * self.xtx[0][1] + DETERMINANT_REGULARIZER
    }

    /// Solve for `(a0, a1)` with the closed-form inverse.
    #[inline]
    pub fn solve(&self) -> (f64, f64) {
        let inv_det = 1.0 / self.determinant();
        let inv = [
            [inv_det * self.xtx[1][1], -inv_det * self.xtx[0][1]],
            [-inv_det * self.xtx[1][0], inv_det * self.xtx[0][0]],
        ];
        let a0 = inv[0][0] * self.xtb[0] + inv[0][1] * self.xtb[1];
        let a1 = inv[1][0] * self.xtb[0] + inv[1][1] * self.xtb[1];
        (a0, a1)
    }
}

/// Per-pixel coefficients `(coef0, coef1)` of a two-parameter model.
#[derive(Debug, Clone)]
pub struct CurveCoefficients {
    pub coef0: Array1<f64>,
    pub coef1: Array1<f64>,
}

impl CurveCoefficients {
    pub fn zeros(n_pix: usize) -> Self {
        Self {
            coef0: Array1::zeros(n_pix),
            coef1: Array1::zeros(n_pix),
        }
    }
}

/// Fit `n * var(h) ~ a0 + a1 * h^-rank` for one pixel.
///
/// A negative slope is physically invalid (variance must grow as `h -> 0`);
/// it is repaired to `(0, |a1|)` rather than refitted.
pub fn fit_variance_pixel(
    bandwidths: ArrayView1<f32>,
    variances: ArrayView1<f32>,
    rank: f32,
    spp: u32,
) -> (f64, f64) {
    let rank = rank as f64;
    let n = spp as f64;
    let mut eq = NormalEquations2::new();
    for (&h, &var) in bandwidths.iter().zip(variances.iter()) {
        let x = (h as f64).powf(-rank);
        eq.add(x, n * var.max(0.0) as f64);
    }
    let (a0, a1) = eq.solve();
    if a1 < 0.0 {
        (0.0, a1.abs())
    } else {
        (a0, a1)
    }
}

/// Fit `bias(h) ~ a0 + a1 * h^2` for one pixel. No sign repair.
pub fn fit_bias_pixel(bandwidths: ArrayView1<f32>, biases: ArrayView1<f32>) -> (f64, f64) {
    let mut eq = NormalEquations2::new();
    for (&h, &bias) in bandwidths.iter().zip(biases.iter()) {
        let h = h as f64;
        eq.add(h * h, bias as f64);
    }
    eq.solve()
}

/// Variance fit for every pixel.
///
/// `width_guess` and `var_map` are `(num_test, n_pix)`.
pub fn var_curve_fit(
    width_guess: ArrayView2<f32>,
    var_map: ArrayView2<f32>,
    ranks: ArrayView1<f32>,
    counts: ArrayView1<u32>,
    out: &mut CurveCoefficients,
) {
    Zip::from(&mut out.coef0)
        .and(&mut out.coef1)
        .and(width_guess.columns())
        .and(var_map.columns())
        .and(ranks)
        .and(counts)
        .par_for_each(|c0, c1, bandwidths, variances, &rank, &spp| {
            let (a0, a1) = fit_variance_pixel(bandwidths, variances, rank, spp);
            *c0 = a0;
            *c1 = a1;
        });
}

/// Bias fit for every pixel.
///
/// `width_guess` and `bias_map` are `(num_test, n_pix)`.
pub fn bias_curve_fit(
    width_guess: ArrayView2<f32>,
    bias_map: ArrayView2<f32>,
    out: &mut CurveCoefficients,
) {
    Zip::from(&mut out.coef0)
        .and(&mut out.coef1)
        .and(width_guess.columns())
        .and(bias_map.columns())
        .par_for_each(|c0, c1, bandwidths, biases| {
            let (a0, a1) = fit_bias_pixel(bandwidths, biases);
            *c0 = a0;
            *c1 = a1;
        });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NUM_TEST;
    use ndarray::Array2;

    fn sweep() -> Array1<f32> {
        Array1::from_shape_fn(NUM_TEST, |k| (k + 1) as f32 / NUM_TEST as f32)
    }

    fn rel_close(a: f64, b: f64, tol: f64) -> bool {
        (a - b).abs() <= tol * b.abs().max(1e-12)
    }

    #[test]
    fn test_solve_exact_line() {
        // y = 2 + 3x, determinant large enough that the regularizer is negligible.
        let mut eq = NormalEquations2::new();
        for x in [0.0, 1.0, 2.0, 3.0, 4.0] {
            eq.add(x, 2.0 + 3.0 * x);
        }
        let (a0, a1) = eq.solve();
        assert!(rel_close(a0, 2.0, 1e-4));
        assert!(rel_close(a1, 3.0, 1e-4));
    }

    #[test]
    fn test_degenerate_samples_stay_finite() {
        // All samples at the same x: det is exactly the regularizer.
        let mut eq = NormalEquations2::new();
        for _ in 0..NUM_TEST {
            eq.add(0.5, 1.0);
        }
        assert!((eq.determinant() - DETERMINANT_REGULARIZER).abs() < 1e-12);
        let (a0, a1) = eq.solve();
        assert!(a0.is_finite());
        assert!(a1.is_finite());
    }

    #[test]
    fn test_variance_fit_recovers_model() {
        let h = sweep();
        let rank = 2.0f32;
        let spp = 16u32;
        // n * var = 0.5 + 0.2 * h^-2
        let var = h.mapv(|h| (0.5 + 0.2 * (h as f64).powf(-2.0)) as f32 / spp as f32);

        let (a0, a1) = fit_variance_pixel(h.view(), var.view(), rank, spp);
        assert!(rel_close(a0, 0.5, 1e-3), "a0 = {a0}");
        assert!(rel_close(a1, 0.2, 1e-3), "a1 = {a1}");
    }

    #[test]
    fn test_variance_fit_repairs_negative_slope() {
        let h = sweep();
        let rank = 2.0f32;
        // Variance that shrinks as h -> 0: negative slope in h^-rank.
        let var = h.mapv(|h| (10.0 - 0.1 * (h as f64).powf(-2.0)) as f32);

        let mut eq = NormalEquations2::new();
        for (&hk, &vk) in h.iter().zip(var.iter()) {
            eq.add((hk as f64).powf(-(rank as f64)), vk.max(0.0) as f64);
        }
        let (_, raw_a1) = eq.solve();
        assert!(raw_a1 < 0.0);

        let (c0, c1) = fit_variance_pixel(h.view(), var.view(), rank, 1);
        assert_eq!(c0, 0.0);
        assert_eq!(c1, raw_a1.abs());
    }

    #[test]
    fn test_variance_fit_ignores_negative_samples() {
        let h = sweep();
        let with_negative = Array1::from_vec(vec![0.4f32, 0.3, -5.0, 0.2, 0.1]);
        let clipped = with_negative.mapv(|v| v.max(0.0));
        assert_eq!(
            fit_variance_pixel(h.view(), with_negative.view(), 2.0, 4),
            fit_variance_pixel(h.view(), clipped.view(), 2.0, 4)
        );
    }

    #[test]
    fn test_bias_fit_keeps_negative_slope() {
        let h = sweep();
        // bias = 0.05 - 0.3 h^2
        let bias = h.mapv(|h| 0.05 - 0.3 * h * h);
        let (a0, a1) = fit_bias_pixel(h.view(), bias.view());
        assert!(a1 < 0.0);
        assert!(rel_close(a1, -0.3, 1e-2), "a1 = {a1}");
        assert!((a0 - 0.05).abs() < 1e-2, "a0 = {a0}");
    }

    #[test]
    fn test_bias_fit_not_scaled_by_spp() {
        let h = sweep();
        let bias = h.mapv(|h| 0.1 * h * h);
        let guesses = Array2::from_shape_fn((NUM_TEST, 2), |(k, _)| h[k]);
        let bias_map = Array2::from_shape_fn((NUM_TEST, 2), |(k, _)| bias[k]);
        let mut out = CurveCoefficients::zeros(2);
        bias_curve_fit(guesses.view(), bias_map.view(), &mut out);
        assert_eq!(out.coef1[0], out.coef1[1]);
        assert_eq!(out.coef1[0], fit_bias_pixel(h.view(), bias.view()).1);
    }

    #[test]
    fn test_parallel_fit_matches_per_pixel() {
        let n_pix = 300;
        let h = sweep();
        let guesses = Array2::from_shape_fn((NUM_TEST, n_pix), |(k, _)| h[k]);
        let var_map =
            Array2::from_shape_fn((NUM_TEST, n_pix), |(k, i)| 0.01 * (i % 7) as f32 + 0.05 / h[k]);
        let ranks = Array1::from_shape_fn(n_pix, |i| 1.0 + (i % 4) as f32 * 0.5);
        let counts = Array1::from_shape_fn(n_pix, |i| 1 + (i % 32) as u32);

        let mut out = CurveCoefficients::zeros(n_pix);
        var_curve_fit(
            guesses.view(),
            var_map.view(),
            ranks.view(),
            counts.view(),
            &mut out,
        );

        for i in 0..n_pix {
            let expected =
                fit_variance_pixel(h.view(), var_map.column(i), ranks[i], counts[i]);
            assert_eq!((out.coef0[i], out.coef1[i]), expected);
            assert!(out.coef1[i] >= 0.0);
        }
    }
}
