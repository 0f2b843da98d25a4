//! Moment reduction: accumulated sums to per-pixel mean and variance.
//!
//! For a pixel with `spp` samples and channel sums `s1`, `s2`:
//!
//! ```text
//! mean = s1 / spp
//! var  = max(0, (s2 - spp * mean^2) / (spp - 1))     if spp > 2
//! var  = max(0, (s2 - spp * mean^2) / spp)           otherwise
//! ```
//!
//! Normal, texture and depth are normalized features, so in static mode their
//! variance is additionally clamped into `[0, 1]`. In motion mode those
//! features are reduced against the still-sample count and the moving texture
//! against the moving-sample count, both floored at one.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, Zip};

use crate::accumulators::AccumulatedStats;
use crate::config::FeatureMode;

/// Unbiased divisor threshold for the full sample count.
/// At `spp <= 2` the `1/(spp-1)` estimator is unstable (or divides by zero).
const UNBIASED_MIN_SPP: u32 = 2;

/// Unbiased divisor threshold for the still/moving split counts.
const UNBIASED_MIN_SPLIT_SPP: u32 = 1;

/// How a channel group's variance is clamped after reduction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarianceClamp {
    /// `var >= 0` (radiometric quantities).
    NonNegative,
    /// `0 <= var <= 1` (features normalized to the unit range).
    UnitRange,
}

impl VarianceClamp {
    #[inline]
    fn apply(self, v: f32) -> f32 {
        // max() first so a NaN from cancellation lands on zero.
        match self {
            VarianceClamp::NonNegative => v.max(0.0),
            VarianceClamp::UnitRange => v.max(0.0).min(1.0),
        }
    }
}

/// Mean and variance of one channel group, both `(n_pix, channels)`.
#[derive(Debug, Clone)]
pub struct ChannelMoments {
    pub mean: Array2<f32>,
    pub variance: Array2<f32>,
}

impl ChannelMoments {
    pub fn zeros(n_pix: usize, channels: usize) -> Self {
        Self {
            mean: Array2::zeros((n_pix, channels)),
            variance: Array2::zeros((n_pix, channels)),
        }
    }
}

/// Reduced statistics for every feature the spatial fit consumes.
#[derive(Debug, Clone)]
pub struct FeatureMoments {
    pub color: ChannelMoments,
    pub normal: ChannelMoments,
    pub texture: ChannelMoments,
    pub depth: ChannelMoments,
    /// Moving-sample texture; allocated only in motion mode.
    pub texture_moving: Option<ChannelMoments>,
}

impl FeatureMoments {
    pub fn zeros(n_pix: usize, mode: FeatureMode) -> Self {
        Self {
            color: ChannelMoments::zeros(n_pix, 3),
            normal: ChannelMoments::zeros(n_pix, 3),
            texture: ChannelMoments::zeros(n_pix, 3),
            depth: ChannelMoments::zeros(n_pix, 1),
            texture_moving: mode.is_motion().then(|| ChannelMoments::zeros(n_pix, 3)),
        }
    }
}

/// Inverse sample count used for the mean and for the variance.
#[inline]
pub fn inverse_counts(spp: u32, unbiased_min_spp: u32) -> (f32, f32) {
    let inv_spp = 1.0 / spp as f32;
    let inv_spp_var = if spp > unbiased_min_spp {
        1.0 / (spp - 1) as f32
    } else {
        inv_spp
    };
    (inv_spp, inv_spp_var)
}

/// Reduce one channel group in parallel over pixels.
///
/// `counts[i]` must be at least one for every pixel.
pub fn reduce_channel_group(
    acc: ArrayView2<f32>,
    acc2: ArrayView2<f32>,
    counts: ArrayView1<u32>,
    unbiased_min_spp: u32,
    clamp: VarianceClamp,
    out: &mut ChannelMoments,
) {
    Zip::from(out.mean.rows_mut())
        .and(out.variance.rows_mut())
        .and(acc.rows())
        .and(acc2.rows())
        .and(counts)
        .par_for_each(|mut mean, mut var, s1, s2, &spp| {
            let (inv_spp, inv_spp_var) = inverse_counts(spp, unbiased_min_spp);
            let n = spp as f32;
            for c in 0..s1.len() {
                let m = s1[c] * inv_spp;
                mean[c] = m;
                var[c] = clamp.apply(inv_spp_var * (s2[c] - n * m * m));
            }
        });
}

/// Reduce every accumulated buffer of a pass into `out`.
///
/// `stats` must already be validated against `out`'s pixel count and `mode`.
pub fn compute_sample_mean(stats: &AccumulatedStats<'_>, mode: FeatureMode, out: &mut FeatureMoments) {
    let counts = stats.sample_counts;

    reduce_channel_group(
        stats.color,
        stats.color2,
        counts,
        UNBIASED_MIN_SPP,
        VarianceClamp::NonNegative,
        &mut out.color,
    );

    let depth = stats.depth.insert_axis(Axis(1));
    let depth2 = stats.depth2.insert_axis(Axis(1));

    match (mode, stats.motion.as_ref(), out.texture_moving.as_mut()) {
        (FeatureMode::Motion, Some(motion), Some(texture_moving)) => {
            let still = floored_still_counts(counts, motion.moving_counts);
            let moving = motion.moving_counts.mapv(|m| m.max(1));

            for (acc, acc2, group) in [
                (stats.normal, stats.normal2, &mut out.normal),
                (stats.texture, stats.texture2, &mut out.texture),
                (depth, depth2, &mut out.depth),
            ] {
                reduce_channel_group(
                    acc,
                    acc2,
                    still.view(),
                    UNBIASED_MIN_SPLIT_SPP,
                    VarianceClamp::NonNegative,
                    group,
                );
            }
            reduce_channel_group(
                motion.texture,
                motion.texture2,
                moving.view(),
                UNBIASED_MIN_SPLIT_SPP,
                VarianceClamp::NonNegative,
                texture_moving,
            );
        }
        _ => {
            for (acc, acc2, group) in [
                (stats.normal, stats.normal2, &mut out.normal),
                (stats.texture, stats.texture2, &mut out.texture),
                (depth, depth2, &mut out.depth),
            ] {
                reduce_channel_group(
                    acc,
                    acc2,
                    counts,
                    UNBIASED_MIN_SPP,
                    VarianceClamp::UnitRange,
                    group,
                );
            }
        }
    }
}

/// `max(spp - moving, 1)` per pixel.
pub fn floored_still_counts(counts: ArrayView1<u32>, moving: ArrayView1<u32>) -> Array1<u32> {
    Zip::from(counts)
        .and(moving)
        .map_collect(|&spp, &m| spp.saturating_sub(m).max(1))
}

/// `max(spp - moving, 0)` per pixel; zero marks a hole in the still features.
pub fn still_counts(counts: ArrayView1<u32>, moving: ArrayView1<u32>) -> Array1<u32> {
    Zip::from(counts)
        .and(moving)
        .map_collect(|&spp, &m| spp.saturating_sub(m))
}
