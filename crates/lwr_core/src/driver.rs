//! Per-pass orchestration of the bandwidth sweep.
//!
//! A pass reduces the bound accumulators, sweeps the spatial fit over every
//! candidate bandwidth, fits the bias and variance models, picks the optimal
//! bandwidth per pixel, and refilters at that bandwidth. Intermediate passes
//! also predict the remaining error for adaptive sampling; the terminal pass
//! releases device resources instead.
//!
//! ```text
//! init(stats) ─► BoundPass::run
//!                  ├─ moments          (host)
//!                  ├─ alloc + seed     (first pass only)
//!                  ├─ fill holes       (motion mode)
//!                  ├─ upload, sweep    (backend)
//!                  ├─ curve fits, optimal width, smooth
//!                  ├─ final fit        (backend)
//!                  └─ error map | release
//! ```

use std::time::Instant;

use ndarray::{Array1, ArrayView1, ArrayView2, Axis};
use tracing::{debug, info, warn};

use crate::accumulators::{AccumulatedStats, ImageDims};
use crate::bandwidth::{clamp_to_tested, estimate_optimal_width};
use crate::buffers::{DeviceContext, DeviceState, HostBuffers};
use crate::config::LwrConfig;
use crate::curve_fit::{bias_curve_fit, var_curve_fit};
use crate::error::LwrError;
use crate::error_map::{estimate_mse_opt_img, sampling_density};
use crate::moments::{compute_sample_mean, still_counts};
use crate::spatial::{DeviceUpload, FinalRequest, SpatialFitEngine, SweepOutputs, SweepRequest};

// =============================================================================
// Pass Summary
// =============================================================================

/// Wall-clock time per stage, in nanoseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageTimings {
    pub moments_ns: u128,
    pub fill_holes_ns: u128,
    pub upload_ns: u128,
    pub sweep_ns: u128,
    pub curve_fit_ns: u128,
    pub bandwidth_ns: u128,
    pub final_fit_ns: u128,
    pub error_map_ns: u128,
}

impl StageTimings {
    pub fn total_ns(&self) -> u128 {
        self.moments_ns
            + self.fill_holes_ns
            + self.upload_ns
            + self.sweep_ns
            + self.curve_fit_ns
            + self.bandwidth_ns
            + self.final_fit_ns
            + self.error_map_ns
    }
}

/// Diagnostics of one completed pass.
#[derive(Debug, Clone, PartialEq)]
pub struct PassSummary {
    pub total_samples: u64,
    pub max_samples: u32,
    pub avg_spp: f64,
    pub num_samples_per_iteration: u32,
    pub half_window: usize,
    pub is_final_pass: bool,
    /// Device resources were allocated (and bandwidths seeded) by this pass.
    pub allocated: bool,
    /// The error map was recomputed by this pass.
    pub error_map_updated: bool,
    /// Present when `LwrConfig::profile_timing` is set.
    pub timings: Option<StageTimings>,
}

/// Total, maximum and average samples per pixel.
fn sample_statistics(counts: ArrayView1<u32>) -> (u64, u32, f64) {
    let total: u64 = counts.iter().map(|&c| c as u64).sum();
    let max = counts.iter().copied().max().unwrap_or(0);
    let avg = if counts.is_empty() {
        0.0
    } else {
        total as f64 / counts.len() as f64
    };
    (total, max, avg)
}

// =============================================================================
// Denoiser
// =============================================================================

/// Bandwidth-sweep engine for one image size.
pub struct LwrDenoiser<E: SpatialFitEngine> {
    config: LwrConfig,
    host: HostBuffers,
    device: DeviceContext<E>,
}

impl<E: SpatialFitEngine> LwrDenoiser<E> {
    /// Allocate host buffers for a `width x height` image.
    ///
    /// Device resources are allocated lazily by the first pass.
    pub fn new(width: usize, height: usize, engine: E, config: LwrConfig) -> Result<Self, LwrError> {
        config.validate()?;
        let dims = ImageDims::new(width, height)?;
        Ok(Self {
            host: HostBuffers::new(dims, config.feature_mode),
            device: DeviceContext::new(engine),
            config,
        })
    }

    /// Bind the accumulators of one pass.
    pub fn init<'d, 's>(
        &'d mut self,
        stats: AccumulatedStats<'s>,
    ) -> Result<BoundPass<'d, 's, E>, LwrError> {
        stats.validate(self.host.n_pix(), self.config.feature_mode)?;
        Ok(BoundPass {
            denoiser: self,
            stats,
        })
    }

    pub fn dims(&self) -> ImageDims {
        self.host.dims
    }

    pub fn config(&self) -> &LwrConfig {
        &self.config
    }

    /// Mean color of the last pass, `(n_pix, 3)`.
    pub fn input_image(&self) -> ArrayView2<'_, f32> {
        self.host.features.color.mean.view()
    }

    pub fn ranks(&self) -> ArrayView1<'_, f32> {
        self.host.ranks.view()
    }

    /// Filtered color, `(n_pix, 3)`.
    pub fn opt_image(&self) -> ArrayView2<'_, f32> {
        self.host.opt_img.view()
    }

    pub fn opt_variance(&self) -> ArrayView1<'_, f32> {
        self.host.opt_var.view()
    }

    /// Smoothed optimal bandwidth per pixel.
    pub fn bandwidths(&self) -> ArrayView1<'_, f32> {
        self.host.width_img.view()
    }

    /// Relative error of the last intermediate pass, `(n_pix, 3)`.
    pub fn error_map(&self) -> ArrayView2<'_, f32> {
        self.host.mse.view()
    }

    /// Adaptive-sampling weights derived from `error_map`.
    pub fn sampling_density(&self) -> Array1<f32> {
        sampling_density(self.host.mse.view())
    }

    pub fn host_buffers(&self) -> &HostBuffers {
        &self.host
    }

    pub fn device_state(&self) -> DeviceState {
        self.device.state()
    }

    pub fn engine(&self) -> &E {
        self.device.engine()
    }

    pub fn engine_mut(&mut self) -> &mut E {
        self.device.engine_mut()
    }
}

// =============================================================================
// Pass Execution
// =============================================================================

/// Accumulators bound to a denoiser for one pass.
pub struct BoundPass<'d, 's, E: SpatialFitEngine> {
    denoiser: &'d mut LwrDenoiser<E>,
    stats: AccumulatedStats<'s>,
}

impl<'d, 's, E: SpatialFitEngine> BoundPass<'d, 's, E> {
    /// Run one denoising pass.
    ///
    /// The terminal pass uses the full half window and releases device
    /// resources; other passes use the intermediate window and refresh the
    /// error map.
    pub fn run(
        self,
        num_samples_per_iteration: u32,
        is_final_pass: bool,
    ) -> Result<PassSummary, LwrError> {
        let LwrDenoiser {
            config,
            host,
            device,
        } = self.denoiser;
        let stats = self.stats;
        let dims = host.dims;
        let counts = stats.sample_counts;
        let half_window = config.half_window_for(is_final_pass);
        let profile_timing = config.profile_timing;
        let pass_started = profile_timing.then(Instant::now);
        let mut timings = StageTimings::default();

        macro_rules! timed {
            ($enabled:expr, $acc:expr, $body:block) => {{
                if $enabled {
                    let _t = Instant::now();
                    let _ret = { $body };
                    $acc += _t.elapsed().as_nanos();
                    _ret
                } else {
                    $body
                }
            }};
        }

        if 2 * half_window + 1 > dims.width.min(dims.height) {
            warn!(
                half_window,
                width = dims.width,
                height = dims.height,
                "spatial window exceeds image size"
            );
        }

        timed!(profile_timing, timings.moments_ns, {
            compute_sample_mean(&stats, config.feature_mode, &mut host.features);
        });

        let allocated = device.ensure_ready(dims).map_err(LwrError::backend)?;
        if allocated {
            host.seed_bandwidths();
        }

        let (total_samples, max_samples, avg_spp) = sample_statistics(counts);
        info!(
            total_samples,
            max_samples,
            avg_spp,
            num_samples_per_iteration,
            is_final_pass,
            "lwr pass"
        );

        if let Some(motion) = stats.motion.as_ref().filter(|_| config.feature_mode.is_motion()) {
            timed!(profile_timing, timings.fill_holes_ns, {
                let still = still_counts(counts, motion.moving_counts);
                let engine = device.engine_mut();
                for group in [
                    &mut host.features.normal,
                    &mut host.features.texture,
                    &mut host.features.depth,
                ] {
                    engine
                        .local_gaussian_fill_holes(group.mean.view_mut(), still.view(), dims, half_window)
                        .map_err(LwrError::backend)?;
                }
            });
        }

        timed!(profile_timing, timings.upload_ns, {
            let features = &host.features;
            let upload = DeviceUpload {
                dims,
                color: features.color.mean.view(),
                color_var: features.color.variance.view(),
                texture: features.texture.mean.view(),
                texture_var: features.texture.variance.view(),
                normal: features.normal.mean.view(),
                normal_var: features.normal.variance.view(),
                depth: features.depth.mean.view(),
                depth_var: features.depth.variance.view(),
                texture_moving: features
                    .texture_moving
                    .as_ref()
                    .map(|m| (m.mean.view(), m.variance.view())),
                sample_counts: counts.view(),
                moving_counts: stats
                    .motion
                    .as_ref()
                    .filter(|_| config.feature_mode.is_motion())
                    .map(|m| m.moving_counts.view()),
            };
            device
                .engine_mut()
                .init_device_memory(&upload)
                .map_err(LwrError::backend)?;
        });

        timed!(profile_timing, timings.sweep_ns, {
            let request = SweepRequest {
                dims,
                half_window,
                width_guess: host.width_guess.view(),
                sample_counts: counts.view(),
            };
            let outputs = SweepOutputs {
                fit_map: host.fit_map.view_mut(),
                var_map: host.var_map.view_mut(),
                bias_map: host.bias_map.view_mut(),
                hessians: host.hessians.view_mut(),
                ranks: host.ranks.view_mut(),
            };
            device
                .engine_mut()
                .local_fit_shared(&request, outputs)
                .map_err(LwrError::backend)?;
        });

        timed!(profile_timing, timings.curve_fit_ns, {
            var_curve_fit(
                host.width_guess.view(),
                host.var_map.view(),
                host.ranks.view(),
                counts,
                &mut host.var_coefs,
            );
            bias_curve_fit(host.width_guess.view(), host.bias_map.view(), &mut host.bias_coefs);
        });

        timed!(profile_timing, timings.bandwidth_ns, {
            estimate_optimal_width(
                host.width_guess.view(),
                &host.bias_coefs,
                &host.var_coefs,
                host.ranks.view(),
                counts,
                &mut host.width_img,
            );
            device
                .engine_mut()
                .local_gaussian_smooth(
                    host.width_img.view_mut().insert_axis(Axis(1)),
                    dims,
                    config.bandwidth_smoothing_sigma,
                )
                .map_err(LwrError::backend)?;
            clamp_to_tested(host.width_guess.view(), &mut host.width_img);
        });

        timed!(profile_timing, timings.final_fit_ns, {
            let request = FinalRequest {
                dims,
                half_window,
                bandwidth: host.width_img.view(),
            };
            device
                .engine_mut()
                .local_fit_shared_final(&request, host.opt_img.view_mut(), host.opt_var.view_mut())
                .map_err(LwrError::backend)?;
            host.opt_var.mapv_inplace(|v| v.max(0.0));
        });

        let error_map_updated = !is_final_pass;
        if is_final_pass {
            device.release();
        } else {
            timed!(profile_timing, timings.error_map_ns, {
                estimate_mse_opt_img(
                    host.width_img.view(),
                    &host.bias_coefs,
                    &host.var_coefs,
                    host.ranks.view(),
                    counts,
                    host.opt_img.view(),
                    &mut host.mse,
                );
                device
                    .engine_mut()
                    .local_gaussian_smooth(host.mse.view_mut(), dims, config.error_smoothing_sigma)
                    .map_err(LwrError::backend)?;
            });
        }

        let timings = pass_started.map(|started| {
            debug!(
                width = dims.width,
                height = dims.height,
                wall_ms = started.elapsed().as_secs_f64() * 1e3,
                moments_ms = timings.moments_ns as f64 * 1e-6,
                fill_holes_ms = timings.fill_holes_ns as f64 * 1e-6,
                upload_ms = timings.upload_ns as f64 * 1e-6,
                sweep_ms = timings.sweep_ns as f64 * 1e-6,
                curve_fit_ms = timings.curve_fit_ns as f64 * 1e-6,
                bandwidth_ms = timings.bandwidth_ns as f64 * 1e-6,
                final_fit_ms = timings.final_fit_ns as f64 * 1e-6,
                error_map_ms = timings.error_map_ns as f64 * 1e-6,
                "lwr pass timings"
            );
            timings
        });

        Ok(PassSummary {
            total_samples,
            max_samples,
            avg_spp,
            num_samples_per_iteration,
            half_window,
            is_final_pass,
            allocated,
            error_map_updated,
            timings,
        })
    }
}
