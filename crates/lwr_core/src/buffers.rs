//! Engine-owned buffers and accelerator lifecycle.
//!
//! `HostBuffers` holds every derived, per-bandwidth and output array and is
//! sized once at construction. `DeviceContext` owns the backend together with
//! an explicit allocation state, so device memory is released exactly once:
//! on the terminal pass, or on drop if the engine goes away early.

use ndarray::{Array1, Array2, Array3};
use tracing::debug;

use crate::accumulators::ImageDims;
use crate::config::{FeatureMode, FEATURE_DIMENSIONS, MAX_BANDWIDTH, NUM_TEST};
use crate::curve_fit::CurveCoefficients;
use crate::moments::FeatureMoments;
use crate::spatial::SpatialFitEngine;

/// Host-side working and output buffers of one engine instance.
#[derive(Debug, Clone)]
pub struct HostBuffers {
    pub dims: ImageDims,
    /// Mean and variance of every feature.
    pub features: FeatureMoments,
    /// Candidate bandwidths, `(NUM_TEST, n_pix)`.
    pub width_guess: Array2<f32>,
    /// Fitted color per bandwidth, `(NUM_TEST, n_pix, 3)`.
    pub fit_map: Array3<f32>,
    /// Variance per bandwidth, `(NUM_TEST, n_pix)`.
    pub var_map: Array2<f32>,
    /// Bias per bandwidth, `(NUM_TEST, n_pix)`.
    pub bias_map: Array2<f32>,
    /// Feature-space metric, `(n_pix, FEATURE_DIMENSIONS)`.
    pub hessians: Array2<f32>,
    pub ranks: Array1<f32>,
    pub bias_coefs: CurveCoefficients,
    pub var_coefs: CurveCoefficients,
    /// Optimal bandwidth per pixel.
    pub width_img: Array1<f32>,
    /// Final filtered color, `(n_pix, 3)`.
    pub opt_img: Array2<f32>,
    pub opt_var: Array1<f32>,
    /// Predicted relative error, `(n_pix, 3)`.
    pub mse: Array2<f32>,
}

impl HostBuffers {
    pub fn new(dims: ImageDims, mode: FeatureMode) -> Self {
        let n_pix = dims.n_pix();
        Self {
            dims,
            features: FeatureMoments::zeros(n_pix, mode),
            width_guess: Array2::zeros((NUM_TEST, n_pix)),
            fit_map: Array3::zeros((NUM_TEST, n_pix, 3)),
            var_map: Array2::zeros((NUM_TEST, n_pix)),
            bias_map: Array2::zeros((NUM_TEST, n_pix)),
            hessians: Array2::zeros((n_pix, FEATURE_DIMENSIONS)),
            ranks: Array1::zeros(n_pix),
            bias_coefs: CurveCoefficients::zeros(n_pix),
            var_coefs: CurveCoefficients::zeros(n_pix),
            width_img: Array1::zeros(n_pix),
            opt_img: Array2::zeros((n_pix, 3)),
            opt_var: Array1::zeros(n_pix),
            mse: Array2::zeros((n_pix, 3)),
        }
    }

    pub fn n_pix(&self) -> usize {
        self.dims.n_pix()
    }

    /// Seed `h_k = MAX_BANDWIDTH * (k + 1) / NUM_TEST` for every pixel.
    pub fn seed_bandwidths(&mut self) {
        for (k, mut row) in self.width_guess.outer_iter_mut().enumerate() {
            row.fill(candidate_bandwidth(k));
        }
    }
}

/// The `k`-th candidate bandwidth of the sweep.
#[inline]
pub fn candidate_bandwidth(k: usize) -> f32 {
    MAX_BANDWIDTH * ((k + 1) as f32 / NUM_TEST as f32)
}

/// Allocation state of the accelerator resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    /// Nothing allocated; the next pass allocates and seeds bandwidths.
    Uninitialized,
    /// Resources allocated for an image of these dimensions.
    Ready { dims: ImageDims },
}

/// Backend plus its allocation state.
pub struct DeviceContext<E: SpatialFitEngine> {
    engine: E,
    state: DeviceState,
}

impl<E: SpatialFitEngine> DeviceContext<E> {
    pub fn new(engine: E) -> Self {
        Self {
            engine,
            state: DeviceState::Uninitialized,
        }
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }

    /// Allocate if needed. Returns `true` when this call performed the
    /// allocation.
    pub fn ensure_ready(&mut self, dims: ImageDims) -> Result<bool, E::Error> {
        match self.state {
            DeviceState::Ready { .. } => Ok(false),
            DeviceState::Uninitialized => {
                self.engine.alloc_texture_memory(dims)?;
                self.state = DeviceState::Ready { dims };
                debug!(width = dims.width, height = dims.height, "device resources allocated");
                Ok(true)
            }
        }
    }

    /// Free device resources. No-op when nothing is allocated.
    pub fn release(&mut self) {
        if let DeviceState::Ready { .. } = self.state {
            self.engine.free_device_memory();
            self.state = DeviceState::Uninitialized;
            debug!("device resources released");
        }
    }
}

impl<E: SpatialFitEngine> Drop for DeviceContext<E> {
    fn drop(&mut self) {
        self.release();
    }
}
