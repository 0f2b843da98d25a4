//! Interface to the spatial kernel-regression backend.
//!
//! The regression itself (local fits over the feature space, the per-pixel
//! hessians and the rank estimate) runs on an accelerator and is opaque to
//! this crate. The engine drives it through `SpatialFitEngine`, so the
//! statistical stages can be exercised with synthetic fit outputs.
//!
//! Smoothing and hole filling default to the CPU implementations in
//! [`crate::smoothing`]; a backend may override them with device kernels.

use ndarray::{ArrayView1, ArrayView2, ArrayViewMut1, ArrayViewMut2, ArrayViewMut3};

use crate::accumulators::ImageDims;
use crate::smoothing;

/// Reduced features handed to the backend before the sweep.
///
/// Three-channel buffers are `(n_pix, 3)`, depth is `(n_pix, 1)`.
#[derive(Debug, Clone, Copy)]
pub struct DeviceUpload<'a> {
    pub dims: ImageDims,
    pub color: ArrayView2<'a, f32>,
    pub color_var: ArrayView2<'a, f32>,
    pub texture: ArrayView2<'a, f32>,
    pub texture_var: ArrayView2<'a, f32>,
    pub normal: ArrayView2<'a, f32>,
    pub normal_var: ArrayView2<'a, f32>,
    pub depth: ArrayView2<'a, f32>,
    pub depth_var: ArrayView2<'a, f32>,
    /// Moving texture mean and variance (motion mode only).
    pub texture_moving: Option<(ArrayView2<'a, f32>, ArrayView2<'a, f32>)>,
    pub sample_counts: ArrayView1<'a, u32>,
    /// Moving-sample counts (motion mode only).
    pub moving_counts: Option<ArrayView1<'a, u32>>,
}

/// Inputs of the multi-bandwidth sweep fit.
#[derive(Debug, Clone, Copy)]
pub struct SweepRequest<'a> {
    pub dims: ImageDims,
    pub half_window: usize,
    /// Candidate bandwidths, `(num_test, n_pix)`.
    pub width_guess: ArrayView2<'a, f32>,
    pub sample_counts: ArrayView1<'a, u32>,
}

/// Buffers the sweep fit writes.
#[derive(Debug)]
pub struct SweepOutputs<'a> {
    /// Fitted color per bandwidth, `(num_test, n_pix, 3)`.
    pub fit_map: ArrayViewMut3<'a, f32>,
    /// Variance estimate per bandwidth, `(num_test, n_pix)`.
    pub var_map: ArrayViewMut2<'a, f32>,
    /// Bias estimate per bandwidth, `(num_test, n_pix)`.
    pub bias_map: ArrayViewMut2<'a, f32>,
    /// Feature-space metric, `(n_pix, FEATURE_DIMENSIONS)`.
    pub hessians: ArrayViewMut2<'a, f32>,
    /// Effective dimensionality per pixel.
    pub ranks: ArrayViewMut1<'a, f32>,
}

/// Inputs of the final single-bandwidth fit.
#[derive(Debug, Clone, Copy)]
pub struct FinalRequest<'a> {
    pub dims: ImageDims,
    pub half_window: usize,
    /// Per-pixel bandwidth, `(n_pix,)`.
    pub bandwidth: ArrayView1<'a, f32>,
}

/// Accelerator-resident spatial regression.
///
/// All calls come from a single owner; implementations need no internal
/// locking.
pub trait SpatialFitEngine {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Allocate device textures and working memory for an image.
    fn alloc_texture_memory(&mut self, dims: ImageDims) -> Result<(), Self::Error>;

    /// Release everything `alloc_texture_memory` acquired.
    fn free_device_memory(&mut self);

    /// Upload the reduced features of the current pass.
    fn init_device_memory(&mut self, upload: &DeviceUpload<'_>) -> Result<(), Self::Error>;

    /// Fit every candidate bandwidth at once.
    fn local_fit_shared(
        &mut self,
        request: &SweepRequest<'_>,
        outputs: SweepOutputs<'_>,
    ) -> Result<(), Self::Error>;

    /// Fit at the per-pixel optimal bandwidth.
    fn local_fit_shared_final(
        &mut self,
        request: &FinalRequest<'_>,
        image_out: ArrayViewMut2<'_, f32>,
        variance_out: ArrayViewMut1<'_, f32>,
    ) -> Result<(), Self::Error>;

    /// Gaussian smoothing of a `(n_pix, channels)` buffer.
    fn local_gaussian_smooth(
        &mut self,
        buffer: ArrayViewMut2<'_, f32>,
        dims: ImageDims,
        sigma: f32,
    ) -> Result<(), Self::Error> {
        smoothing::gaussian_smooth(buffer, dims, sigma);
        Ok(())
    }

    /// Fill pixels without still samples from sampled neighbours.
    fn local_gaussian_fill_holes(
        &mut self,
        buffer: ArrayViewMut2<'_, f32>,
        still_counts: ArrayView1<'_, u32>,
        dims: ImageDims,
        half_window: usize,
    ) -> Result<(), Self::Error> {
        smoothing::fill_holes(buffer, still_counts, dims, half_window);
        Ok(())
    }
}
