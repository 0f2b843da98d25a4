//! LWR Core Library
//!
//! Bandwidth-sweep statistics for locally weighted regression denoising of
//! Monte Carlo renderings. The spatial regression runs behind the
//! `SpatialFitEngine` trait; this crate reduces the sample moments, fits
//! per-pixel bias and variance models over the bandwidth sweep, selects the
//! MISE-optimal bandwidth and predicts the remaining error.

pub mod accumulators;
pub mod bandwidth;
pub mod buffers;
pub mod config;
pub mod curve_fit;
pub mod driver;
pub mod error;
pub mod error_map;
pub mod moments;
pub mod smoothing;
pub mod spatial;

// Re-export commonly used types at the crate root
pub use accumulators::{AccumulatedStats, ImageDims, MotionAccumulators};
pub use buffers::{DeviceState, HostBuffers};
pub use config::{FeatureMode, LwrConfig, NUM_TEST};
pub use driver::{BoundPass, LwrDenoiser, PassSummary, StageTimings};
pub use error::LwrError;
pub use error_map::sampling_density;
pub use spatial::{DeviceUpload, FinalRequest, SpatialFitEngine, SweepOutputs, SweepRequest};
