//! Engine configuration and fixed constants of the bandwidth sweep.

use crate::error::LwrError;

// =============================================================================
// Constants
// =============================================================================

/// Number of candidate bandwidths tested per pixel in one sweep.
pub const NUM_TEST: usize = 5;

// A two-parameter model needs at least two distinct bandwidth samples.
const _: () = assert!(NUM_TEST >= 2);

/// Largest candidate bandwidth; candidates are fractions of this value.
pub const MAX_BANDWIDTH: f32 = 1.0;

/// Half-window radius of the spatial fit on the terminal pass.
pub const MAX_HALF_WINDOW: usize = 10;

/// Half-window radius of the spatial fit on intermediate passes.
pub const MAX_HALF_WINDOW_INTER: usize = 7;

/// Length of one per-pixel hessian row (normal 3 + texture 3 + depth 1).
pub const FEATURE_DIMENSIONS: usize = 7;

/// Minimum chunk length for Rayon per-pixel iteration.
/// Lets work stealing balance uneven per-pixel cost without tiny tasks.
pub const RAYON_MIN_CHUNK_LEN: usize = 64;

const DEFAULT_BANDWIDTH_SMOOTHING_SIGMA: f32 = 1.0;
const DEFAULT_ERROR_SMOOTHING_SIGMA: f32 = 1.0;

const HALF_WINDOW_ENV: &str = "LWR_HALF_WINDOW";
const HALF_WINDOW_INTER_ENV: &str = "LWR_HALF_WINDOW_INTER";
const PROFILE_TIMING_ENV: &str = "LWR_PROFILE_TIMING";

// =============================================================================
// Types
// =============================================================================

/// Which auxiliary features are reduced and uploaded each pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FeatureMode {
    /// Normal, texture and depth from all samples; feature variances in [0, 1].
    #[default]
    Static,
    /// Features split into still and moving samples.
    /// Doubles the texture statistics and fills feature holes before the fit.
    Motion,
}

impl FeatureMode {
    pub fn is_motion(self) -> bool {
        self == FeatureMode::Motion
    }
}

/// Configuration for the bandwidth-sweep engine.
///
/// Defaults are the fixed constants above; use `from_env` to pick up
/// window overrides.
#[derive(Debug, Clone)]
pub struct LwrConfig {
    /// Feature layout. Default: `Static`
    pub feature_mode: FeatureMode,
    /// Spatial window half-size on the terminal pass. Default: 10
    pub half_window: usize,
    /// Spatial window half-size on intermediate passes. Default: 7
    pub half_window_inter: usize,
    /// Gaussian sigma applied to the optimal bandwidth map. Default: 1.0
    pub bandwidth_smoothing_sigma: f32,
    /// Gaussian sigma applied to the predicted error map. Default: 1.0
    pub error_smoothing_sigma: f32,
    /// Emit per-stage timings at debug level. Default: from `LWR_PROFILE_TIMING`
    pub profile_timing: bool,
}

impl Default for LwrConfig {
    fn default() -> Self {
        Self {
            feature_mode: FeatureMode::Static,
            half_window: MAX_HALF_WINDOW,
            half_window_inter: MAX_HALF_WINDOW_INTER,
            bandwidth_smoothing_sigma: DEFAULT_BANDWIDTH_SMOOTHING_SIGMA,
            error_smoothing_sigma: DEFAULT_ERROR_SMOOTHING_SIGMA,
            profile_timing: resolve_profile_timing(),
        }
    }
}

impl LwrConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults with window radii overridden from the environment.
    pub fn from_env() -> Self {
        Self {
            half_window: resolve_usize_env(HALF_WINDOW_ENV, MAX_HALF_WINDOW),
            half_window_inter: resolve_usize_env(HALF_WINDOW_INTER_ENV, MAX_HALF_WINDOW_INTER),
            ..Self::default()
        }
    }

    pub fn with_feature_mode(mut self, mode: FeatureMode) -> Self {
        self.feature_mode = mode;
        self
    }

    /// Window half-size for a pass.
    pub fn half_window_for(&self, is_final_pass: bool) -> usize {
        if is_final_pass {
            self.half_window
        } else {
            self.half_window_inter
        }
    }

    /// Validate the configuration parameters.
    pub fn validate(&self) -> Result<(), LwrError> {
        if self.half_window == 0 {
            return Err(LwrError::InvalidConfig("half_window must be > 0".into()));
        }
        if self.half_window_inter == 0 {
            return Err(LwrError::InvalidConfig(
                "half_window_inter must be > 0".into(),
            ));
        }
        if !is_non_negative(self.bandwidth_smoothing_sigma) {
            return Err(LwrError::InvalidConfig(
                "bandwidth_smoothing_sigma must be >= 0".into(),
            ));
        }
        if !is_non_negative(self.error_smoothing_sigma) {
            return Err(LwrError::InvalidConfig(
                "error_smoothing_sigma must be >= 0".into(),
            ));
        }
        Ok(())
    }
}

fn is_non_negative(v: f32) -> bool {
    v.is_finite() && v >= 0.0
}

fn resolve_usize_env(key: &str, fallback: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse::<usize>().ok())
        .filter(|&v| v > 0)
        .unwrap_or(fallback)
}

fn resolve_profile_timing() -> bool {
    std::env::var(PROFILE_TIMING_ENV)
        .ok()
        .map(|value| is_truthy(&value))
        .unwrap_or(false)
}

fn is_truthy(value: &str) -> bool {
    let v = value.trim();
    v == "1"
        || v.eq_ignore_ascii_case("true")
        || v.eq_ignore_ascii_case("yes")
        || v.eq_ignore_ascii_case("on")
}
