//! Error type for caller-facing entry points.
//!
//! Numeric degeneracies inside a pass are never errors; they are absorbed by
//! clamping and regularization. Only contract violations at the API boundary
//! and failures reported by the spatial-fit backend surface here.

use thiserror::Error;

/// Errors reported by `lwr_core`.
#[derive(Error, Debug)]
pub enum LwrError {
    #[error("invalid image dimensions {width}x{height}")]
    InvalidDimensions { width: usize, height: usize },

    #[error("buffer `{name}` has shape {actual:?}, expected {expected:?}")]
    BufferShape {
        name: &'static str,
        expected: (usize, usize),
        actual: (usize, usize),
    },

    #[error("pixel {pixel} has zero samples")]
    ZeroSampleCount { pixel: usize },

    #[error("motion feature mode requires moving-sample counts and moving texture sums")]
    MovingSamplesRequired,

    #[error("pixel {pixel}: moving samples ({moving}) exceed total samples ({total})")]
    MovingCountExceeds {
        pixel: usize,
        moving: u32,
        total: u32,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("spatial fit backend failed: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl LwrError {
    /// Wrap a backend error.
    pub fn backend<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Backend(Box::new(err))
    }
}
