//! Sampler errors

use thiserror::Error;

/// Error type returned by a [`DenoiseModel`](crate::model::DenoiseModel) query.
///
/// Model failures are boxed and carried through the sampler unchanged.
pub type ModelError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that can occur while sampling
#[derive(Error, Debug)]
pub enum SamplerError {
    #[error("sigma schedule needs at least 2 entries, got {len}")]
    ScheduleTooShort { len: usize },

    #[error("invalid sigma schedule at index {index}: {reason}")]
    InvalidSchedule { index: usize, reason: String },

    #[error("model did not report an unconditional denoised estimate at step {step}")]
    MissingUncondDenoised { step: usize },

    #[error("unknown sampler: {0}")]
    UnknownSampler(String),

    #[error("model query failed: {0}")]
    Model(#[from] ModelError),
}

/// Result alias for sampler operations
pub type Result<T> = std::result::Result<T, SamplerError>;
