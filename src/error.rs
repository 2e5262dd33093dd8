//! Error type for the audit pipeline

use thiserror::Error;

use crate::capture::CapturePoint;

/// Everything that can abort an audit.
///
/// None of these are recovered from locally: an audit either produces a
/// complete [`DeltaVector`](crate::DeltaVector) or fails with one of these.
#[derive(Debug, Error)]
pub enum AuditError {
    /// The runner does not expose this point, or a pass did not record it
    #[error("capture point `{point}` is not exposed by the model runner")]
    CapturePointNotFound { point: CapturePoint },

    /// The forward pass itself failed; the runner's error is passed through as-is
    #[error(transparent)]
    ModelRunnerFailure(anyhow::Error),

    /// The two passes produced different unit counts at the same point
    #[error("unit count mismatch at `{point}`: safe pass has {safe_units}, hostile pass has {hostile_units}")]
    ShapeMismatch {
        point: CapturePoint,
        safe_units: usize,
        hostile_units: usize,
    },

    /// A captured tensor is not shaped `(1, seq_len, units)`
    #[error("activation at `{point}` has shape {dims:?}, expected (1, seq_len, units)")]
    InvalidActivation {
        point: CapturePoint,
        dims: Vec<usize>,
    },

    #[error("invalid capture point: {0}")]
    InvalidCapturePoint(String),

    #[error("audit inputs must be non-empty")]
    EmptyInput,

    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    #[error("cannot render heat map: {0}")]
    Render(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result alias used throughout the audit core
pub type Result<T> = std::result::Result<T, AuditError>;
