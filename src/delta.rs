//! Delta engine: per-unit activation difference between two prompts
//!
//! Both prompts go through the runner, the tensor at one capture point is
//! reduced to a per-unit mean over sequence positions, and the two
//! reductions are subtracted (`hostile - safe`).

use candle_core::{DType, Tensor};
use serde::Serialize;
use tracing::{debug, info};

use crate::capture::CapturePoint;
use crate::error::{AuditError, Result};
use crate::model::ModelRunner;

/// An activation reduced over sequence positions: one value per unit
#[derive(Debug, Clone, PartialEq)]
pub struct UnitVector(Vec<f32>);

impl UnitVector {
    pub fn values(&self) -> &[f32] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// One unit's entry in a delta vector
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct UnitDelta {
    pub unit: usize,
    pub delta: f32,
}

/// Signed per-unit difference `reduced(B) - reduced(A)` at one capture point
///
/// Positive entries mean the unit responded more strongly to input B.
#[derive(Debug, Clone, PartialEq)]
pub struct DeltaVector {
    point: CapturePoint,
    values: Vec<f32>,
}

impl DeltaVector {
    pub fn point(&self) -> CapturePoint {
        self.point
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// The first `n` units (fewer if the vector is shorter), in unit order
    pub fn head(&self, n: usize) -> &[f32] {
        &self.values[..n.min(self.values.len())]
    }

    /// Largest absolute entry, 0.0 for an empty vector
    pub fn max_abs(&self) -> f32 {
        self.values.iter().fold(0.0f32, |acc, v| acc.max(v.abs()))
    }

    pub fn l2_norm(&self) -> f32 {
        self.values.iter().map(|v| v * v).sum::<f32>().sqrt()
    }

    /// The `k` units that diverge most, by absolute delta
    ///
    /// Ties go to the lower unit index. NaN entries rank below every
    /// finite value.
    pub fn top_units(&self, k: usize) -> Vec<UnitDelta> {
        let mut ranked: Vec<UnitDelta> = self
            .values
            .iter()
            .enumerate()
            .map(|(unit, &delta)| UnitDelta { unit, delta })
            .collect();
        ranked.sort_by(|a, b| {
            strength(b)
                .total_cmp(&strength(a))
                .then(a.unit.cmp(&b.unit))
        });
        ranked.truncate(k);
        ranked
    }
}

/// Ranking key for `top_units`
fn strength(unit: &UnitDelta) -> f32 {
    if unit.delta.is_nan() {
        f32::NEG_INFINITY
    } else {
        unit.delta.abs()
    }
}

/// Mean over the sequence axis of a `(1, seq_len, units)` activation
///
/// Every position counts equally. Reduction runs in f32 whatever the
/// activation dtype.
pub fn mean_over_sequence(point: &CapturePoint, activation: &Tensor) -> Result<UnitVector> {
    let invalid = || AuditError::InvalidActivation {
        point: *point,
        dims: activation.dims().to_vec(),
    };

    let (batch, seq_len, _units) = activation.dims3().map_err(|_| invalid())?;
    if batch != 1 || seq_len == 0 {
        return Err(invalid());
    }

    let means = activation
        .to_dtype(DType::F32)?
        .mean(1)?
        .squeeze(0)?
        .to_vec1::<f32>()?;
    Ok(UnitVector(means))
}

/// Run `text` and reduce the activation recorded at `point`
fn capture_reduced<R: ModelRunner + ?Sized>(
    runner: &R,
    point: &CapturePoint,
    text: &str,
) -> Result<UnitVector> {
    let cache = runner
        .run_with_cache(text)
        .map_err(AuditError::ModelRunnerFailure)?;
    let activation = cache.into_activation(point)?;
    debug!("Captured {} with shape {:?}", point, activation.dims());
    mean_over_sequence(point, &activation)
}

/// Compute `reduced(input_b) - reduced(input_a)` at `point`
///
/// The point is checked against the runner's exposed set before any
/// forward pass runs. Pass A completes before pass B starts. Any failure
/// aborts the whole computation; there is no partial result.
pub fn compute_delta<R: ModelRunner + ?Sized>(
    runner: &R,
    point: &CapturePoint,
    input_a: &str,
    input_b: &str,
) -> Result<DeltaVector> {
    if input_a.is_empty() || input_b.is_empty() {
        return Err(AuditError::EmptyInput);
    }
    if !runner.capture_points().contains(point) {
        return Err(AuditError::CapturePointNotFound { point: *point });
    }

    info!("Capturing {} for input A", point);
    let reduced_a = capture_reduced(runner, point, input_a)?;
    info!("Capturing {} for input B", point);
    let reduced_b = capture_reduced(runner, point, input_b)?;

    if reduced_a.len() != reduced_b.len() {
        return Err(AuditError::ShapeMismatch {
            point: *point,
            safe_units: reduced_a.len(),
            hostile_units: reduced_b.len(),
        });
    }

    let values = reduced_b
        .values()
        .iter()
        .zip(reduced_a.values())
        .map(|(b, a)| b - a)
        .collect();

    Ok(DeltaVector {
        point: *point,
        values,
    })
}
