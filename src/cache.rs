//! Activation cache for one instrumented forward pass

use std::collections::BTreeMap;

use candle_core::Tensor;

use crate::capture::CapturePoint;
use crate::error::{AuditError, Result};

/// Stores every recorded signal from a single forward pass
///
/// Each tensor has shape `(batch, seq_len, units)`. The cache lives for
/// one pass only; nothing is shared between passes.
#[derive(Debug, Default)]
pub struct ActivationCache {
    activations: BTreeMap<CapturePoint, Tensor>,
}

impl ActivationCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the tensor produced at `point`
    ///
    /// A second insert at the same point replaces the first.
    pub fn insert(&mut self, point: CapturePoint, tensor: Tensor) {
        self.activations.insert(point, tensor);
    }

    /// Get the activation recorded at `point`
    pub fn get(&self, point: &CapturePoint) -> Option<&Tensor> {
        self.activations.get(point)
    }

    /// Get the activation at `point`, failing if the pass did not record it
    pub fn require(&self, point: &CapturePoint) -> Result<&Tensor> {
        self.activations
            .get(point)
            .ok_or(AuditError::CapturePointNotFound { point: *point })
    }

    /// Consume the cache, keeping only the activation at `point`
    pub fn into_activation(mut self, point: &CapturePoint) -> Result<Tensor> {
        self.activations
            .remove(point)
            .ok_or(AuditError::CapturePointNotFound { point: *point })
    }

    pub fn contains(&self, point: &CapturePoint) -> bool {
        self.activations.contains_key(point)
    }

    /// Recorded points in layer order
    pub fn points(&self) -> impl Iterator<Item = &CapturePoint> {
        self.activations.keys()
    }

    /// Number of recorded signals
    pub fn len(&self) -> usize {
        self.activations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.activations.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn test_cache_basic() {
        let device = Device::Cpu;
        let mut cache = ActivationCache::new();
        assert!(cache.is_empty());

        let post = Tensor::zeros((1, 5, 3072), DType::F32, &device).unwrap();
        let resid = Tensor::zeros((1, 5, 768), DType::F32, &device).unwrap();
        cache.insert(CapturePoint::mlp_post(7), post);
        cache.insert(CapturePoint::resid_post(7), resid);

        assert_eq!(cache.len(), 2);
        assert!(cache.contains(&CapturePoint::mlp_post(7)));
        assert_eq!(
            cache.get(&CapturePoint::mlp_post(7)).unwrap().dims(),
            &[1, 5, 3072]
        );
        assert!(cache.get(&CapturePoint::mlp_post(8)).is_none());
    }

    #[test]
    fn test_require_missing_point() {
        let cache = ActivationCache::new();
        let err = cache.require(&CapturePoint::mlp_post(40)).unwrap_err();
        assert!(matches!(
            err,
            AuditError::CapturePointNotFound { point } if point == CapturePoint::mlp_post(40)
        ));
    }

    #[test]
    fn test_into_activation() {
        let device = Device::Cpu;
        let mut cache = ActivationCache::new();
        cache.insert(
            CapturePoint::mlp_pre(0),
            Tensor::ones((1, 2, 4), DType::F32, &device).unwrap(),
        );

        let tensor = cache.into_activation(&CapturePoint::mlp_pre(0)).unwrap();
        assert_eq!(tensor.dims(), &[1, 2, 4]);
    }

    #[test]
    fn test_points_ordered_by_layer() {
        let device = Device::Cpu;
        let mut cache = ActivationCache::new();
        for point in [
            CapturePoint::resid_post(2),
            CapturePoint::embed(),
            CapturePoint::mlp_post(1),
        ] {
            cache.insert(point, Tensor::zeros((1, 1, 1), DType::F32, &device).unwrap());
        }

        let layers: Vec<usize> = cache.points().map(CapturePoint::layer).collect();
        assert_eq!(layers, vec![0, 1, 2]);
    }
}
