//! Audit runner: one delta computation plus its rendering
//!
//! Coordinates the capture selector, the delta engine and the renderers.

use serde::Serialize;
use tracing::info;

use crate::capture::{default_capture_point, CapturePoint};
use crate::delta::{compute_delta, DeltaVector, UnitDelta};
use crate::error::Result;
use crate::model::ModelRunner;
use crate::render::{delta_grid, AuditRenderer, HeatmapSpec};

/// Checkpoint audited when nothing else is requested
pub const DEFAULT_MODEL_ID: &str = "openai-community/gpt2";
pub const DEFAULT_SAFE_TEXT: &str = "I want to help the community.";
pub const DEFAULT_HOSTILE_TEXT: &str = "I want to destroy the community.";
/// Units shown in the heat map
pub const DEFAULT_TOP_UNITS: usize = 50;

/// Name of a checkpoint as shown in titles
///
/// GPT-2 checkpoints get their family name; anything else shows the
/// repository name without its owner.
pub fn model_display_name(model_id: &str) -> String {
    let repo = model_id.rsplit('/').next().unwrap_or(model_id);
    match repo {
        "gpt2" => "GPT-2".to_string(),
        "gpt2-medium" => "GPT-2 Medium".to_string(),
        "gpt2-large" => "GPT-2 Large".to_string(),
        "gpt2-xl" => "GPT-2 XL".to_string(),
        other => other.to_string(),
    }
}

/// Configuration for a single audit
#[derive(Debug, Clone)]
pub struct AuditConfig {
    /// HuggingFace model ID
    pub model_id: String,
    /// Where in the model to look
    pub capture_point: CapturePoint,
    /// Benign framing (input A)
    pub safe_text: String,
    /// Adversarial framing (input B)
    pub hostile_text: String,
    /// Length of the unit prefix handed to the renderer
    pub top_units: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            model_id: DEFAULT_MODEL_ID.to_string(),
            capture_point: default_capture_point(),
            safe_text: DEFAULT_SAFE_TEXT.to_string(),
            hostile_text: DEFAULT_HOSTILE_TEXT.to_string(),
            top_units: DEFAULT_TOP_UNITS,
        }
    }
}

/// Serializable summary of one audit
#[derive(Debug, Clone, Serialize)]
pub struct AuditReport {
    pub model_id: String,
    pub capture_point: CapturePoint,
    pub safe_text: String,
    pub hostile_text: String,
    pub unit_count: usize,
    pub displayed_units: usize,
    pub l2_norm: f32,
    pub max_abs: f32,
    /// Units with the largest absolute delta
    pub strongest: Vec<UnitDelta>,
    /// Full delta vector, `hostile - safe`
    pub delta: Vec<f32>,
}

/// Runs one audit against a model runner
pub struct Audit<R> {
    config: AuditConfig,
    runner: R,
}

impl<R: ModelRunner> Audit<R> {
    pub fn new(runner: R, config: AuditConfig) -> Self {
        Self { config, runner }
    }

    pub fn config(&self) -> &AuditConfig {
        &self.config
    }

    /// Compute the delta vector for the configured pair of inputs
    pub fn run(&self) -> Result<DeltaVector> {
        info!("Starting audit at {}", self.config.capture_point);
        info!("Safe:    {:?}", self.config.safe_text);
        info!("Hostile: {:?}", self.config.hostile_text);

        let delta = compute_delta(
            &self.runner,
            &self.config.capture_point,
            &self.config.safe_text,
            &self.config.hostile_text,
        )?;

        info!(
            "Delta over {} units: L2 {:.4}, max |delta| {:.4}",
            delta.len(),
            delta.l2_norm(),
            delta.max_abs()
        );
        Ok(delta)
    }

    /// Heat-map spec matching this audit's capture point and prefix length
    pub fn heatmap_spec(&self) -> HeatmapSpec {
        HeatmapSpec::for_delta(
            &model_display_name(&self.config.model_id),
            &self.config.capture_point,
            self.config.top_units,
        )
    }

    /// Hand the first `top_units` entries of `delta` to every renderer
    pub fn render(&self, delta: &DeltaVector, renderers: &[&dyn AuditRenderer]) -> Result<()> {
        let grid = delta_grid(delta, self.config.top_units);
        let spec = self.heatmap_spec();
        for renderer in renderers {
            renderer.render(&grid, &spec)?;
        }
        Ok(())
    }

    /// Summarize `delta`, listing the `strongest` most divergent units
    pub fn report(&self, delta: &DeltaVector, strongest: usize) -> AuditReport {
        AuditReport {
            model_id: self.config.model_id.clone(),
            capture_point: delta.point(),
            safe_text: self.config.safe_text.clone(),
            hostile_text: self.config.hostile_text.clone(),
            unit_count: delta.len(),
            displayed_units: delta.head(self.config.top_units).len(),
            l2_norm: delta.l2_norm(),
            max_abs: delta.max_abs(),
            strongest: delta.top_units(strongest),
            delta: delta.values().to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audit_config_defaults() {
        let config = AuditConfig::default();
        assert_eq!(config.model_id, "openai-community/gpt2");
        assert_eq!(config.capture_point.to_string(), "blocks.7.mlp.hook_post");
        assert_eq!(config.safe_text, "I want to help the community.");
        assert_eq!(config.hostile_text, "I want to destroy the community.");
        assert_eq!(config.top_units, 50);
    }

    #[test]
    fn test_model_display_name() {
        assert_eq!(model_display_name("openai-community/gpt2"), "GPT-2");
        assert_eq!(model_display_name("gpt2"), "GPT-2");
        assert_eq!(model_display_name("openai-community/gpt2-xl"), "GPT-2 XL");
        assert_eq!(model_display_name("distilbert/distilgpt2"), "distilgpt2");
    }
}
