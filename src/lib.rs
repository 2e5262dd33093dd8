// Pedantic clippy configuration for ML/math codebase
#![allow(clippy::cast_precision_loss)] // usize→f32 intentional in reductions and layout
#![allow(clippy::cast_possible_truncation)] // usize→u32 in tensor indexing, f32→u8 in colors
#![allow(clippy::cast_sign_loss)] // f32→usize when value is known positive
#![allow(clippy::module_name_repetitions)] // AuditModel in model.rs is fine
#![allow(clippy::doc_markdown)] // backticks for every technical term is excessive
#![allow(clippy::missing_errors_doc)] // # Errors section for every Result fn
#![allow(clippy::must_use_candidate)] // #[must_use] on every pure fn is excessive
#![allow(clippy::return_self_not_must_use)] // #[must_use] on Self returns

//! delta-audit: differential activation audit
//!
//! Runs a transformer on a benign and an adversarial prompt, captures one
//! internal signal from each pass, mean-reduces it over sequence positions
//! and renders the per-unit difference as a heat map.
//!
//! ## Architecture
//!
//! - `capture`: CapturePoint vocabulary and the default capture selector
//! - `cache`: ActivationCache holding every signal of one forward pass
//! - `masks`: Causal attention mask
//! - `forward_gpt2`: GPT-2 forward pass with hook-point capture
//! - `model`: AuditBackend / ModelRunner traits and the AuditModel wrapper
//! - `delta`: Delta engine (mean reduction and signed difference)
//! - `render`: Diverging heat-map rendering (SVG file, terminal strip)
//! - `audit`: Audit runner tying the pipeline together
//! - `error`: AuditError taxonomy

pub mod audit;
pub mod cache;
pub mod capture;
pub mod delta;
pub mod error;
pub mod forward_gpt2;
pub mod masks;
pub mod model;
pub mod render;

pub use audit::{model_display_name, Audit, AuditConfig, AuditReport};
pub use cache::ActivationCache;
pub use capture::{default_capture_point, CapturePoint, Signal, Sublayer};
pub use delta::{compute_delta, mean_over_sequence, DeltaVector, UnitDelta, UnitVector};
pub use error::{AuditError, Result};
pub use forward_gpt2::{AuditGpt2, Gpt2Config};
pub use masks::create_causal_mask;
pub use model::{AuditBackend, AuditModel, ModelRunner};
pub use render::{
    delta_grid, render_ansi, render_svg, AuditRenderer, DivergingScale, HeatmapLabels,
    HeatmapSpec, HeatmapStyle, Margins, Rgb, SvgRenderer, TerminalRenderer,
};
