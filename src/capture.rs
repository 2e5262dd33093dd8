//! Capture points: addressable signals inside a transformer forward pass
//!
//! A [`CapturePoint`] names one intermediate tensor by layer, sublayer and
//! signal. Names follow the TransformerLens hook convention so that points
//! can be written on the command line as e.g. `blocks.7.mlp.hook_post`.
//!
//! | Sublayer      | Signal           | Name                          |
//! |---------------|------------------|-------------------------------|
//! | `Embedding`   | `Token`          | `hook_embed`                  |
//! | `Embedding`   | `Position`       | `hook_pos_embed`              |
//! | `Attention`   | `Mixed`          | `blocks.{L}.attn.hook_z`      |
//! | `Attention`   | `Output`         | `blocks.{L}.hook_attn_out`    |
//! | `FeedForward` | `PreActivation`  | `blocks.{L}.mlp.hook_pre`     |
//! | `FeedForward` | `PostActivation` | `blocks.{L}.mlp.hook_post`    |
//! | `FeedForward` | `Output`         | `blocks.{L}.hook_mlp_out`     |
//! | `Residual`    | `Pre`            | `blocks.{L}.hook_resid_pre`   |
//! | `Residual`    | `Mid`            | `blocks.{L}.hook_resid_mid`   |
//! | `Residual`    | `Post`           | `blocks.{L}.hook_resid_post`  |

use std::fmt;
use std::str::FromStr;

use crate::error::{AuditError, Result};

/// Layer audited when nothing else is requested
pub const DEFAULT_LAYER: usize = 7;

/// Sublayer category of a capture point
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Sublayer {
    /// Token and position embeddings (before block 0)
    Embedding,
    /// Self-attention
    Attention,
    /// MLP / feed-forward
    FeedForward,
    /// Residual stream between sublayers
    Residual,
}

/// Signal name within a sublayer
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Signal {
    Token,
    Position,
    /// Attention-weighted values, heads concatenated, before the output projection
    Mixed,
    /// Sublayer output written back to the residual stream
    Output,
    PreActivation,
    PostActivation,
    Pre,
    Mid,
    Post,
}

const HOOKS: &[(Sublayer, Signal, &str)] = &[
    (Sublayer::Embedding, Signal::Token, "hook_embed"),
    (Sublayer::Embedding, Signal::Position, "hook_pos_embed"),
    (Sublayer::Attention, Signal::Mixed, "attn.hook_z"),
    (Sublayer::Attention, Signal::Output, "hook_attn_out"),
    (Sublayer::FeedForward, Signal::PreActivation, "mlp.hook_pre"),
    (Sublayer::FeedForward, Signal::PostActivation, "mlp.hook_post"),
    (Sublayer::FeedForward, Signal::Output, "hook_mlp_out"),
    (Sublayer::Residual, Signal::Pre, "hook_resid_pre"),
    (Sublayer::Residual, Signal::Mid, "hook_resid_mid"),
    (Sublayer::Residual, Signal::Post, "hook_resid_post"),
];

fn hook_suffix(sublayer: Sublayer, signal: Signal) -> Option<&'static str> {
    HOOKS
        .iter()
        .find(|(s, g, _)| *s == sublayer && *g == signal)
        .map(|(_, _, name)| *name)
}

impl Sublayer {
    /// Signals that exist within this sublayer
    pub fn signals(self) -> Vec<Signal> {
        HOOKS
            .iter()
            .filter(|(s, _, _)| *s == self)
            .map(|(_, g, _)| *g)
            .collect()
    }
}

/// One addressable internal signal of the model
///
/// Fields are private so that every value satisfies the sublayer/signal
/// pairing; build points with [`CapturePoint::new`] or the named constructors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CapturePoint {
    layer: usize,
    sublayer: Sublayer,
    signal: Signal,
}

impl CapturePoint {
    /// Validate and build a capture point
    ///
    /// Embedding points sit before the first block and must use layer 0.
    pub fn new(layer: usize, sublayer: Sublayer, signal: Signal) -> Result<Self> {
        if hook_suffix(sublayer, signal).is_none() {
            return Err(AuditError::InvalidCapturePoint(format!(
                "signal {signal:?} does not belong to sublayer {sublayer:?}"
            )));
        }
        if sublayer == Sublayer::Embedding && layer != 0 {
            return Err(AuditError::InvalidCapturePoint(format!(
                "embedding signals have no layer index (got layer {layer})"
            )));
        }
        Ok(Self {
            layer,
            sublayer,
            signal,
        })
    }

    const fn block(layer: usize, sublayer: Sublayer, signal: Signal) -> Self {
        Self {
            layer,
            sublayer,
            signal,
        }
    }

    pub const fn embed() -> Self {
        Self::block(0, Sublayer::Embedding, Signal::Token)
    }

    pub const fn pos_embed() -> Self {
        Self::block(0, Sublayer::Embedding, Signal::Position)
    }

    pub const fn attn_z(layer: usize) -> Self {
        Self::block(layer, Sublayer::Attention, Signal::Mixed)
    }

    pub const fn attn_out(layer: usize) -> Self {
        Self::block(layer, Sublayer::Attention, Signal::Output)
    }

    pub const fn mlp_pre(layer: usize) -> Self {
        Self::block(layer, Sublayer::FeedForward, Signal::PreActivation)
    }

    pub const fn mlp_post(layer: usize) -> Self {
        Self::block(layer, Sublayer::FeedForward, Signal::PostActivation)
    }

    pub const fn mlp_out(layer: usize) -> Self {
        Self::block(layer, Sublayer::FeedForward, Signal::Output)
    }

    pub const fn resid_pre(layer: usize) -> Self {
        Self::block(layer, Sublayer::Residual, Signal::Pre)
    }

    pub const fn resid_mid(layer: usize) -> Self {
        Self::block(layer, Sublayer::Residual, Signal::Mid)
    }

    pub const fn resid_post(layer: usize) -> Self {
        Self::block(layer, Sublayer::Residual, Signal::Post)
    }

    /// Every point of one transformer block, in forward order
    pub fn block_points(layer: usize) -> Vec<Self> {
        vec![
            Self::resid_pre(layer),
            Self::attn_z(layer),
            Self::attn_out(layer),
            Self::resid_mid(layer),
            Self::mlp_pre(layer),
            Self::mlp_post(layer),
            Self::mlp_out(layer),
            Self::resid_post(layer),
        ]
    }

    /// Every point of a model with `n_layers` blocks
    pub fn all(n_layers: usize) -> Vec<Self> {
        let mut points = vec![Self::embed(), Self::pos_embed()];
        for layer in 0..n_layers {
            points.extend(Self::block_points(layer));
        }
        points
    }

    pub fn layer(&self) -> usize {
        self.layer
    }

    pub fn sublayer(&self) -> Sublayer {
        self.sublayer
    }

    pub fn signal(&self) -> Signal {
        self.signal
    }
}

/// The capture selector: the single point the audit looks at
///
/// Layer 7, feed-forward sublayer, post-activation (`blocks.7.mlp.hook_post`).
pub const fn default_capture_point() -> CapturePoint {
    CapturePoint::mlp_post(DEFAULT_LAYER)
}

impl fmt::Display for CapturePoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let suffix = hook_suffix(self.sublayer, self.signal).ok_or(fmt::Error)?;
        if self.sublayer == Sublayer::Embedding {
            f.write_str(suffix)
        } else {
            write!(f, "blocks.{}.{}", self.layer, suffix)
        }
    }
}

impl FromStr for CapturePoint {
    type Err = AuditError;

    fn from_str(name: &str) -> Result<Self> {
        let unknown = || AuditError::InvalidCapturePoint(format!("unknown hook name `{name}`"));

        if let Some((sublayer, signal, _)) = HOOKS
            .iter()
            .find(|(s, _, suffix)| *s == Sublayer::Embedding && *suffix == name)
        {
            return Self::new(0, *sublayer, *signal);
        }

        let rest = name.strip_prefix("blocks.").ok_or_else(unknown)?;
        let (layer, suffix) = rest.split_once('.').ok_or_else(unknown)?;
        let layer: usize = layer.parse().map_err(|_| unknown())?;

        let (sublayer, signal, _) = HOOKS
            .iter()
            .find(|(s, _, hook)| *s != Sublayer::Embedding && *hook == suffix)
            .ok_or_else(unknown)?;
        Self::new(layer, *sublayer, *signal)
    }
}

impl serde::Serialize for CapturePoint {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}
