//! castfuse-model - Cross-modal fusion transformer
//!
//! This crate implements the B-CAST fusion architecture: three independently
//! embedded token streams (per-frame spatial patches, 3D tubelet patches, and
//! audio mel-patches) exchange information through bottlenecked bidirectional
//! cross-attention cells interleaved with modality-specific self-attention and
//! adapter-gated feed-forward paths. Pooled per-stream representations feed
//! either a single classifier or a split noun/verb composition head.

pub mod attention;
pub mod block;
pub mod config;
pub mod cross;
pub mod embed;
pub mod error;
pub mod layers;
pub mod model;
pub mod streams;

pub use config::{LayerPlan, ModelConfig, TimeEncoding};
pub use error::ModelError;
pub use model::{CastModel, CompositionScores, ModelInput, ModelOutput};
pub use streams::{AudioTokens, SpatialTokens, TemporalTokens};

/// Initialize the model module
pub fn init() {
    tracing::info!("castfuse-model initialized");
}
