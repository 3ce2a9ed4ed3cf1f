//! castfuse-text - Text-derived class prototypes
//!
//! Class names ("verb" / "noun" / "verb noun" strings) are embedded once by
//! a text encoder into a prototype table; visual features are scored against
//! the table by temperature-scaled cosine similarity. This crate also owns
//! the composed-action label arithmetic shared by training and evaluation.

pub mod compose;
pub mod error;
pub mod prototypes;

pub use compose::{
    compose_action_label, decode_bucketed_prediction, select_verb_buckets, split_action_label,
    ComposedPrediction, LABEL_SPACE_NOUN_STRIDE, MODEL_NOUN_BUCKET_SIZE,
};
pub use error::PrototypeError;
pub use prototypes::{
    bucketed_logits, normalize_rows, similarity_logits, PrototypeTable, TextEmbedder,
    LOGIT_TEMPERATURE,
};

/// Initialize the text module
pub fn init() {
    tracing::info!("castfuse-text initialized");
}
