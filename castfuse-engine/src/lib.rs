//! castfuse-engine - Training and evaluation numerics
//!
//! Batch-level steps for the composition model (prototype-scored noun loss
//! plus verb head loss), closed and open-vocabulary evaluation, composite
//! action accuracy, and rayon-parallel merging of multi-crop test clips
//! into per-video scores.

pub mod error;
pub mod merge;
pub mod metrics;
pub mod step;

pub use error::EngineError;
pub use merge::{merge_clip_predictions, ClipPrediction, MergedMetrics, VideoScores};
pub use metrics::{accuracy, action_accuracy, topk_indices, MetricSink, TracingSink};
pub use step::{
    composition_train_step, composition_validation_step, open_vocab_eval_step, CompositionBatch,
    OvMode, OvReport, OvTables, SplitMetrics, TrainOutput, ValidationOutput,
};

/// Initialize the engine module
pub fn init() {
    tracing::info!("castfuse-engine initialized");
}
