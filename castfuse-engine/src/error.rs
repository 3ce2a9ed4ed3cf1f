use thiserror::Error;

/// Errors raised by training and evaluation steps
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("loss is not finite ({loss}); halting the step")]
    NonFiniteLoss { loss: f64 },

    #[error("empty batch")]
    EmptyBatch,

    #[error("batch field {field} has {got} entries, expected {expected}")]
    BatchSizeMismatch {
        field: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("model has no {side} prototype projection; open-vocabulary scoring needs one")]
    MissingProjection { side: &'static str },
}
