use thiserror::Error;

/// Errors raised while assembling or running the fusion model
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("shape mismatch in {context}: expected {expected}, got {got}")]
    ShapeMismatch {
        context: String,
        expected: String,
        got: String,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("stream width {width} is not divisible by {divisor} ({what})")]
    IndivisibleWidth {
        width: usize,
        divisor: usize,
        what: String,
    },

    #[error("audio input supplied but the model was built without an audio stream")]
    AudioNotConfigured,

    #[error("clip span input required for time encoding but none was supplied")]
    MissingClipSpans,
}

impl ModelError {
    pub fn shape(context: impl Into<String>, expected: impl Into<String>, got: impl Into<String>) -> Self {
        Self::ShapeMismatch {
            context: context.into(),
            expected: expected.into(),
            got: got.into(),
        }
    }
}
