use thiserror::Error;

/// Errors raised while building or querying prototype tables
#[derive(Error, Debug)]
pub enum PrototypeError {
    #[error("class name {name:?} is not present in the prototype vocabulary")]
    VocabularyMismatch { name: String },

    #[error("prototype row {index} ({name:?}) has near-zero norm and cannot be cosine-scored")]
    DegenerateFeature { index: usize, name: String },

    #[error("embedder returned {got} rows for {expected} class names")]
    RowCountMismatch { expected: usize, got: usize },

    #[error("verb id {verb} exceeds the prototype table's {buckets} verb buckets")]
    VerbOutOfRange { verb: u32, buckets: usize },
}
