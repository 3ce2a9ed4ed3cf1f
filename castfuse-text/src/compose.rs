//! Composed-action label arithmetic.
//!
//! Two different constants are in play and must not be conflated. Dataset
//! action labels compose verb and noun ids on a base-1000 stride
//! (`verb * 1000 + noun`), sized to the label space of the annotations.
//! The action prototype table, on the other hand, is laid out in buckets of
//! exactly 300 rows per verb (one row per noun), so flattened prediction
//! indices decode with a base-300 stride.

use anyhow::Result;
use candle_core::Tensor;

use crate::error::PrototypeError;

/// Stride between verbs in dataset action labels
pub const LABEL_SPACE_NOUN_STRIDE: i64 = 1000;

/// Rows per verb bucket in the action prototype table
pub const MODEL_NOUN_BUCKET_SIZE: usize = 300;

/// Compose a dataset action label from verb and noun ids.
pub fn compose_action_label(verb: u32, noun: u32) -> i64 {
    verb as i64 * LABEL_SPACE_NOUN_STRIDE + noun as i64
}

/// Split a dataset action label back into `(verb, noun)`.
pub fn split_action_label(action: i64) -> (u32, u32) {
    (
        (action / LABEL_SPACE_NOUN_STRIDE) as u32,
        (action % LABEL_SPACE_NOUN_STRIDE) as u32,
    )
}

/// A prediction decoded from a flattened bucket index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComposedPrediction {
    pub noun: u32,
    pub verb: u32,
    /// Index of the predicted action in the bucketed prototype layout
    pub bucketed_action: i64,
}

/// Decode a flattened index over concatenated verb buckets. `bucket_verbs`
/// lists the verb id behind each bucket, in concatenation order.
pub fn decode_bucketed_prediction(
    flat_index: usize,
    bucket_verbs: &[u32],
) -> Result<ComposedPrediction> {
    let noun = (flat_index % MODEL_NOUN_BUCKET_SIZE) as u32;
    let slot = flat_index / MODEL_NOUN_BUCKET_SIZE;
    let verb = *bucket_verbs.get(slot).ok_or(PrototypeError::VerbOutOfRange {
        verb: slot as u32,
        buckets: bucket_verbs.len(),
    })?;
    Ok(ComposedPrediction {
        noun,
        verb,
        bucketed_action: verb as i64 * MODEL_NOUN_BUCKET_SIZE as i64 + noun as i64,
    })
}

/// Gather per-example noun prototype slabs from the bucketed action table.
///
/// `action_prototypes` is `(verbs * 300, d)` laid out verb-major. For each
/// example's verb id the matching 300-row slice is selected; duplicate verbs
/// in the batch share a single gathered copy. Returns `(batch, 300, d)`.
/// The result depends only on each example's own verb, never on how the
/// batch is ordered.
pub fn select_verb_buckets(verb_ids: &[u32], action_prototypes: &Tensor) -> Result<Tensor> {
    let (rows, width) = action_prototypes.dims2()?;
    let buckets = rows / MODEL_NOUN_BUCKET_SIZE;
    let mut unique: Vec<u32> = verb_ids.to_vec();
    unique.sort_unstable();
    unique.dedup();
    for &v in &unique {
        if v as usize >= buckets {
            return Err(PrototypeError::VerbOutOfRange { verb: v, buckets }.into());
        }
    }

    let device = action_prototypes.device();
    let mut slabs = Vec::with_capacity(unique.len());
    for &v in &unique {
        slabs.push(
            action_prototypes
                .narrow(0, v as usize * MODEL_NOUN_BUCKET_SIZE, MODEL_NOUN_BUCKET_SIZE)?
                .reshape((1, MODEL_NOUN_BUCKET_SIZE, width))?,
        );
    }
    let slab_refs: Vec<&Tensor> = slabs.iter().collect();
    let stacked = Tensor::cat(&slab_refs, 0)?; // (unique, 300, d)

    let inverse: Vec<u32> = verb_ids
        .iter()
        .map(|v| unique.binary_search(v).unwrap_or(0) as u32)
        .collect();
    let inverse = Tensor::from_vec(inverse, verb_ids.len(), device)?;
    Ok(stacked.index_select(&inverse, 0)?)
}
