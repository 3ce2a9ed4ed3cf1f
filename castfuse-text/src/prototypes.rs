use std::collections::HashMap;

use anyhow::Result;
use candle_core::{Tensor, D};

use crate::error::PrototypeError;

/// Temperature applied to cosine logits
pub const LOGIT_TEMPERATURE: f64 = 0.07;

/// Norm floor guarding cosine normalization against zero vectors
const NORM_EPS: f64 = 1e-8;

/// Norm below which a prototype row is considered degenerate
const DEGENERATE_NORM: f32 = 1e-6;

/// Anything that can turn class-name strings into a `(names, width)` feature
/// matrix. Implementations typically wrap a frozen text encoder and a cache.
pub trait TextEmbedder {
    fn embed(&self, names: &[String]) -> Result<Tensor>;
    fn width(&self) -> usize;
}

/// Unit-normalize the rows of a `(n, d)` (or `(b, n, d)`) tensor.
pub fn normalize_rows(t: &Tensor) -> Result<Tensor> {
    let norm = t.sqr()?.sum_keepdim(D::Minus1)?.sqrt()?;
    let norm = norm.maximum(NORM_EPS)?;
    Ok(t.broadcast_div(&norm)?)
}

/// Fixed table of text-embedded class prototypes. Rows are stored both raw
/// and unit-normalized; lookups are by class name.
pub struct PrototypeTable {
    names: Vec<String>,
    index: HashMap<String, usize>,
    embeddings: Tensor,
    normalized: Tensor,
}

impl PrototypeTable {
    /// Embed `names` through `embedder` and build the table. Rejects tables
    /// whose row count disagrees with the name list and rows whose norm is
    /// too small to cosine-score.
    pub fn build(embedder: &dyn TextEmbedder, names: &[String]) -> Result<Self> {
        let embeddings = embedder.embed(names)?;
        Self::from_embeddings(names.to_vec(), embeddings)
    }

    pub fn from_embeddings(names: Vec<String>, embeddings: Tensor) -> Result<Self> {
        let rows = embeddings.dim(0)?;
        if rows != names.len() {
            return Err(PrototypeError::RowCountMismatch {
                expected: names.len(),
                got: rows,
            }
            .into());
        }
        let norms = embeddings
            .sqr()?
            .sum(D::Minus1)?
            .sqrt()?
            .to_vec1::<f32>()?;
        if let Some(bad) = norms.iter().position(|n| *n < DEGENERATE_NORM) {
            return Err(PrototypeError::DegenerateFeature {
                index: bad,
                name: names[bad].clone(),
            }
            .into());
        }
        let normalized = normalize_rows(&embeddings)?;
        let index = names
            .iter()
            .enumerate()
            .map(|(i, n)| (n.clone(), i))
            .collect();
        tracing::debug!(rows, "built prototype table");
        Ok(Self { names, index, embeddings, normalized })
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn width(&self) -> Result<usize> {
        Ok(self.embeddings.dim(1)?)
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    /// Raw embedding rows, `(len, width)`.
    pub fn embeddings(&self) -> &Tensor {
        &self.embeddings
    }

    /// Unit-normalized rows, `(len, width)`.
    pub fn normalized(&self) -> &Tensor {
        &self.normalized
    }

    /// Gather the raw rows for `names`, preserving their order.
    pub fn rows_for(&self, names: &[String]) -> Result<Tensor> {
        let idx = self.indices_for(names)?;
        let idx = Tensor::from_vec(idx, names.len(), self.embeddings.device())?;
        Ok(self.embeddings.index_select(&idx, 0)?)
    }

    /// Restrict the table to `names`, preserving their order.
    pub fn subset(&self, names: &[String]) -> Result<Self> {
        let rows = self.rows_for(names)?;
        Self::from_embeddings(names.to_vec(), rows)
    }

    fn indices_for(&self, names: &[String]) -> Result<Vec<u32>> {
        names
            .iter()
            .map(|n| {
                self.index
                    .get(n)
                    .map(|i| *i as u32)
                    .ok_or_else(|| PrototypeError::VocabularyMismatch { name: n.clone() }.into())
            })
            .collect()
    }
}

/// Temperature-scaled cosine logits of `features` `(b, d)` against a
/// normalized prototype matrix `(n, d)`; returns `(b, n)`. Both sides are
/// unit-normalized, so scaling a feature vector leaves its logits unchanged.
pub fn similarity_logits(features: &Tensor, normalized_prototypes: &Tensor) -> Result<Tensor> {
    let features = normalize_rows(features)?;
    let logits = features.matmul(&normalized_prototypes.t()?.contiguous()?)?;
    Ok(logits.affine(1.0 / LOGIT_TEMPERATURE, 0.0)?)
}

/// Per-example variant: `features` `(b, d)` against per-example prototype
/// slabs `(b, k, d)`; returns `(b, k)`.
pub fn bucketed_logits(features: &Tensor, prototypes: &Tensor) -> Result<Tensor> {
    let features = normalize_rows(features)?;
    let prototypes = normalize_rows(prototypes)?;
    let logits = prototypes
        .matmul(&features.unsqueeze(2)?)?
        .squeeze(2)?;
    Ok(logits.affine(1.0 / LOGIT_TEMPERATURE, 0.0)?)
}
