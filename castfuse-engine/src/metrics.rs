use anyhow::Result;
use candle_core::{DType, Tensor};

use castfuse_text::LABEL_SPACE_NOUN_STRIDE;

/// Top-k class indices per row of a `(batch, classes)` logit tensor,
/// best first.
pub fn topk_indices(logits: &Tensor, k: usize) -> Result<Vec<Vec<u32>>> {
    let rows = logits.to_dtype(DType::F32)?.to_vec2::<f32>()?;
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let mut idx: Vec<u32> = (0..row.len() as u32).collect();
        idx.sort_by(|&a, &b| {
            row[b as usize]
                .partial_cmp(&row[a as usize])
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        idx.truncate(k.min(row.len()));
        out.push(idx);
    }
    Ok(out)
}

/// Top-k accuracy in percent for each requested k.
pub fn accuracy(logits: &Tensor, targets: &Tensor, topk: &[usize]) -> Result<Vec<f64>> {
    let max_k = topk.iter().copied().max().unwrap_or(1);
    let preds = topk_indices(logits, max_k)?;
    let targets = targets.to_dtype(DType::I64)?.to_vec1::<i64>()?;
    let batch = targets.len().max(1);
    let mut out = Vec::with_capacity(topk.len());
    for &k in topk {
        let hits = preds
            .iter()
            .zip(&targets)
            .filter(|(p, t)| p.iter().take(k).any(|&i| i as i64 == **t))
            .count();
        out.push(100.0 * hits as f64 / batch as f64);
    }
    Ok(out)
}

/// Composite accuracy over composed action labels. For each k, every
/// (top-k verb, top-k noun) pair is recomposed on the dataset's base-1000
/// stride and matched exactly against the target label.
pub fn action_accuracy(
    noun_logits: &Tensor,
    verb_logits: &Tensor,
    action_targets: &[i64],
    topk: &[usize],
) -> Result<Vec<f64>> {
    let max_k = topk.iter().copied().max().unwrap_or(1);
    let noun_preds = topk_indices(noun_logits, max_k)?;
    let verb_preds = topk_indices(verb_logits, max_k)?;
    let batch = action_targets.len().max(1);
    let mut out = Vec::with_capacity(topk.len());
    for &k in topk {
        let hits = noun_preds
            .iter()
            .zip(&verb_preds)
            .zip(action_targets)
            .filter(|((nouns, verbs), target)| {
                verbs.iter().take(k).any(|&v| {
                    nouns
                        .iter()
                        .take(k)
                        .any(|&n| v as i64 * LABEL_SPACE_NOUN_STRIDE + n as i64 == **target)
                })
            })
            .count();
        out.push(100.0 * hits as f64 / batch as f64);
    }
    Ok(out)
}

/// Destination for step-level metrics.
pub trait MetricSink {
    fn record(&mut self, name: &str, value: f64);
}

/// Sink that forwards every metric to the tracing subscriber.
#[derive(Default)]
pub struct TracingSink;

impl MetricSink for TracingSink {
    fn record(&mut self, name: &str, value: f64) {
        tracing::debug!(metric = name, value, "step metric");
    }
}
