//! Batch-level training and evaluation steps for the composition model.
//!
//! Training scores the noun feature against the 300-row prototype bucket of
//! each example's ground-truth verb; evaluation buckets by the predicted
//! verb instead. Open-vocabulary evaluation scores both noun and verb
//! features against caller-selected prototype tables and reports seen and
//! unseen subsets separately.

use anyhow::Result;
use candle_core::{DType, Tensor, D};
use candle_nn::loss::cross_entropy;

use castfuse_model::{CastModel, CompositionScores, ModelInput};
use castfuse_text::{
    bucketed_logits, compose::compose_action_label, decode_bucketed_prediction,
    select_verb_buckets, similarity_logits, ComposedPrediction, PrototypeTable,
};

use crate::error::EngineError;
use crate::metrics::{accuracy, action_accuracy, MetricSink};

/// One composition batch. Targets are `(batch,)` integer tensors; `seen`
/// flags examples whose action class was in the training vocabulary.
pub struct CompositionBatch<'a> {
    pub video: &'a Tensor,
    pub spec: Option<&'a Tensor>,
    pub spans: Option<&'a Tensor>,
    pub noun_targets: &'a Tensor,
    pub verb_targets: &'a Tensor,
    pub seen: Option<&'a [bool]>,
}

impl<'a> CompositionBatch<'a> {
    fn input(&self) -> ModelInput<'a> {
        ModelInput {
            video: self.video,
            spec: self.spec,
            spans: self.spans,
        }
    }

    fn check(&self) -> Result<usize> {
        let batch = self.video.dim(0)?;
        if batch == 0 {
            return Err(EngineError::EmptyBatch.into());
        }
        for (field, len) in [
            ("noun_targets", self.noun_targets.dim(0)?),
            ("verb_targets", self.verb_targets.dim(0)?),
        ] {
            if len != batch {
                return Err(EngineError::BatchSizeMismatch {
                    field,
                    expected: batch,
                    got: len,
                }
                .into());
            }
        }
        if let Some(seen) = self.seen {
            if seen.len() != batch {
                return Err(EngineError::BatchSizeMismatch {
                    field: "seen",
                    expected: batch,
                    got: seen.len(),
                }
                .into());
            }
        }
        Ok(batch)
    }

    fn verb_ids(&self) -> Result<Vec<u32>> {
        Ok(self.verb_targets.to_dtype(DType::U32)?.to_vec1::<u32>()?)
    }

    fn noun_ids(&self) -> Result<Vec<u32>> {
        Ok(self.noun_targets.to_dtype(DType::U32)?.to_vec1::<u32>()?)
    }

    fn action_labels(&self) -> Result<Vec<i64>> {
        Ok(self
            .verb_ids()?
            .iter()
            .zip(self.noun_ids()?)
            .map(|(&v, n)| compose_action_label(v, n))
            .collect())
    }
}

pub struct TrainOutput {
    /// Summed noun + verb loss, kept as a tensor for backprop
    pub loss: Tensor,
    pub loss_value: f64,
    pub noun_logits: Tensor,
    pub verb_logits: Tensor,
}

/// One training step: noun features are scored against the prototype bucket
/// of the ground-truth verb, verbs against the closed head. A non-finite
/// loss halts the step before it can reach the optimizer.
pub fn composition_train_step(
    model: &CastModel,
    action_prototypes: &PrototypeTable,
    batch: &CompositionBatch,
) -> Result<TrainOutput> {
    batch.check()?;
    let (noun_embed, verb_logits) = model.forward_prompt(&batch.input(), true)?;
    let slabs = select_verb_buckets(&batch.verb_ids()?, action_prototypes.embeddings())?;
    let noun_logits = bucketed_logits(&noun_embed, &slabs)?;

    let noun_t = batch.noun_targets.to_dtype(DType::U32)?;
    let verb_t = batch.verb_targets.to_dtype(DType::U32)?;
    let loss = (cross_entropy(&noun_logits, &noun_t)? + cross_entropy(&verb_logits, &verb_t)?)?;
    let loss_value = loss.to_dtype(DType::F32)?.to_scalar::<f32>()? as f64;
    if !loss_value.is_finite() {
        return Err(EngineError::NonFiniteLoss { loss: loss_value }.into());
    }
    Ok(TrainOutput {
        loss,
        loss_value,
        noun_logits,
        verb_logits,
    })
}

pub struct ValidationOutput {
    pub batch: usize,
    pub noun_acc: Vec<f64>,
    pub verb_acc: Vec<f64>,
    pub action_acc: Vec<f64>,
    /// Per-example decoded top-1 predictions in the bucketed layout
    pub predictions: Vec<ComposedPrediction>,
}

/// Closed-vocabulary validation. Nouns are scored inside the bucket of the
/// *predicted* verb; bucket-local noun indices coincide with global noun
/// ids, so accuracies compare directly against the targets.
pub fn composition_validation_step(
    model: &CastModel,
    action_prototypes: &PrototypeTable,
    batch: &CompositionBatch,
    sink: &mut dyn MetricSink,
) -> Result<ValidationOutput> {
    let batch_size = batch.check()?;
    let (noun_embed, verb_logits) = model.forward_prompt(&batch.input(), false)?;
    let pred_verbs: Vec<u32> = verb_logits
        .argmax(D::Minus1)?
        .to_dtype(DType::U32)?
        .to_vec1::<u32>()?;
    let slabs = select_verb_buckets(&pred_verbs, action_prototypes.embeddings())?;
    let noun_logits = bucketed_logits(&noun_embed, &slabs)?;

    // each example's slab is the single bucket of its predicted verb, so the
    // flat argmax decodes against a one-bucket layout
    let flat_nouns: Vec<u32> = noun_logits
        .argmax(D::Minus1)?
        .to_dtype(DType::U32)?
        .to_vec1::<u32>()?;
    let predictions = flat_nouns
        .iter()
        .zip(&pred_verbs)
        .map(|(&idx, &verb)| decode_bucketed_prediction(idx as usize, &[verb]))
        .collect::<Result<Vec<_>>>()?;

    let topk = [1usize, 5];
    let noun_acc = accuracy(&noun_logits, batch.noun_targets, &topk)?;
    let verb_acc = accuracy(&verb_logits, batch.verb_targets, &topk)?;
    let action_acc = action_accuracy(&noun_logits, &verb_logits, &batch.action_labels()?, &topk)?;

    sink.record("val/noun_top1", noun_acc[0]);
    sink.record("val/verb_top1", verb_acc[0]);
    sink.record("val/action_top1", action_acc[0]);
    Ok(ValidationOutput {
        batch: batch_size,
        noun_acc,
        verb_acc,
        action_acc,
        predictions,
    })
}

/// Which side of the composition is open-vocabulary. The open side is scored
/// against its prototype table; the other side keeps its closed head logits,
/// so its targets index the closed vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OvMode {
    Both,
    Noun,
    Verb,
}

/// Prototype tables for one open-vocabulary evaluation. For `OvMode::Noun`
/// the verb table is simply the full (seen) verb vocabulary, and vice versa.
/// Targets in the batch index into these tables.
pub struct OvTables {
    pub nouns: PrototypeTable,
    pub verbs: PrototypeTable,
}

#[derive(Debug, Clone, Copy)]
pub struct SplitMetrics {
    pub count: usize,
    pub noun_top1: f64,
    pub verb_top1: f64,
    pub action_top1: f64,
}

#[derive(Debug)]
pub struct OvReport {
    pub mode: OvMode,
    pub seen: Option<SplitMetrics>,
    pub unseen: Option<SplitMetrics>,
}

fn split_metrics(
    noun_logits: &Tensor,
    verb_logits: &Tensor,
    batch: &CompositionBatch,
    indices: &[u32],
) -> Result<Option<SplitMetrics>> {
    if indices.is_empty() {
        return Ok(None);
    }
    let idx = Tensor::from_vec(indices.to_vec(), indices.len(), noun_logits.device())?;
    let nl = noun_logits.index_select(&idx, 0)?;
    let vl = verb_logits.index_select(&idx, 0)?;
    let nt = batch.noun_targets.index_select(&idx, 0)?;
    let vt = batch.verb_targets.index_select(&idx, 0)?;
    let actions: Vec<i64> = {
        let all = batch.action_labels()?;
        indices.iter().map(|&i| all[i as usize]).collect()
    };
    Ok(Some(SplitMetrics {
        count: indices.len(),
        noun_top1: accuracy(&nl, &nt, &[1])?[0],
        verb_top1: accuracy(&vl, &vt, &[1])?[0],
        action_top1: action_accuracy(&nl, &vl, &actions, &[1])?[0],
    }))
}

/// Pick each side's logit source for `mode`: prototype similarity on the
/// open side, the closed head on the other.
fn select_mode_logits(
    mode: OvMode,
    scores: &CompositionScores,
    tables: &OvTables,
) -> Result<(Tensor, Tensor)> {
    let noun_logits = match mode {
        OvMode::Both | OvMode::Noun => {
            let embed = scores
                .noun_embed
                .as_ref()
                .ok_or(EngineError::MissingProjection { side: "noun" })?;
            similarity_logits(embed, tables.nouns.normalized())?
        }
        OvMode::Verb => scores.noun_logits.clone(),
    };
    let verb_logits = match mode {
        OvMode::Both | OvMode::Verb => {
            let embed = scores
                .verb_embed
                .as_ref()
                .ok_or(EngineError::MissingProjection { side: "verb" })?;
            similarity_logits(embed, tables.verbs.normalized())?
        }
        OvMode::Noun => scores.verb_logits.clone(),
    };
    Ok((noun_logits, verb_logits))
}

/// Open-vocabulary evaluation step. The sides selected by `mode` are scored
/// against the supplied prototype tables; examples are partitioned by their
/// `seen` flag and each non-empty subset is reported on its own.
pub fn open_vocab_eval_step(
    model: &CastModel,
    tables: &OvTables,
    mode: OvMode,
    batch: &CompositionBatch,
) -> Result<OvReport> {
    let batch_size = batch.check()?;
    let scores = model.forward_scores(&batch.input(), false)?;
    let (noun_logits, verb_logits) = select_mode_logits(mode, &scores, tables)?;

    let seen_flags = batch.seen.map(|s| s.to_vec()).unwrap_or(vec![true; batch_size]);
    let seen_idx: Vec<u32> = (0..batch_size as u32)
        .filter(|&i| seen_flags[i as usize])
        .collect();
    let unseen_idx: Vec<u32> = (0..batch_size as u32)
        .filter(|&i| !seen_flags[i as usize])
        .collect();

    Ok(OvReport {
        mode,
        seen: split_metrics(&noun_logits, &verb_logits, batch, &seen_idx)?,
        unseen: split_metrics(&noun_logits, &verb_logits, batch, &unseen_idx)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::TracingSink;
    use candle_core::Device;
    use candle_nn::{VarBuilder, VarMap};
    use castfuse_model::ModelConfig;
    use castfuse_text::MODEL_NOUN_BUCKET_SIZE;

    fn tiny_model() -> CastModel {
        let cfg = ModelConfig {
            img_size: 32,
            patch_size: 16,
            embed_dim: 32,
            depth: 1,
            num_heads: 4,
            num_frames: 4,
            drop_path_rate: 0.0,
            composition: true,
            noun_classes: MODEL_NOUN_BUCKET_SIZE,
            verb_classes: 4,
            prototype_dim: Some(16),
            audio: None,
            ..Default::default()
        };
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        CastModel::new(cfg, vb).unwrap()
    }

    fn action_table(verbs: usize) -> PrototypeTable {
        let rows = verbs * MODEL_NOUN_BUCKET_SIZE;
        let emb = Tensor::rand(0.5f32, 1.5f32, (rows, 16), &Device::Cpu).unwrap();
        let names = (0..rows).map(|i| format!("action-{i}")).collect();
        PrototypeTable::from_embeddings(names, emb).unwrap()
    }

    #[test]
    fn test_train_step_produces_finite_loss() {
        let model = tiny_model();
        let table = action_table(4);
        let video = Tensor::rand(0f32, 1f32, (2, 3, 4, 32, 32), &Device::Cpu).unwrap();
        let nouns = Tensor::new(&[3u32, 17], &Device::Cpu).unwrap();
        let verbs = Tensor::new(&[0u32, 2], &Device::Cpu).unwrap();
        let batch = CompositionBatch {
            video: &video,
            spec: None,
            spans: None,
            noun_targets: &nouns,
            verb_targets: &verbs,
            seen: None,
        };
        let out = composition_train_step(&model, &table, &batch).unwrap();
        assert!(out.loss_value.is_finite());
        assert_eq!(out.noun_logits.dims(), &[2, MODEL_NOUN_BUCKET_SIZE]);
        assert_eq!(out.verb_logits.dims(), &[2, 4]);
    }

    #[test]
    fn test_validation_step_reports_all_metrics() {
        let model = tiny_model();
        let table = action_table(4);
        let video = Tensor::rand(0f32, 1f32, (2, 3, 4, 32, 32), &Device::Cpu).unwrap();
        let nouns = Tensor::new(&[3u32, 17], &Device::Cpu).unwrap();
        let verbs = Tensor::new(&[0u32, 2], &Device::Cpu).unwrap();
        let batch = CompositionBatch {
            video: &video,
            spec: None,
            spans: None,
            noun_targets: &nouns,
            verb_targets: &verbs,
            seen: None,
        };
        let mut sink = TracingSink;
        let out = composition_validation_step(&model, &table, &batch, &mut sink).unwrap();
        assert_eq!(out.batch, 2);
        assert_eq!(out.noun_acc.len(), 2);
        for acc in out.noun_acc.iter().chain(&out.verb_acc).chain(&out.action_acc) {
            assert!((0.0..=100.0).contains(acc));
        }
        // every example decodes to a prediction inside its predicted-verb
        // bucket, with the bucketed action index rebuilt from its parts
        assert_eq!(out.predictions.len(), 2);
        for p in &out.predictions {
            assert!((p.noun as usize) < MODEL_NOUN_BUCKET_SIZE);
            assert!(p.verb < 4);
            assert_eq!(
                p.bucketed_action,
                p.verb as i64 * MODEL_NOUN_BUCKET_SIZE as i64 + p.noun as i64
            );
        }
    }

    #[test]
    fn test_mode_selects_logit_source() {
        let dev = Device::Cpu;
        let tables = OvTables {
            nouns: PrototypeTable::from_embeddings(
                (0..6).map(|i| format!("noun-{i}")).collect(),
                Tensor::rand(0.5f32, 1.5f32, (6, 16), &dev).unwrap(),
            )
            .unwrap(),
            verbs: PrototypeTable::from_embeddings(
                (0..5).map(|i| format!("verb-{i}")).collect(),
                Tensor::rand(0.5f32, 1.5f32, (5, 16), &dev).unwrap(),
            )
            .unwrap(),
        };
        let scores = CompositionScores {
            noun_logits: Tensor::rand(0f32, 1f32, (2, 300), &dev).unwrap(),
            verb_logits: Tensor::rand(0f32, 1f32, (2, 4), &dev).unwrap(),
            noun_embed: Some(Tensor::rand(0.5f32, 1.5f32, (2, 16), &dev).unwrap()),
            verb_embed: Some(Tensor::rand(0.5f32, 1.5f32, (2, 16), &dev).unwrap()),
        };

        let (n, v) = select_mode_logits(OvMode::Both, &scores, &tables).unwrap();
        assert_eq!(n.dims(), &[2, 6]);
        assert_eq!(v.dims(), &[2, 5]);

        // the closed side keeps its head logits
        let (n, v) = select_mode_logits(OvMode::Noun, &scores, &tables).unwrap();
        assert_eq!(n.dims(), &[2, 6]);
        assert_eq!(v.dims(), &[2, 4]);

        let (n, v) = select_mode_logits(OvMode::Verb, &scores, &tables).unwrap();
        assert_eq!(n.dims(), &[2, 300]);
        assert_eq!(v.dims(), &[2, 5]);

        // scoring an open side without its projection is an error
        let scores = CompositionScores { verb_embed: None, ..scores };
        assert!(select_mode_logits(OvMode::Verb, &scores, &tables).is_err());
        assert!(select_mode_logits(OvMode::Noun, &scores, &tables).is_ok());
    }

    #[test]
    fn test_open_vocab_splits_seen_unseen() {
        let model = tiny_model();
        let nouns = PrototypeTable::from_embeddings(
            (0..6).map(|i| format!("noun-{i}")).collect(),
            Tensor::rand(0.5f32, 1.5f32, (6, 16), &Device::Cpu).unwrap(),
        )
        .unwrap();
        let verbs = PrototypeTable::from_embeddings(
            (0..4).map(|i| format!("verb-{i}")).collect(),
            Tensor::rand(0.5f32, 1.5f32, (4, 16), &Device::Cpu).unwrap(),
        )
        .unwrap();
        let tables = OvTables { nouns, verbs };
        let video = Tensor::rand(0f32, 1f32, (2, 3, 4, 32, 32), &Device::Cpu).unwrap();
        let noun_t = Tensor::new(&[1u32, 5], &Device::Cpu).unwrap();
        let verb_t = Tensor::new(&[0u32, 3], &Device::Cpu).unwrap();
        let seen = [true, false];
        let batch = CompositionBatch {
            video: &video,
            spec: None,
            spans: None,
            noun_targets: &noun_t,
            verb_targets: &verb_t,
            seen: Some(&seen),
        };
        let report = open_vocab_eval_step(&model, &tables, OvMode::Both, &batch).unwrap();
        assert_eq!(report.seen.unwrap().count, 1);
        assert_eq!(report.unseen.unwrap().count, 1);

        // all-seen batches skip the unseen split entirely
        let seen = [true, true];
        let batch = CompositionBatch { seen: Some(&seen), ..batch };
        let report = open_vocab_eval_step(&model, &tables, OvMode::Both, &batch).unwrap();
        assert!(report.unseen.is_none());
        assert_eq!(report.seen.unwrap().count, 2);
    }

    #[test]
    fn test_empty_batch_rejected() {
        let model = tiny_model();
        let table = action_table(4);
        let video = Tensor::zeros((0, 3, 4, 32, 32), DType::F32, &Device::Cpu).unwrap();
        let t = Tensor::zeros(0, DType::U32, &Device::Cpu).unwrap();
        let batch = CompositionBatch {
            video: &video,
            spec: None,
            spans: None,
            noun_targets: &t,
            verb_targets: &t,
            seen: None,
        };
        assert!(composition_train_step(&model, &table, &batch).is_err());
    }
}
