//! Multi-crop test merging. Test-time augmentation produces several scored
//! clips per video (spatial crops x temporal chunks); clip scores are
//! softmaxed, duplicates dropped, averaged per video, and reduced to video
//! level top-1/top-5 metrics. Videos are processed in parallel.

use std::collections::{HashMap, HashSet};

use anyhow::Result;
use rayon::prelude::*;

use crate::error::EngineError;

/// Scores for one test clip of one video.
#[derive(Debug, Clone)]
pub struct ClipPrediction {
    pub video_id: String,
    pub noun_scores: Vec<f32>,
    pub verb_scores: Vec<f32>,
    pub noun_label: u32,
    pub verb_label: u32,
    /// Temporal chunk index of this clip
    pub chunk: u32,
    /// Spatial crop index of this clip
    pub split: u32,
}

/// Per-video outcome after merging.
#[derive(Debug, Clone)]
pub struct VideoScores {
    pub video_id: String,
    pub pred_noun: u32,
    pub pred_verb: u32,
    pub noun_top1: bool,
    pub noun_top5: bool,
    pub verb_top1: bool,
    pub verb_top5: bool,
    /// Exact match on both parts
    pub action_top1: bool,
    /// Noun in its top five and verb in its top five
    pub action_top5: bool,
}

/// Aggregated percentages over all merged videos.
#[derive(Debug, Clone, Copy)]
pub struct MergedMetrics {
    pub videos: usize,
    pub noun_top1: f64,
    pub noun_top5: f64,
    pub verb_top1: f64,
    pub verb_top5: f64,
    pub action_top1: f64,
    pub action_top5: f64,
}

fn softmax(scores: &[f32]) -> Vec<f32> {
    let max = scores.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = scores.iter().map(|s| (s - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.iter().map(|e| e / sum).collect()
}

fn top5(avg: &[f32]) -> Vec<u32> {
    let mut idx: Vec<u32> = (0..avg.len() as u32).collect();
    idx.sort_by(|&a, &b| {
        avg[b as usize]
            .partial_cmp(&avg[a as usize])
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    idx.truncate(5);
    idx
}

fn average_softmax(clips: &[&ClipPrediction], pick: fn(&ClipPrediction) -> &Vec<f32>) -> Vec<f32> {
    let classes = pick(clips[0]).len();
    let mut avg = vec![0f32; classes];
    for clip in clips {
        for (a, s) in avg.iter_mut().zip(softmax(pick(clip))) {
            *a += s;
        }
    }
    for a in &mut avg {
        *a /= clips.len() as f32;
    }
    avg
}

fn compute_video(video_id: &str, clips: &[&ClipPrediction]) -> VideoScores {
    let noun_avg = average_softmax(clips, |c| &c.noun_scores);
    let verb_avg = average_softmax(clips, |c| &c.verb_scores);
    let noun_top = top5(&noun_avg);
    let verb_top = top5(&verb_avg);
    let noun_label = clips[0].noun_label;
    let verb_label = clips[0].verb_label;

    let noun_top1 = noun_top[0] == noun_label;
    let verb_top1 = verb_top[0] == verb_label;
    let noun_top5 = noun_top.contains(&noun_label);
    let verb_top5 = verb_top.contains(&verb_label);
    VideoScores {
        video_id: video_id.to_string(),
        pred_noun: noun_top[0],
        pred_verb: verb_top[0],
        noun_top1,
        noun_top5,
        verb_top1,
        verb_top5,
        action_top1: noun_top1 && verb_top1,
        action_top5: noun_top5 && verb_top5,
    }
}

/// Merge clip-level predictions into per-video scores and aggregate
/// metrics. Duplicate (chunk, split) entries for a video are dropped.
pub fn merge_clip_predictions(
    predictions: &[ClipPrediction],
) -> Result<(MergedMetrics, Vec<VideoScores>)> {
    if predictions.is_empty() {
        return Err(EngineError::EmptyBatch.into());
    }
    let mut by_video: HashMap<&str, Vec<&ClipPrediction>> = HashMap::new();
    let mut dedupe: HashSet<(&str, u32, u32)> = HashSet::new();
    for p in predictions {
        if dedupe.insert((p.video_id.as_str(), p.chunk, p.split)) {
            by_video.entry(p.video_id.as_str()).or_default().push(p);
        }
    }

    let mut videos: Vec<(&str, Vec<&ClipPrediction>)> = by_video.into_iter().collect();
    videos.sort_by_key(|(id, _)| *id);

    let scores: Vec<VideoScores> = videos
        .par_iter()
        .map(|(id, clips)| compute_video(id, clips))
        .collect();

    let n = scores.len();
    let pct = |f: fn(&VideoScores) -> bool| -> f64 {
        100.0 * scores.iter().filter(|s| f(s)).count() as f64 / n as f64
    };
    let metrics = MergedMetrics {
        videos: n,
        noun_top1: pct(|s| s.noun_top1),
        noun_top5: pct(|s| s.noun_top5),
        verb_top1: pct(|s| s.verb_top1),
        verb_top5: pct(|s| s.verb_top5),
        action_top1: pct(|s| s.action_top1),
        action_top5: pct(|s| s.action_top5),
    };
    tracing::info!(
        videos = n,
        action_top1 = metrics.action_top1,
        "merged clip predictions"
    );
    Ok((metrics, scores))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clip(id: &str, noun: &[f32], verb: &[f32], chunk: u32, split: u32) -> ClipPrediction {
        ClipPrediction {
            video_id: id.to_string(),
            noun_scores: noun.to_vec(),
            verb_scores: verb.to_vec(),
            noun_label: 1,
            verb_label: 0,
            chunk,
            split,
        }
    }

    #[test]
    fn test_duplicate_crops_are_dropped() {
        // a wildly confident duplicate must not tilt the average
        let good = clip("v0", &[0.0, 5.0, 0.0], &[5.0, 0.0], 0, 0);
        let bad_dup = clip("v0", &[50.0, 0.0, 0.0], &[0.0, 50.0], 0, 0);
        let (metrics, scores) = merge_clip_predictions(&[good, bad_dup]).unwrap();
        assert_eq!(metrics.videos, 1);
        assert!(scores[0].noun_top1);
        assert!(scores[0].verb_top1);
    }

    #[test]
    fn test_averaging_across_crops() {
        // one confident correct crop outweighs one mildly wrong crop
        let a = clip("v0", &[0.0, 8.0, 0.0], &[8.0, 0.0], 0, 0);
        let b = clip("v0", &[0.5, 0.0, 0.0], &[0.0, 0.5], 1, 0);
        let (metrics, _) = merge_clip_predictions(&[a, b]).unwrap();
        assert!((metrics.noun_top1 - 100.0).abs() < 1e-9);
        assert!((metrics.verb_top1 - 100.0).abs() < 1e-9);
        assert!((metrics.action_top1 - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_action_top5_needs_both_parts_in_top5() {
        // noun label inside top-5, verb label pushed out of top-5
        let mut noun = vec![0f32; 10];
        noun[1] = 0.5; // label 1 in top5 but not top1
        noun[7] = 1.0;
        let mut verb = vec![0f32; 8];
        for (i, v) in verb.iter_mut().enumerate().take(6) {
            *v = 2.0 + i as f32; // labels 0..6 dominate; label 0 is weakest
        }
        verb[0] = -5.0; // push the true verb out of top-5
        let c = clip("v0", &noun, &verb, 0, 0);
        let (metrics, scores) = merge_clip_predictions(&[c]).unwrap();
        assert!(scores[0].noun_top5);
        assert!(!scores[0].verb_top5);
        assert!((metrics.action_top5 - 0.0).abs() < 1e-9);
    }

    #[test]
    fn test_multiple_videos_aggregate() {
        let v0 = clip("v0", &[0.0, 5.0], &[5.0, 0.0], 0, 0); // correct
        let v1 = clip("v1", &[5.0, 0.0], &[5.0, 0.0], 0, 0); // noun wrong
        let (metrics, scores) = merge_clip_predictions(&[v0, v1]).unwrap();
        assert_eq!(metrics.videos, 2);
        assert_eq!(scores.len(), 2);
        assert!((metrics.noun_top1 - 50.0).abs() < 1e-9);
        assert!((metrics.verb_top1 - 100.0).abs() < 1e-9);
        assert!((metrics.action_top1 - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_empty_input_rejected() {
        assert!(merge_clip_predictions(&[]).is_err());
    }
}
