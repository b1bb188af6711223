//! Ensemble training over the labeled feedback corpus.
//!
//! Each ensemble member is a multi-class stump-GBDT fitted with softmax
//! gradient boosting on a bootstrap resample of the training split.
//! Member diversity comes entirely from the resampling; the boosting
//! procedure itself is deterministic for a given sample order.

use std::sync::atomic::{AtomicBool, Ordering};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;

use crate::inference::features::{FEAT_VERSION, FEATURE_LEN, feature_vector};
use crate::inference::stump::{StumpModel, StumpSplit, softmax};
use crate::review::feedback::LabeledImage;
use crate::taxonomy::Taxonomy;

/// Split-search bin count. Coarse on purpose: stump splits over 8x8 grid
/// features do not benefit from finer quantization.
const SPLIT_BINS: usize = 32;

#[derive(Debug, Error)]
pub enum TrainError {
    #[error("Training cancelled")]
    Cancelled,
    #[error("Training failed: {0}")]
    Failed(String),
}

/// Hyperparameters for one training run.
#[derive(Debug, Clone)]
pub struct TrainOptions {
    /// Number of ensemble members to fit.
    pub members: usize,
    /// Boosting rounds per member.
    pub rounds: usize,
    /// Learning rate applied per round.
    pub learning_rate: f32,
    /// Base seed; member `i` resamples with `seed + i`.
    pub seed: u64,
}

/// Feature matrix plus aligned class labels, extracted once per run.
#[derive(Debug, Clone)]
pub struct TrainDataset {
    pub classes: Vec<String>,
    pub x: Vec<Vec<f32>>,
    pub y: Vec<usize>,
}

impl TrainDataset {
    /// Extract feature vectors from a labeled corpus. Labels outside the
    /// taxonomy are rejected rather than silently dropped.
    pub fn from_corpus(corpus: &[LabeledImage], taxonomy: &Taxonomy) -> Result<Self, TrainError> {
        let mut x = Vec::with_capacity(corpus.len());
        let mut y = Vec::with_capacity(corpus.len());
        for labeled in corpus {
            if labeled.class_index >= taxonomy.len() {
                return Err(TrainError::Failed(format!(
                    "Record {} labels class {} outside the {}-class taxonomy",
                    labeled.record_id,
                    labeled.class_index,
                    taxonomy.len()
                )));
            }
            x.push(feature_vector(&labeled.image));
            y.push(labeled.class_index);
        }
        Ok(Self {
            classes: taxonomy.classes().to_vec(),
            x,
            y,
        })
    }

    pub fn len(&self) -> usize {
        self.x.len()
    }

    pub fn is_empty(&self) -> bool {
        self.x.is_empty()
    }
}

/// Fits ensemble members from a dataset. The bundled implementation
/// trains stump-GBDTs; deployments with a different model family swap in
/// their own.
pub trait Trainer: Send + Sync {
    fn train(
        &self,
        dataset: &TrainDataset,
        options: &TrainOptions,
        cancel: &AtomicBool,
    ) -> Result<Vec<StumpModel>, TrainError>;
}

/// Default trainer producing bootstrap-diversified stump-GBDT members.
pub struct StumpTrainer;

impl Trainer for StumpTrainer {
    fn train(
        &self,
        dataset: &TrainDataset,
        options: &TrainOptions,
        cancel: &AtomicBool,
    ) -> Result<Vec<StumpModel>, TrainError> {
        if options.members == 0 {
            return Err(TrainError::Failed("Ensemble needs at least 1 member".to_string()));
        }
        let mut models = Vec::with_capacity(options.members);
        for member in 0..options.members {
            let resampled = bootstrap_resample(dataset, options.seed + member as u64);
            let model = train_stump_gbdt(&resampled, options, cancel)?;
            models.push(model);
        }
        Ok(models)
    }
}

/// Sample `n` rows with replacement; every member sees a different view
/// of the same corpus.
fn bootstrap_resample(dataset: &TrainDataset, seed: u64) -> TrainDataset {
    let n = dataset.len();
    let mut rng = StdRng::seed_from_u64(seed);
    let mut x = Vec::with_capacity(n);
    let mut y = Vec::with_capacity(n);
    for _ in 0..n {
        let idx = rng.random_range(0..n);
        x.push(dataset.x[idx].clone());
        y.push(dataset.y[idx]);
    }
    TrainDataset {
        classes: dataset.classes.clone(),
        x,
        y,
    }
}

/// Train one multi-class stump-GBDT with softmax gradient boosting.
pub fn train_stump_gbdt(
    dataset: &TrainDataset,
    options: &TrainOptions,
    cancel: &AtomicBool,
) -> Result<StumpModel, TrainError> {
    if dataset.x.len() != dataset.y.len() {
        return Err(TrainError::Failed("Mismatched X/Y lengths".to_string()));
    }
    if dataset.x.is_empty() {
        return Err(TrainError::Failed("Empty dataset".to_string()));
    }
    let n_classes = dataset.classes.len();
    if n_classes < 2 {
        return Err(TrainError::Failed("Need at least 2 classes".to_string()));
    }

    let n = dataset.x.len();
    let (mins, maxs) = compute_feature_min_max(&dataset.x, FEATURE_LEN);
    let binned = bin_features(&dataset.x, &mins, &maxs, SPLIT_BINS);

    let priors = class_priors(&dataset.y, n_classes);
    let init_raw: Vec<f32> = priors.iter().map(|&p| p.max(1e-6).ln()).collect();
    let mut raw = vec![init_raw.clone(); n];

    let mut rounds_out: Vec<Vec<StumpSplit>> = Vec::with_capacity(options.rounds);
    for _round in 0..options.rounds {
        if cancel.load(Ordering::Relaxed) {
            return Err(TrainError::Cancelled);
        }
        let probs: Vec<Vec<f32>> = raw.iter().map(|r| softmax(r)).collect();
        let residuals = compute_residuals(&dataset.y, &probs, n_classes);

        let mut stumps_for_round = Vec::with_capacity(n_classes);
        for class_idx in 0..n_classes {
            let stump = fit_best_stump_for_class(
                &binned,
                &dataset.x,
                &mins,
                &maxs,
                SPLIT_BINS,
                &residuals[class_idx],
            );
            for i in 0..n {
                raw[i][class_idx] += options.learning_rate * stump.predict(&dataset.x[i]);
            }
            stumps_for_round.push(stump);
        }
        rounds_out.push(stumps_for_round);
    }

    Ok(StumpModel {
        model_version: 1,
        feat_version: FEAT_VERSION,
        feature_len: FEATURE_LEN,
        classes: dataset.classes.clone(),
        learning_rate: options.learning_rate,
        init_raw,
        rounds: rounds_out,
    })
}

fn class_priors(y: &[usize], n_classes: usize) -> Vec<f32> {
    let mut counts = vec![0usize; n_classes];
    for &label in y {
        if label < n_classes {
            counts[label] += 1;
        }
    }
    let total = y.len().max(1) as f32;
    counts.into_iter().map(|c| c as f32 / total).collect()
}

fn compute_residuals(y: &[usize], probs: &[Vec<f32>], n_classes: usize) -> Vec<Vec<f32>> {
    let n = y.len();
    let mut residuals = vec![vec![0.0f32; n]; n_classes];
    for i in 0..n {
        let yi = y[i];
        for k in 0..n_classes {
            let target = if yi == k { 1.0 } else { 0.0 };
            residuals[k][i] = target - probs[i][k];
        }
    }
    residuals
}

fn compute_feature_min_max(x: &[Vec<f32>], feature_len: usize) -> (Vec<f32>, Vec<f32>) {
    let mut mins = vec![f32::INFINITY; feature_len];
    let mut maxs = vec![f32::NEG_INFINITY; feature_len];
    for row in x {
        for (j, &v) in row.iter().take(feature_len).enumerate() {
            if v.is_finite() {
                mins[j] = mins[j].min(v);
                maxs[j] = maxs[j].max(v);
            }
        }
    }
    for j in 0..feature_len {
        if !mins[j].is_finite() || !maxs[j].is_finite() {
            mins[j] = 0.0;
            maxs[j] = 0.0;
        }
        // Constant features still need a nonzero bin range.
        if mins[j] == maxs[j] {
            maxs[j] = mins[j] + 1.0;
        }
    }
    (mins, maxs)
}

fn bin_features(x: &[Vec<f32>], mins: &[f32], maxs: &[f32], bins: usize) -> Vec<Vec<u8>> {
    let bins = bins.clamp(2, 256) as f32;
    let mut out: Vec<Vec<u8>> = Vec::with_capacity(x.len());
    for row in x {
        let mut binned = Vec::with_capacity(mins.len());
        for (j, &min) in mins.iter().enumerate() {
            let max = maxs[j];
            let v = row.get(j).copied().unwrap_or(0.0);
            let t = if max > min {
                ((v - min) / (max - min)).clamp(0.0, 1.0)
            } else {
                0.0
            };
            let b = (t * (bins - 1.0)).round() as u8;
            binned.push(b);
        }
        out.push(binned);
    }
    out
}

fn fit_best_stump_for_class(
    binned: &[Vec<u8>],
    x: &[Vec<f32>],
    mins: &[f32],
    maxs: &[f32],
    bins: usize,
    residuals: &[f32],
) -> StumpSplit {
    let n_features = mins.len();
    let bins = bins.clamp(2, 256);

    let mut best = BestSplit::default();
    for feature_idx in 0..n_features {
        let split = best_split_for_feature(binned, residuals, feature_idx, bins);
        if split.score < best.score {
            best = split;
        }
    }

    let feature_idx = best.feature_index;
    let threshold = threshold_for_bin(mins[feature_idx], maxs[feature_idx], best.split_bin, bins);
    let (left_value, right_value) = leaf_means_for_threshold(x, residuals, feature_idx, threshold);
    StumpSplit {
        feature_index: feature_idx as u16,
        threshold,
        left_value,
        right_value,
    }
}

#[derive(Debug, Clone)]
struct BestSplit {
    score: f64,
    feature_index: usize,
    split_bin: usize,
}

impl Default for BestSplit {
    fn default() -> Self {
        Self {
            score: f64::INFINITY,
            feature_index: 0,
            split_bin: 0,
        }
    }
}

fn best_split_for_feature(
    binned: &[Vec<u8>],
    residuals: &[f32],
    feature_idx: usize,
    bins: usize,
) -> BestSplit {
    let mut counts = vec![0u32; bins];
    let mut sums = vec![0f64; bins];
    let mut sums_sq = vec![0f64; bins];
    for (i, row) in binned.iter().enumerate() {
        let b = row.get(feature_idx).copied().unwrap_or(0) as usize;
        let r = residuals[i] as f64;
        counts[b] += 1;
        sums[b] += r;
        sums_sq[b] += r * r;
    }
    let total_count: u32 = counts.iter().sum();
    if total_count == 0 {
        return BestSplit::default();
    }
    let total_sum: f64 = sums.iter().sum();
    let total_sum_sq: f64 = sums_sq.iter().sum();

    let mut best_score = f64::INFINITY;
    let mut best_bin = 0usize;

    let mut left_count = 0u32;
    let mut left_sum = 0f64;
    let mut left_sum_sq = 0f64;

    for split_bin in 0..(bins - 1) {
        left_count += counts[split_bin];
        left_sum += sums[split_bin];
        left_sum_sq += sums_sq[split_bin];
        let right_count = total_count - left_count;
        if left_count == 0 || right_count == 0 {
            continue;
        }
        let right_sum = total_sum - left_sum;
        let right_sum_sq = total_sum_sq - left_sum_sq;
        let left_sse = left_sum_sq - (left_sum * left_sum) / left_count as f64;
        let right_sse = right_sum_sq - (right_sum * right_sum) / right_count as f64;
        let score = left_sse + right_sse;
        if score < best_score {
            best_score = score;
            best_bin = split_bin;
        }
    }

    BestSplit {
        score: best_score,
        feature_index: feature_idx,
        split_bin: best_bin,
    }
}

fn threshold_for_bin(min: f32, max: f32, split_bin: usize, bins: usize) -> f32 {
    let t = ((split_bin + 1) as f32) / bins as f32;
    min + t * (max - min)
}

fn leaf_means_for_threshold(
    x: &[Vec<f32>],
    residuals: &[f32],
    feature_idx: usize,
    threshold: f32,
) -> (f32, f32) {
    let mut left_sum = 0.0f32;
    let mut left_count = 0u32;
    let mut right_sum = 0.0f32;
    let mut right_count = 0u32;
    for (i, row) in x.iter().enumerate() {
        let v = row.get(feature_idx).copied().unwrap_or(0.0);
        if v <= threshold {
            left_sum += residuals[i];
            left_count += 1;
        } else {
            right_sum += residuals[i];
            right_count += 1;
        }
    }
    let left_mean = if left_count == 0 {
        0.0
    } else {
        left_sum / left_count as f32
    };
    let right_mean = if right_count == 0 {
        0.0
    } else {
        right_sum / right_count as f32
    };
    (left_mean, right_mean)
}
