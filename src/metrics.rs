//! Evaluation metrics for candidate model validation.

use serde::{Deserialize, Serialize};

/// Confusion matrix for a `K`-class classifier.
#[derive(Debug, Clone)]
pub struct ConfusionMatrix {
    /// Number of classes.
    pub n_classes: usize,
    /// Row-major `KxK` counts (`truth * K + predicted`).
    pub counts: Vec<u32>,
}

impl ConfusionMatrix {
    /// Create an empty `KxK` confusion matrix.
    pub fn new(n_classes: usize) -> Self {
        Self {
            n_classes,
            counts: vec![0; n_classes * n_classes],
        }
    }

    pub fn add(&mut self, truth: usize, predicted: usize) {
        if truth >= self.n_classes || predicted >= self.n_classes {
            return;
        }
        let idx = truth * self.n_classes + predicted;
        self.counts[idx] = self.counts[idx].saturating_add(1);
    }

    pub fn get(&self, truth: usize, predicted: usize) -> u32 {
        self.counts[truth * self.n_classes + predicted]
    }

    /// Overall accuracy.
    pub fn accuracy(&self) -> f32 {
        let mut correct = 0u64;
        let mut total = 0u64;
        for truth in 0..self.n_classes {
            for predicted in 0..self.n_classes {
                let v = self.get(truth, predicted) as u64;
                total += v;
                if truth == predicted {
                    correct += v;
                }
            }
        }
        if total == 0 {
            0.0
        } else {
            (correct as f32) / (total as f32)
        }
    }
}

/// Precision/recall statistics for a single class.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerClassStats {
    pub class_id: String,
    /// `TP / (TP + FP)`.
    pub precision: f32,
    /// `TP / (TP + FN)`.
    pub recall: f32,
    /// Total number of true examples for the class.
    pub support: u32,
}

/// Validation summary recorded on a model version and used by the
/// promotion gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    /// Overall accuracy on the frozen validation split.
    pub accuracy: f32,
    /// Examples evaluated.
    pub sample_count: u32,
    pub per_class: Vec<PerClassStats>,
}

impl ValidationReport {
    /// Summarize a confusion matrix against an ordered class list.
    pub fn from_confusion(cm: &ConfusionMatrix, classes: &[String]) -> Self {
        let k = cm.n_classes;
        let mut per_class = Vec::with_capacity(k);
        let mut total = 0u32;
        for class_idx in 0..k {
            let tp = cm.get(class_idx, class_idx) as f32;
            let mut fp = 0f32;
            let mut fn_ = 0f32;
            let mut support = 0u32;
            for j in 0..k {
                let v = cm.get(class_idx, j);
                support = support.saturating_add(v);
                if j != class_idx {
                    fn_ += v as f32;
                }
            }
            for i in 0..k {
                if i != class_idx {
                    fp += cm.get(i, class_idx) as f32;
                }
            }
            total = total.saturating_add(support);
            let precision = if tp + fp == 0.0 { 0.0 } else { tp / (tp + fp) };
            let recall = if tp + fn_ == 0.0 { 0.0 } else { tp / (tp + fn_) };
            per_class.push(PerClassStats {
                class_id: classes
                    .get(class_idx)
                    .cloned()
                    .unwrap_or_else(|| class_idx.to_string()),
                precision,
                recall,
                support,
            });
        }
        Self {
            accuracy: cm.accuracy(),
            sample_count: total,
            per_class,
        }
    }
}
