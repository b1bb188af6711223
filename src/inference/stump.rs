//! Bundled reference classifier: gradient-boosted decision stumps over
//! image feature vectors.
//!
//! This is the default `Classifier` implementation shipped with the core.
//! Real deployments may substitute any model behind the trait; the
//! pipeline only ever sees probability vectors.

use serde::{Deserialize, Serialize};
use std::path::Path;

use image::RgbImage;

use super::features::{FEAT_VERSION, FEATURE_LEN, feature_vector};
use super::{Classifier, InferenceError};

/// Single-node decision tree used as a weak learner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StumpSplit {
    /// Feature index used for the split.
    pub feature_index: u16,
    /// Threshold in feature units.
    pub threshold: f32,
    /// Prediction for `feature <= threshold`.
    pub left_value: f32,
    /// Prediction for `feature > threshold`.
    pub right_value: f32,
}

impl StumpSplit {
    /// Predict the stump value for a feature vector.
    pub fn predict(&self, features: &[f32]) -> f32 {
        let idx = self.feature_index as usize;
        let value = features.get(idx).copied().unwrap_or(0.0);
        if value <= self.threshold {
            self.left_value
        } else {
            self.right_value
        }
    }
}

/// Gradient-boosted decision stump model for multi-class classification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StumpModel {
    /// Model format version.
    pub model_version: i64,
    /// Feature layout version expected by this model.
    pub feat_version: i64,
    /// Number of `f32` values per feature vector.
    pub feature_len: usize,
    /// Ordered list of class identifiers.
    pub classes: Vec<String>,
    /// Learning rate applied to each stump prediction.
    pub learning_rate: f32,
    /// Initial raw logits before boosting rounds.
    pub init_raw: Vec<f32>,
    /// Shape: `[n_rounds][n_classes]`.
    pub rounds: Vec<Vec<StumpSplit>>,
}

impl StumpModel {
    /// Validate structural invariants of the model.
    pub fn validate(&self) -> Result<(), String> {
        if self.classes.len() < 2 {
            return Err("Model must contain at least 2 classes".to_string());
        }
        if self.feat_version != FEAT_VERSION {
            return Err(format!(
                "Model expects feature version {}, runtime provides {FEAT_VERSION}",
                self.feat_version
            ));
        }
        if self.feature_len != FEATURE_LEN {
            return Err(format!(
                "Model expects {} features, runtime provides {FEATURE_LEN}",
                self.feature_len
            ));
        }
        if self.init_raw.len() != self.classes.len() {
            return Err("init_raw length must match classes length".to_string());
        }
        for (round_idx, round) in self.rounds.iter().enumerate() {
            if round.len() != self.classes.len() {
                return Err(format!(
                    "Round {round_idx} has {} stumps but expected {}",
                    round.len(),
                    self.classes.len()
                ));
            }
        }
        Ok(())
    }

    /// Load a model from a JSON file.
    pub fn load_json(path: &Path) -> Result<Self, String> {
        let bytes = std::fs::read(path).map_err(|err| err.to_string())?;
        Self::from_json_slice(&bytes)
    }

    /// Parse and validate a model from a JSON document.
    pub fn from_json_slice(bytes: &[u8]) -> Result<Self, String> {
        let model: Self = serde_json::from_slice(bytes).map_err(|err| err.to_string())?;
        model.validate()?;
        Ok(model)
    }

    /// Predict raw logits for a feature vector.
    pub fn predict_raw(&self, features: &[f32]) -> Vec<f32> {
        let mut raw = self.init_raw.clone();
        for round in &self.rounds {
            for (class_idx, stump) in round.iter().enumerate() {
                raw[class_idx] += self.learning_rate * stump.predict(features);
            }
        }
        raw
    }

    /// Predict class probabilities for a feature vector.
    pub fn predict_proba(&self, features: &[f32]) -> Vec<f32> {
        softmax(&self.predict_raw(features))
    }
}

/// `Classifier` adapter running a stump model on extracted features.
#[derive(Debug, Clone)]
pub struct StumpClassifier {
    model: StumpModel,
}

impl StumpClassifier {
    pub fn new(model: StumpModel) -> Result<Self, String> {
        model.validate()?;
        Ok(Self { model })
    }

    pub fn model(&self) -> &StumpModel {
        &self.model
    }
}

impl Classifier for StumpClassifier {
    fn n_classes(&self) -> usize {
        self.model.classes.len()
    }

    fn predict(&self, image: &RgbImage) -> Result<Vec<f32>, InferenceError> {
        let features = feature_vector(image);
        Ok(self.model.predict_proba(&features))
    }
}

/// Compute a numerically-stable softmax for a set of logits.
pub fn softmax(raw: &[f32]) -> Vec<f32> {
    if raw.is_empty() {
        return Vec::new();
    }
    let max = raw
        .iter()
        .copied()
        .fold(f32::NEG_INFINITY, |a, b| a.max(b));
    let mut exps = Vec::with_capacity(raw.len());
    let mut sum = 0.0f32;
    for &v in raw {
        let e = (v - max).exp();
        exps.push(e);
        sum += e;
    }
    // Also catches the all-`-inf` case, where `v - max` is NaN and the
    // sum poisons. Uniform output is the only sensible answer there.
    if !(sum > 0.0) || !sum.is_finite() {
        return vec![1.0 / raw.len() as f32; raw.len()];
    }
    for v in &mut exps {
        *v /= sum;
    }
    exps
}

/// Index of the largest value; ties resolve to the lowest index.
pub fn argmax(values: &[f32]) -> usize {
    let mut best = 0;
    for (idx, &value) in values.iter().enumerate() {
        if value > values[best] {
            best = idx;
        }
    }
    best
}
