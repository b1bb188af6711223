//! Ensemble inference over a set of independently parameterized models.
//!
//! Each member model sees the same deterministic test-time augmentation
//! views and its per-view probability vectors are averaged. Member
//! averages are then combined with a validation-accuracy-weighted mean,
//! renormalized over whichever members actually produced output.

pub mod augment;
pub mod features;
pub mod stump;

use std::sync::Arc;

use image::RgbImage;
use thiserror::Error;

use crate::taxonomy::Taxonomy;
use augment::{TtaOptions, tta_views};

/// Error raised by a single model while producing a prediction.
#[derive(Debug, Clone, Error)]
#[error("Inference failed: {0}")]
pub struct InferenceError(pub String);

/// A pluggable classifier producing a probability vector per image.
pub trait Classifier: Send + Sync {
    /// Number of classes in the output vector.
    fn n_classes(&self) -> usize;
    /// Probability vector over the taxonomy for one image view.
    fn predict(&self, image: &RgbImage) -> Result<Vec<f32>, InferenceError>;
}

/// One loaded member of the serving ensemble.
#[derive(Clone)]
pub struct EnsembleMember {
    /// Position within the release weight set.
    pub member_index: usize,
    /// Held-out validation accuracy recorded at training time; used as
    /// the member's aggregation weight.
    pub weight: f32,
    pub classifier: Arc<dyn Classifier>,
}

impl std::fmt::Debug for EnsembleMember {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnsembleMember")
            .field("member_index", &self.member_index)
            .field("weight", &self.weight)
            .finish()
    }
}

/// Errors surfacing from ensemble aggregation.
#[derive(Debug, Error)]
pub enum EnsembleError {
    /// Every member failed to load or infer; the caller should fall back
    /// to the last-known-good weight set.
    #[error("All {0} ensemble members failed")]
    AllMembersFailed(usize),
    /// A member produced a vector whose length does not match the taxonomy.
    #[error("Member {member} produced {got} probabilities, taxonomy has {expected}")]
    ClassCountMismatch {
        member: usize,
        got: usize,
        expected: usize,
    },
    #[error("Ensemble has no members")]
    Empty,
}

/// Per-member diagnostic attached to every prediction.
#[derive(Debug, Clone)]
pub struct MemberDiagnostic {
    pub member_index: usize,
    pub weight: f32,
    /// Top class and its probability, if the member produced output.
    pub top: Option<(usize, f32)>,
    pub failed: bool,
}

/// Alternative label reported alongside the primary prediction.
#[derive(Debug, Clone)]
pub struct Alternative {
    pub class_index: usize,
    pub probability: f32,
    /// Probability gap to the primary prediction.
    pub margin: f32,
}

/// Aggregated prediction for one image.
#[derive(Debug, Clone)]
pub struct EnsembleOutput {
    /// Weighted-mean probability vector; sums to 1.
    pub probabilities: Vec<f32>,
    /// Winning taxonomy index after tie-breaking.
    pub top_class: usize,
    /// Probability of the winning class (the raw confidence).
    pub raw_confidence: f32,
    pub alternatives: Vec<Alternative>,
    /// Cross-member variance of the winning class probability.
    pub top_class_variance: f32,
    pub surviving_members: usize,
    pub failed_members: usize,
    pub diagnostics: Vec<MemberDiagnostic>,
}

impl EnsembleOutput {
    /// Whether some members were excluded and weights renormalized.
    pub fn degraded(&self) -> bool {
        self.failed_members > 0
    }
}

/// Two probabilities closer than this are treated as tied.
const TIE_EPSILON: f32 = 1e-6;
/// Floor applied to member weights so a zero-accuracy member cannot
/// silence the whole ensemble in degraded mode.
const MIN_MEMBER_WEIGHT: f32 = 1e-3;

/// Test-time-augmented, accuracy-weighted ensemble aggregation.
#[derive(Debug, Clone)]
pub struct EnsemblePredictor {
    tta: TtaOptions,
    top_k: usize,
}

impl EnsemblePredictor {
    pub fn new(tta: TtaOptions, top_k: usize) -> Self {
        Self {
            tta,
            top_k: top_k.max(1),
        }
    }

    /// Run every member over the TTA views and aggregate.
    pub fn predict(
        &self,
        members: &[EnsembleMember],
        image: &RgbImage,
        taxonomy: &Taxonomy,
    ) -> Result<EnsembleOutput, EnsembleError> {
        if members.is_empty() {
            return Err(EnsembleError::Empty);
        }
        let n_classes = taxonomy.len();
        let views = tta_views(image, &self.tta);

        let mut member_means: Vec<(usize, f32, Vec<f32>)> = Vec::with_capacity(members.len());
        let mut diagnostics = Vec::with_capacity(members.len());
        let mut failed = 0usize;
        for member in members {
            match member_mean(member, &views, n_classes)? {
                Some(mean) => {
                    let top = stump::argmax(&mean);
                    diagnostics.push(MemberDiagnostic {
                        member_index: member.member_index,
                        weight: member.weight,
                        top: Some((top, mean[top])),
                        failed: false,
                    });
                    member_means.push((member.member_index, member.weight, mean));
                }
                None => {
                    failed += 1;
                    diagnostics.push(MemberDiagnostic {
                        member_index: member.member_index,
                        weight: member.weight,
                        top: None,
                        failed: true,
                    });
                }
            }
        }
        if member_means.is_empty() {
            return Err(EnsembleError::AllMembersFailed(members.len()));
        }
        if failed > 0 {
            tracing::warn!(
                "Degraded inference: {failed}/{} ensemble members excluded",
                members.len()
            );
        }

        let weight_sum: f32 = member_means
            .iter()
            .map(|(_, w, _)| w.max(MIN_MEMBER_WEIGHT))
            .sum();
        let mut probabilities = vec![0.0f32; n_classes];
        for (_, weight, mean) in &member_means {
            let w = weight.max(MIN_MEMBER_WEIGHT) / weight_sum;
            for (slot, &p) in probabilities.iter_mut().zip(mean.iter()) {
                *slot += w * p;
            }
        }
        // Guard against float drift so downstream invariants hold exactly.
        let total: f32 = probabilities.iter().sum();
        if total > 0.0 {
            for p in &mut probabilities {
                *p /= total;
            }
        }

        let top_class = pick_top_class(&probabilities, &member_means);
        let raw_confidence = probabilities[top_class];
        let top_class_variance = class_variance(&member_means, top_class);
        let alternatives = rank_alternatives(&probabilities, top_class, self.top_k);

        Ok(EnsembleOutput {
            probabilities,
            top_class,
            raw_confidence,
            alternatives,
            top_class_variance,
            surviving_members: member_means.len(),
            failed_members: failed,
            diagnostics,
        })
    }
}

/// Average a member's probability vectors over all views. Returns `None`
/// when the member fails on any view.
fn member_mean(
    member: &EnsembleMember,
    views: &[RgbImage],
    n_classes: usize,
) -> Result<Option<Vec<f32>>, EnsembleError> {
    let declared = member.classifier.n_classes();
    if declared != n_classes {
        return Err(EnsembleError::ClassCountMismatch {
            member: member.member_index,
            got: declared,
            expected: n_classes,
        });
    }
    let mut sum = vec![0.0f32; n_classes];
    for view in views {
        let proba = match member.classifier.predict(view) {
            Ok(proba) => proba,
            Err(err) => {
                tracing::warn!(
                    "Ensemble member {} failed to infer: {err}",
                    member.member_index
                );
                return Ok(None);
            }
        };
        if proba.len() != n_classes {
            return Err(EnsembleError::ClassCountMismatch {
                member: member.member_index,
                got: proba.len(),
                expected: n_classes,
            });
        }
        for (slot, p) in sum.iter_mut().zip(proba) {
            *slot += p;
        }
    }
    let n_views = views.len().max(1) as f32;
    for slot in &mut sum {
        *slot /= n_views;
    }
    Ok(Some(sum))
}

/// Pick the winning class: highest aggregate probability; ties go to the
/// class the members agree on most (smallest cross-member variance), then
/// to the lowest taxonomy index.
fn pick_top_class(probabilities: &[f32], member_means: &[(usize, f32, Vec<f32>)]) -> usize {
    let max = probabilities
        .iter()
        .copied()
        .fold(f32::NEG_INFINITY, f32::max);
    let tied: Vec<usize> = probabilities
        .iter()
        .enumerate()
        .filter(|&(_, &p)| max - p <= TIE_EPSILON)
        .map(|(idx, _)| idx)
        .collect();
    if tied.len() == 1 {
        return tied[0];
    }
    let mut best = tied[0];
    let mut best_variance = class_variance(member_means, best);
    for &candidate in &tied[1..] {
        let variance = class_variance(member_means, candidate);
        if variance + f32::EPSILON < best_variance {
            best = candidate;
            best_variance = variance;
        }
    }
    best
}

/// Variance of one class's probability across surviving members.
fn class_variance(member_means: &[(usize, f32, Vec<f32>)], class_index: usize) -> f32 {
    if member_means.len() < 2 {
        return 0.0;
    }
    let n = member_means.len() as f32;
    let mean: f32 = member_means
        .iter()
        .map(|(_, _, p)| p[class_index])
        .sum::<f32>()
        / n;
    member_means
        .iter()
        .map(|(_, _, p)| {
            let d = p[class_index] - mean;
            d * d
        })
        .sum::<f32>()
        / n
}

/// Ranked alternatives below the winning class, with margins.
fn rank_alternatives(probabilities: &[f32], top_class: usize, top_k: usize) -> Vec<Alternative> {
    let mut ranked: Vec<usize> = (0..probabilities.len())
        .filter(|&idx| idx != top_class)
        .collect();
    ranked.sort_by(|&a, &b| {
        probabilities[b]
            .partial_cmp(&probabilities[a])
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.cmp(&b))
    });
    ranked
        .into_iter()
        .take(top_k)
        .map(|class_index| Alternative {
            class_index,
            probability: probabilities[class_index],
            margin: probabilities[top_class] - probabilities[class_index],
        })
        .collect()
}
