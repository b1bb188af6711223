//! Continuous retraining from accumulated feedback.
//!
//! The scheduler wakes on an interval and runs one retrain cycle: once
//! enough feedback has accumulated since the last training batch it
//! snapshots the corpus, fits a fresh ensemble plus calibrator, scores
//! the candidate on a frozen validation split and either promotes it
//! through the registry gate or rejects it with an alert. The cycle is
//! a plain function (`run_once`) so tests drive it without any threads.

pub mod trainer;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::alert::{AlertSender, CoreAlert, emit};
use crate::calibrate::IsotonicCalibrator;
use crate::config::RetrainConfig;
use crate::inference::stump::{StumpClassifier, StumpModel, argmax};
use crate::inference::{EnsembleMember, EnsemblePredictor};
use crate::inference::augment::TtaOptions;
use crate::metrics::{ConfusionMatrix, ValidationReport};
use crate::registry::{
    MemberDoc, ModelRegistry, RegistryError, WeightSetDoc, promotion_gate,
};
use crate::review::feedback::{FeedbackStore, LabeledImage};
use crate::store::{StoreError, now_epoch_seconds};
use crate::taxonomy::Taxonomy;
use trainer::{TrainDataset, TrainError, TrainOptions, Trainer};

/// Fraction of the snapshot held out as the frozen validation split.
const VALIDATION_FRACTION: usize = 5;

#[derive(Debug, Error)]
pub enum RetrainError {
    #[error(transparent)]
    Train(#[from] TrainError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("Snapshot of {0} records is too small to hold out a validation split")]
    SnapshotTooSmall(usize),
}

/// Result of one scheduler cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetrainOutcome {
    /// Not enough new feedback since the last batch.
    BelowThreshold { pending: u64, threshold: u64 },
    /// Candidate cleared the gate and is now active.
    Promoted(Uuid),
    /// Candidate fell short of the margin; recorded and rejected.
    Rejected(Uuid),
    /// Shutdown was requested mid-training.
    Cancelled,
}

/// Everything one retrain cycle needs. Owned by the scheduler thread,
/// but directly usable from tests.
pub struct RetrainJob {
    pub feedback: Arc<FeedbackStore>,
    pub registry: Arc<ModelRegistry>,
    pub trainer: Box<dyn Trainer>,
    pub taxonomy: Taxonomy,
    pub config: RetrainConfig,
    pub ensemble_members: usize,
    pub alerts: Option<AlertSender>,
}

impl RetrainJob {
    /// Run one retrain cycle against the current feedback high-water mark.
    pub fn run_once(&self, now: i64, cancel: &AtomicBool) -> Result<RetrainOutcome, RetrainError> {
        let since = self.registry.last_batch_record_id()?;
        let pending = self.feedback.count_since(since)?;
        if pending < self.config.feedback_threshold {
            return Ok(RetrainOutcome::BelowThreshold {
                pending,
                threshold: self.config.feedback_threshold,
            });
        }

        // Snapshot: everything up to the current high-water mark becomes
        // this batch, immutable from here on. The batch row itself is
        // written only once training produces a candidate, so a cancelled
        // or failed run leaves the feedback trigger intact.
        let last_record_id = self.feedback.max_record_id()?;
        let corpus = self.feedback.corpus_up_to(last_record_id)?;

        let (train_split, validation_split) = split_corpus(&corpus)?;
        let dataset = TrainDataset::from_corpus(&train_split, &self.taxonomy)
            .map_err(RetrainError::Train)?;
        let options = TrainOptions {
            members: self.ensemble_members,
            rounds: self.config.rounds,
            learning_rate: self.config.learning_rate,
            seed: self.config.train_seed,
        };
        let models = match self.trainer.train(&dataset, &options, cancel) {
            Ok(models) => models,
            Err(TrainError::Cancelled) => return Ok(RetrainOutcome::Cancelled),
            Err(err) => return Err(err.into()),
        };

        let evaluation = evaluate_candidate(&models, &validation_split, &self.taxonomy)?;
        let batch_id = self
            .registry
            .record_batch(corpus.len() as u64, last_record_id, now)?;
        tracing::info!(
            "Retrain batch {batch_id}: {} records up to id {last_record_id}",
            corpus.len()
        );
        let doc = WeightSetDoc {
            taxonomy_version: self.taxonomy.version(),
            members: models
                .into_iter()
                .zip(evaluation.member_accuracies.iter())
                .map(|(model, &validation_accuracy)| MemberDoc {
                    model,
                    validation_accuracy,
                })
                .collect(),
            calibration: evaluation.calibrator,
        };

        let candidate = self.registry.register_candidate(&doc, Some(batch_id), now)?;
        let metric = evaluation.report.accuracy;
        self.registry.mark_validated(candidate.id, metric)?;

        let active_metric = self.registry.snapshot().map(|r| r.version.metric);
        if promotion_gate(metric, active_metric, self.config.promotion_margin) {
            self.registry.promote(candidate.id, now_epoch_seconds())?;
            tracing::info!(
                "Candidate {} promoted: metric {metric:.4} over {active_metric:?}",
                candidate.id
            );
            Ok(RetrainOutcome::Promoted(candidate.id))
        } else {
            self.registry.reject(candidate.id)?;
            emit(
                self.alerts.as_ref(),
                CoreAlert::CandidateRejected {
                    version: candidate.id,
                    candidate_metric: metric,
                    active_metric,
                },
            );
            Ok(RetrainOutcome::Rejected(candidate.id))
        }
    }
}

/// Deterministic train/validation split: every Nth record by snapshot
/// position is held out. Record order is the append order, so the split
/// is stable across runs over the same batch.
fn split_corpus(corpus: &[LabeledImage]) -> Result<(Vec<LabeledImage>, Vec<LabeledImage>), RetrainError> {
    if corpus.len() < VALIDATION_FRACTION {
        return Err(RetrainError::SnapshotTooSmall(corpus.len()));
    }
    let mut train = Vec::with_capacity(corpus.len());
    let mut validation = Vec::with_capacity(corpus.len() / VALIDATION_FRACTION + 1);
    for (idx, record) in corpus.iter().enumerate() {
        if idx % VALIDATION_FRACTION == 0 {
            validation.push(record.clone());
        } else {
            train.push(record.clone());
        }
    }
    Ok((train, validation))
}

struct CandidateEvaluation {
    member_accuracies: Vec<f32>,
    report: ValidationReport,
    calibrator: IsotonicCalibrator,
}

/// Score each member and the full ensemble on the held-out split, and
/// fit the release calibrator from the ensemble's raw confidences.
fn evaluate_candidate(
    models: &[StumpModel],
    validation: &[LabeledImage],
    taxonomy: &Taxonomy,
) -> Result<CandidateEvaluation, RetrainError> {
    let mut member_accuracies = Vec::with_capacity(models.len());
    let mut classifiers = Vec::with_capacity(models.len());
    for model in models {
        classifiers.push(
            StumpClassifier::new(model.clone()).map_err(TrainError::Failed)?,
        );
    }

    for classifier in &classifiers {
        let mut correct = 0usize;
        for sample in validation {
            let proba = classifier
                .model()
                .predict_proba(&crate::inference::features::feature_vector(&sample.image));
            if argmax(&proba) == sample.class_index {
                correct += 1;
            }
        }
        member_accuracies.push(correct as f32 / validation.len().max(1) as f32);
    }

    // The ensemble is evaluated exactly as it will serve, minus TTA:
    // accuracy-weighted aggregation over the same members.
    let members: Vec<EnsembleMember> = classifiers
        .into_iter()
        .enumerate()
        .map(|(member_index, classifier)| EnsembleMember {
            member_index,
            weight: member_accuracies[member_index],
            classifier: Arc::new(classifier),
        })
        .collect();
    let predictor = EnsemblePredictor::new(
        TtaOptions {
            enabled: false,
            crop_variants: 0,
            brightness_jitter: 0.0,
        },
        1,
    );

    let mut cm = ConfusionMatrix::new(taxonomy.len());
    let mut calibration_pairs = Vec::with_capacity(validation.len());
    for sample in validation {
        let output = predictor
            .predict(&members, &sample.image, taxonomy)
            .map_err(|err| TrainError::Failed(err.to_string()))?;
        cm.add(sample.class_index, output.top_class);
        calibration_pairs.push((output.raw_confidence, output.top_class == sample.class_index));
    }

    Ok(CandidateEvaluation {
        member_accuracies,
        report: ValidationReport::from_confusion(&cm, taxonomy.classes()),
        calibrator: IsotonicCalibrator::fit(&calibration_pairs),
    })
}

/// Background scheduler driving [`RetrainJob::run_once`] on an interval.
pub struct RetrainScheduler {
    cancel: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl RetrainScheduler {
    /// Spawn the scheduler thread. The first cycle runs after one full
    /// interval, not immediately.
    pub fn start(job: RetrainJob) -> Self {
        let cancel = Arc::new(AtomicBool::new(false));
        let thread_cancel = Arc::clone(&cancel);
        let interval = Duration::from_secs(job.config.interval_seconds.max(1));
        let handle = match thread::Builder::new()
            .name("retrain-scheduler".to_string())
            .spawn(move || scheduler_loop(job, interval, &thread_cancel))
        {
            Ok(handle) => Some(handle),
            Err(err) => {
                tracing::error!("Failed to spawn retrain scheduler: {err}");
                None
            }
        };
        Self { cancel, handle }
    }

    /// Request cancellation and wait for the thread to exit. A cycle in
    /// progress aborts at its next round boundary.
    pub fn shutdown(mut self) {
        self.cancel.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for RetrainScheduler {
    fn drop(&mut self) {
        self.cancel.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn scheduler_loop(job: RetrainJob, interval: Duration, cancel: &AtomicBool) {
    loop {
        if sleep_cancellable(interval, cancel) {
            return;
        }
        match job.run_once(now_epoch_seconds(), cancel) {
            Ok(RetrainOutcome::Cancelled) => return,
            Ok(outcome) => tracing::debug!("Retrain cycle finished: {outcome:?}"),
            Err(err) => tracing::error!("Retrain cycle failed: {err}"),
        }
    }
}

/// Sleep in short slices so shutdown is responsive. Returns true when
/// cancellation was observed.
fn sleep_cancellable(total: Duration, cancel: &AtomicBool) -> bool {
    let slice = Duration::from_millis(100);
    let mut slept = Duration::ZERO;
    while slept < total {
        if cancel.load(Ordering::Relaxed) {
            return true;
        }
        let step = slice.min(total - slept);
        thread::sleep(step);
        slept += step;
    }
    cancel.load(Ordering::Relaxed)
}
