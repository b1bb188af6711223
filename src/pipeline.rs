//! End-to-end diagnosis pipeline.
//!
//! One call takes a field photo through the quality gate, the serving
//! ensemble, the release calibrator and the routing decision. Every
//! submission ends in exactly one of three places: rejected with
//! actionable quality defects, returned as a confident diagnosis, or
//! parked as a single review case for an expert.

use std::sync::Arc;

use image::RgbImage;
use thiserror::Error;
use uuid::Uuid;

use crate::alert::{AlertSender, CoreAlert, emit};
use crate::calibrate::{Decision, IsotonicCalibrator};
use crate::config::PipelineConfig;
use crate::inference::augment::TtaOptions;
use crate::inference::{EnsembleError, EnsembleOutput, EnsemblePredictor};
use crate::quality::{QualityGate, QualityReport};
use crate::registry::{LoadedRelease, ModelRegistry};
use crate::review::feedback::FeedbackStore;
use crate::review::{CasePrediction, ReviewError, ReviewQueue};
use crate::store::{DiagnosisStore, StoreError};
use crate::taxonomy::Taxonomy;

/// A submitted field photo plus its capture context.
#[derive(Debug, Clone)]
pub struct ImageSample {
    pub image: RgbImage,
    /// Capture time, epoch seconds.
    pub captured_at: i64,
    /// Opaque submitter identity, retained for review triage.
    pub submitter: String,
}

/// A completed diagnosis returned to the submitter.
#[derive(Debug, Clone)]
pub struct DiagnosisRecord {
    /// Weight set that produced the prediction.
    pub model_version: Uuid,
    pub predicted_class: usize,
    pub predicted_label: String,
    pub raw_confidence: f32,
    pub calibrated_confidence: f32,
    /// Runner-up labels with their calibrated-input probabilities.
    pub alternatives: Vec<(String, f32)>,
    pub quality_score: f32,
    /// Set when the diagnosis was routed to an expert instead of being
    /// returned as final.
    pub review_case_id: Option<Uuid>,
    /// Whether ensemble members were excluded from this prediction.
    pub degraded: bool,
}

/// Terminal state of one submission.
#[derive(Debug, Clone)]
pub enum DiagnosisOutcome {
    /// The photo failed the quality gate; the report carries retake
    /// recommendations. Nothing was persisted.
    Rejected(QualityReport),
    /// The photo was diagnosed. `review_case_id` tells whether it was
    /// auto-accepted or routed to review.
    Diagnosed(DiagnosisRecord),
}

#[derive(Debug, Error)]
pub enum PipelineError {
    /// No weight set is active and no fallback is available.
    #[error("No model release is available to serve predictions")]
    ServiceUnavailable,
    #[error("Inference failed: {0}")]
    Ensemble(#[from] EnsembleError),
    #[error(transparent)]
    Review(#[from] ReviewError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// The serving pipeline. Cheap to share behind an `Arc`; all state lives
/// in the store and the registry.
pub struct DiagnosisPipeline {
    taxonomy: Taxonomy,
    quality: QualityGate,
    predictor: EnsemblePredictor,
    registry: Arc<ModelRegistry>,
    queue: ReviewQueue,
    feedback: Arc<FeedbackStore>,
    auto_accept_threshold: f32,
    alerts: Option<AlertSender>,
}

impl DiagnosisPipeline {
    pub fn new(
        config: &PipelineConfig,
        taxonomy: Taxonomy,
        store: Arc<DiagnosisStore>,
        registry: Arc<ModelRegistry>,
        feedback: Arc<FeedbackStore>,
        alerts: Option<AlertSender>,
    ) -> Self {
        let tta = TtaOptions {
            enabled: config.ensemble.use_tta,
            crop_variants: config.ensemble.crop_variants,
            brightness_jitter: config.ensemble.brightness_jitter,
        };
        Self {
            taxonomy,
            quality: QualityGate::new(config.quality.clone()),
            predictor: EnsemblePredictor::new(tta, config.ensemble.top_k),
            registry,
            queue: ReviewQueue::new(Arc::clone(&store)),
            feedback,
            auto_accept_threshold: config.calibration.auto_accept_threshold,
            alerts,
        }
    }

    /// Access to the review queue backing this pipeline.
    pub fn review_queue(&self) -> &ReviewQueue {
        &self.queue
    }

    /// Diagnose one submitted photo.
    pub fn diagnose(
        &self,
        sample: &ImageSample,
        now: i64,
    ) -> Result<DiagnosisOutcome, PipelineError> {
        let report = self.quality.assess(&sample.image);
        if !report.pass {
            tracing::debug!(
                "Submission rejected at quality {:.1}: {:?}",
                report.score,
                report.defects
            );
            return Ok(DiagnosisOutcome::Rejected(report));
        }

        let (release, output) = self.predict(&sample.image)?;
        if output.degraded() {
            emit(
                self.alerts.as_ref(),
                CoreAlert::InferenceDegraded {
                    surviving_members: output.surviving_members,
                    failed_members: output.failed_members,
                },
            );
        }

        let calibrated = self.calibrate(&release.calibrator, output.raw_confidence);
        let record = self.route(sample, &release, &output, calibrated, report.score, now)?;
        Ok(DiagnosisOutcome::Diagnosed(record))
    }

    /// Run the active release; on total member failure fall back to the
    /// previous release once.
    fn predict(
        &self,
        image: &RgbImage,
    ) -> Result<(Arc<LoadedRelease>, EnsembleOutput), PipelineError> {
        let active = self
            .registry
            .snapshot()
            .ok_or(PipelineError::ServiceUnavailable)?;
        match self.predictor.predict(&active.members, image, &self.taxonomy) {
            Ok(output) => Ok((active, output)),
            Err(EnsembleError::AllMembersFailed(count)) => {
                tracing::error!(
                    "All {count} members of release {} failed; trying fallback",
                    active.version.id
                );
                let fallback = self
                    .registry
                    .last_known_good()
                    .ok_or(PipelineError::ServiceUnavailable)?;
                let output = self
                    .predictor
                    .predict(&fallback.members, image, &self.taxonomy)?;
                emit(
                    self.alerts.as_ref(),
                    CoreAlert::ServingFallback {
                        version: fallback.version.id,
                    },
                );
                Ok((fallback, output))
            }
            Err(err) => Err(err.into()),
        }
    }

    fn calibrate(&self, calibrator: &IsotonicCalibrator, raw: f32) -> f32 {
        let outcome = calibrator.calibrate(raw);
        if outcome.clamped {
            emit(self.alerts.as_ref(), CoreAlert::CalibrationClamped { raw });
        }
        outcome.calibrated
    }

    /// Apply the auto-accept decision: either sample the diagnosis into
    /// the feedback corpus or create exactly one review case.
    fn route(
        &self,
        sample: &ImageSample,
        release: &LoadedRelease,
        output: &EnsembleOutput,
        calibrated: f32,
        quality_score: f32,
        now: i64,
    ) -> Result<DiagnosisRecord, PipelineError> {
        let review_case_id =
            match IsotonicCalibrator::decide(calibrated, self.auto_accept_threshold) {
                Decision::AutoAccept => {
                    self.feedback
                        .maybe_record_auto(&sample.image, output.top_class, now)?;
                    None
                }
                Decision::RouteToReview => {
                    let prediction = CasePrediction {
                        predicted_class: output.top_class,
                        probabilities: output.probabilities.clone(),
                        raw_confidence: output.raw_confidence,
                        calibrated_confidence: calibrated,
                        quality_score,
                    };
                    Some(self.queue.create_case(sample, &prediction, now)?)
                }
            };

        let label = |index: usize| {
            self.taxonomy
                .class_name(index)
                .unwrap_or("unknown")
                .to_string()
        };
        Ok(DiagnosisRecord {
            model_version: release.version.id,
            predicted_class: output.top_class,
            predicted_label: label(output.top_class),
            raw_confidence: output.raw_confidence,
            calibrated_confidence: calibrated,
            alternatives: output
                .alternatives
                .iter()
                .map(|alt| (label(alt.class_index), alt.probability))
                .collect(),
            quality_score,
            review_case_id,
            degraded: output.degraded(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibrate::IsotonicCalibrator;
    use crate::registry::{MemberDoc, StumpLoader, WeightSetDoc};
    use crate::inference::features::{FEAT_VERSION, FEATURE_LEN};
    use crate::inference::stump::{StumpModel, StumpSplit};
    use image::Rgb;

    fn taxonomy() -> Taxonomy {
        Taxonomy::new(vec![
            "tomato___healthy".to_string(),
            "tomato___early_blight".to_string(),
        ])
        .unwrap()
    }

    /// Model whose logits strongly favor one class everywhere.
    fn biased_model(class: usize, strength: f32) -> StumpModel {
        let mut init_raw = vec![0.0; 2];
        init_raw[class] = strength;
        StumpModel {
            model_version: 1,
            feat_version: FEAT_VERSION,
            feature_len: FEATURE_LEN,
            classes: vec!["tomato___healthy".to_string(), "tomato___early_blight".to_string()],
            learning_rate: 0.1,
            init_raw,
            rounds: vec![vec![
                StumpSplit {
                    feature_index: 0,
                    threshold: 0.5,
                    left_value: 0.0,
                    right_value: 0.0,
                };
                2
            ]],
        }
    }

    fn release_doc(strength: f32) -> WeightSetDoc {
        WeightSetDoc {
            taxonomy_version: 1,
            members: vec![MemberDoc {
                model: biased_model(1, strength),
                validation_accuracy: 0.9,
            }],
            calibration: IsotonicCalibrator::identity(),
        }
    }

    struct Fixture {
        pipeline: DiagnosisPipeline,
        registry: Arc<ModelRegistry>,
        feedback: Arc<FeedbackStore>,
    }

    fn fixture(doc: Option<WeightSetDoc>, sample_rate: f32) -> Fixture {
        let store = Arc::new(DiagnosisStore::open_in_memory().unwrap());
        let registry =
            Arc::new(ModelRegistry::open(Arc::clone(&store), Box::new(StumpLoader)).unwrap());
        if let Some(doc) = doc {
            let version = registry.register_candidate(&doc, None, 100).unwrap();
            registry.mark_validated(version.id, 0.9).unwrap();
            registry.promote(version.id, 110).unwrap();
        }
        let feedback = Arc::new(FeedbackStore::new(Arc::clone(&store), sample_rate, 1));
        let pipeline = DiagnosisPipeline::new(
            &PipelineConfig::default(),
            taxonomy(),
            store,
            Arc::clone(&registry),
            Arc::clone(&feedback),
            None,
        );
        Fixture {
            pipeline,
            registry,
            feedback,
        }
    }

    /// Sharp, well-exposed leaf photo that clears the quality gate.
    fn good_photo() -> ImageSample {
        let mut image = RgbImage::new(64, 64);
        for (x, y, pixel) in image.enumerate_pixels_mut() {
            let bright = (x + y) % 2 == 0;
            *pixel = if bright {
                Rgb([60, 200, 70])
            } else {
                Rgb([20, 110, 30])
            };
        }
        ImageSample {
            image,
            captured_at: 1_000,
            submitter: "farmer-7".to_string(),
        }
    }

    fn dark_photo() -> ImageSample {
        ImageSample {
            image: RgbImage::from_pixel(64, 64, Rgb([6, 8, 5])),
            captured_at: 1_000,
            submitter: "farmer-7".to_string(),
        }
    }

    #[test]
    fn quality_failure_rejects_without_touching_the_store() {
        let fixture = fixture(Some(release_doc(6.0)), 1.0);
        let outcome = fixture.pipeline.diagnose(&dark_photo(), 2_000).unwrap();
        let report = match outcome {
            DiagnosisOutcome::Rejected(report) => report,
            other => panic!("expected rejection, got {other:?}"),
        };
        assert!(!report.pass);
        assert!(!report.defects.is_empty());
        assert!(!report.recommendations().is_empty());
        assert_eq!(fixture.pipeline.review_queue().depth().unwrap(), 0);
        assert_eq!(fixture.feedback.max_record_id().unwrap(), 0);
    }

    #[test]
    fn confident_diagnosis_auto_accepts_and_samples_feedback() {
        // Strong logit bias: raw confidence well above the 0.6 threshold
        // under the identity calibrator. Sample rate 1 keeps every record.
        let fixture = fixture(Some(release_doc(6.0)), 1.0);
        let outcome = fixture.pipeline.diagnose(&good_photo(), 2_000).unwrap();
        let record = match outcome {
            DiagnosisOutcome::Diagnosed(record) => record,
            other => panic!("expected diagnosis, got {other:?}"),
        };
        assert!(record.review_case_id.is_none());
        assert_eq!(record.predicted_label, "tomato___early_blight");
        assert!(record.calibrated_confidence >= 0.6);
        assert_eq!(record.alternatives.len(), 1);
        assert_eq!(fixture.feedback.max_record_id().unwrap(), 1);
        assert_eq!(fixture.pipeline.review_queue().depth().unwrap(), 0);
    }

    #[test]
    fn uncertain_diagnosis_creates_exactly_one_review_case() {
        // Weak bias: raw confidence lands between 0.5 and 0.6, below the
        // auto-accept threshold.
        let fixture = fixture(Some(release_doc(0.3)), 1.0);
        let outcome = fixture.pipeline.diagnose(&good_photo(), 2_000).unwrap();
        let record = match outcome {
            DiagnosisOutcome::Diagnosed(record) => record,
            other => panic!("expected diagnosis, got {other:?}"),
        };
        let case_id = record.review_case_id.unwrap();
        assert!(record.calibrated_confidence < 0.6);
        assert_eq!(fixture.pipeline.review_queue().depth().unwrap(), 1);
        // No feedback is sampled for routed diagnoses.
        assert_eq!(fixture.feedback.max_record_id().unwrap(), 0);

        let case = fixture.pipeline.review_queue().case(case_id).unwrap();
        assert_eq!(case.predicted_class, record.predicted_class);
        assert_eq!(case.submitter, "farmer-7");
    }

    #[test]
    fn no_active_release_is_service_unavailable() {
        let fixture = fixture(None, 1.0);
        let err = fixture.pipeline.diagnose(&good_photo(), 2_000).unwrap_err();
        assert!(matches!(err, PipelineError::ServiceUnavailable));
    }

    #[test]
    fn rollback_switches_serving_without_restart() {
        let fixture = fixture(Some(release_doc(6.0)), 1.0);
        let first = fixture.registry.snapshot().unwrap().version.id;
        let second_doc = release_doc(6.0);
        let second = fixture
            .registry
            .register_candidate(&second_doc, None, 200)
            .unwrap();
        fixture.registry.mark_validated(second.id, 0.95).unwrap();
        fixture.registry.promote(second.id, 210).unwrap();

        let outcome = fixture.pipeline.diagnose(&good_photo(), 2_000).unwrap();
        match outcome {
            DiagnosisOutcome::Diagnosed(record) => {
                assert_eq!(record.model_version, second.id)
            }
            other => panic!("expected diagnosis, got {other:?}"),
        }

        let ctx = crate::registry::OperatorContext {
            operator: "ops-on-call".to_string(),
        };
        fixture.registry.rollback(first, &ctx, 300).unwrap();
        let outcome = fixture.pipeline.diagnose(&good_photo(), 2_100).unwrap();
        match outcome {
            DiagnosisOutcome::Diagnosed(record) => assert_eq!(record.model_version, first),
            other => panic!("expected diagnosis, got {other:?}"),
        }
    }
}
