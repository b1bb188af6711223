//! End-to-end flows: an uncertain diagnosis through the review loop, and
//! a retrain cycle promoting past the incumbent release.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use image::{Rgb, RgbImage};

use kropscan::calibrate::IsotonicCalibrator;
use kropscan::config::{PipelineConfig, RetrainConfig};
use kropscan::inference::features::{FEAT_VERSION, FEATURE_LEN};
use kropscan::inference::stump::{StumpModel, StumpSplit};
use kropscan::pipeline::{DiagnosisOutcome, DiagnosisPipeline, ImageSample};
use kropscan::registry::{MemberDoc, ModelRegistry, StumpLoader, VersionStatus, WeightSetDoc};
use kropscan::retrain::trainer::StumpTrainer;
use kropscan::retrain::{RetrainJob, RetrainOutcome};
use kropscan::review::ReviewError;
use kropscan::review::feedback::{FeedbackSource, FeedbackStore};
use kropscan::store::DiagnosisStore;
use kropscan::taxonomy::Taxonomy;

fn taxonomy() -> Taxonomy {
    Taxonomy::new(vec![
        "tomato___healthy".to_string(),
        "tomato___early_blight".to_string(),
        "tomato___late_blight".to_string(),
    ])
    .unwrap()
}

/// Constant-logit model favoring `tomato___early_blight`; the logit
/// controls the raw confidence.
fn biased_model(logit: f32) -> StumpModel {
    StumpModel {
        model_version: 1,
        feat_version: FEAT_VERSION,
        feature_len: FEATURE_LEN,
        classes: taxonomy().classes().to_vec(),
        learning_rate: 0.1,
        init_raw: vec![0.0, logit, 0.0],
        rounds: vec![vec![
            StumpSplit {
                feature_index: 0,
                threshold: 0.5,
                left_value: 0.0,
                right_value: 0.0,
            };
            3
        ]],
    }
}

/// Sharp, well-exposed leaf photo that clears the quality gate.
fn leaf_photo() -> ImageSample {
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

fn labeled_photo(class_index: usize, variant: u8) -> RgbImage {
    let pixel = match class_index {
        0 => Rgb([30 + variant, 190, 40]),
        1 => Rgb([150, 90 + variant, 30]),
        _ => Rgb([90, 60, 120 + variant]),
    };
    RgbImage::from_pixel(32, 32, pixel)
}

#[test]
fn uncertain_diagnosis_flows_through_review_to_expert_feedback() {
    let store = Arc::new(DiagnosisStore::open_in_memory().unwrap());
    let registry = Arc::new(ModelRegistry::open(Arc::clone(&store), Box::new(StumpLoader)).unwrap());

    // Raw confidence lands near 0.52; the fitted calibrator shrinks that
    // to 0.45, below the 0.6 auto-accept threshold.
    let mut pairs = vec![(0.52f32, true); 9];
    pairs.extend(vec![(0.52f32, false); 11]);
    let doc = WeightSetDoc {
        taxonomy_version: taxonomy().version(),
        members: vec![MemberDoc {
            model: biased_model(0.7732),
            validation_accuracy: 0.9,
        }],
        calibration: IsotonicCalibrator::fit(&pairs),
    };
    let version = registry.register_candidate(&doc, None, 100).unwrap();
    registry.mark_validated(version.id, 0.88).unwrap();
    registry.promote(version.id, 110).unwrap();

    let feedback = Arc::new(FeedbackStore::new(Arc::clone(&store), 1.0, 1));
    let pipeline = DiagnosisPipeline::new(
        &PipelineConfig::default(),
        taxonomy(),
        Arc::clone(&store),
        Arc::clone(&registry),
        Arc::clone(&feedback),
        None,
    );

    let outcome = pipeline.diagnose(&leaf_photo(), 2_000).unwrap();
    let record = match outcome {
        DiagnosisOutcome::Diagnosed(record) => record,
        other => panic!("expected diagnosis, got {other:?}"),
    };
    assert_eq!(record.predicted_label, "tomato___early_blight");
    assert!((record.raw_confidence - 0.52).abs() < 0.02);
    assert!((record.calibrated_confidence - 0.45).abs() < 0.02);
    let case_id = record.review_case_id.expect("case should be routed to review");

    // The case is served to experts at its calibrated priority.
    let queue = pipeline.review_queue();
    let next = queue.next_pending().unwrap().unwrap();
    assert_eq!(next.id, case_id);
    assert!((next.calibrated_confidence - 0.45).abs() < 0.02);
    assert_eq!(next.submitter, "farmer-7");

    // Expert claims and corrects the label to late blight.
    queue.claim(case_id, "agronomist-3").unwrap();
    let late_blight = taxonomy().index_of("tomato___late_blight").unwrap();
    queue.resolve(case_id, "agronomist-3", late_blight, 3_000).unwrap();

    // One expert-corrected feedback record carries the corrected class.
    let records = feedback.records_up_to(feedback.max_record_id().unwrap()).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].class_index, late_blight);
    assert_eq!(records[0].source, FeedbackSource::ExpertCorrected);
    assert_eq!(records[0].case_id, Some(case_id));

    // A second resolution attempt conflicts; the first label stands.
    let err = queue
        .resolve(case_id, "agronomist-4", 0, 3_100)
        .unwrap_err();
    assert!(matches!(err, ReviewError::Conflict(_)));
    let (class, expert) = queue.expert_label(case_id).unwrap().unwrap();
    assert_eq!(class, late_blight);
    assert_eq!(expert, "agronomist-3");
}

#[test]
fn accumulated_feedback_retrains_and_promotes_past_the_incumbent() {
    let store = Arc::new(DiagnosisStore::open_in_memory().unwrap());
    let registry = Arc::new(ModelRegistry::open(Arc::clone(&store), Box::new(StumpLoader)).unwrap());

    // Incumbent at 0.88 ensemble accuracy.
    let doc = WeightSetDoc {
        taxonomy_version: taxonomy().version(),
        members: vec![MemberDoc {
            model: biased_model(2.0),
            validation_accuracy: 0.88,
        }],
        calibration: IsotonicCalibrator::identity(),
    };
    let incumbent = registry.register_candidate(&doc, None, 100).unwrap();
    registry.mark_validated(incumbent.id, 0.88).unwrap();
    registry.promote(incumbent.id, 110).unwrap();

    // Accumulate an easily separable labeled corpus past the threshold.
    let feedback = Arc::new(FeedbackStore::new(Arc::clone(&store), 1.0, 1));
    for i in 0..60 {
        let class_index = i % 3;
        feedback
            .append(
                &labeled_photo(class_index, (i % 7) as u8),
                class_index,
                FeedbackSource::ExpertCorrected,
                None,
                1_000 + i as i64,
            )
            .unwrap();
    }

    let mut config = RetrainConfig::default();
    config.feedback_threshold = 50;
    config.promotion_margin = 0.02;
    config.rounds = 15;
    config.learning_rate = 0.3;
    let job = RetrainJob {
        feedback: Arc::clone(&feedback),
        registry: Arc::clone(&registry),
        trainer: Box::new(StumpTrainer),
        taxonomy: taxonomy(),
        config,
        ensemble_members: 3,
        alerts: None,
    };

    let cancel = AtomicBool::new(false);
    let outcome = job.run_once(5_000, &cancel).unwrap();
    let promoted = match outcome {
        RetrainOutcome::Promoted(id) => id,
        other => panic!("expected promotion, got {other:?}"),
    };

    // The candidate cleared the 0.02 margin over 0.88 and now serves.
    let release = registry.snapshot().unwrap();
    assert_eq!(release.version.id, promoted);
    assert!(release.version.metric >= 0.90);
    assert_eq!(release.members.len(), 3);

    // The incumbent is retired but remains queryable for rollback.
    let prior = registry.version(incumbent.id).unwrap();
    assert_eq!(prior.status, VersionStatus::Retired);
    assert_eq!(registry.last_known_good().unwrap().version.id, incumbent.id);
}
