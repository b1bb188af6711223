//! Crop disease diagnosis core: calibrated ensemble inference with a
//! human-in-the-loop feedback and retraining cycle.
/// Operational alert channel.
pub mod alert;
/// Confidence calibration and routing decisions.
pub mod calibrate;
/// Pipeline configuration loading.
pub mod config;
/// Ensemble inference, feature extraction and the bundled classifier.
pub mod inference;
/// Rolling file logging setup.
pub mod logging;
/// Validation metrics.
pub mod metrics;
/// End-to-end diagnosis pipeline.
pub mod pipeline;
/// Image quality gate.
pub mod quality;
/// Model version registry and promotion.
pub mod registry;
/// Scheduled retraining from accumulated feedback.
pub mod retrain;
/// Expert review queue and feedback corpus.
pub mod review;
/// SQLite persistence.
pub mod store;
/// Crop/disease class taxonomy.
pub mod taxonomy;
