//! Pipeline configuration loaded from TOML.
//!
//! Every recognized option is enumerated here with a default, so a missing
//! or partial config file always yields a usable pipeline. Values are
//! clamped into their valid ranges on load rather than rejected where a
//! sensible clamp exists.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default filename for the pipeline configuration.
pub const CONFIG_FILE_NAME: &str = "kropscan.toml";

/// Errors returned when loading a configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Could not read config at {path}: {source}")]
    Read {
        path: std::path::PathBuf,
        source: std::io::Error,
    },
    #[error("Could not parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Top-level configuration for the diagnosis pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub quality: QualityConfig,
    #[serde(default)]
    pub ensemble: EnsembleConfig,
    #[serde(default)]
    pub calibration: CalibrationConfig,
    #[serde(default)]
    pub review: ReviewConfig,
    #[serde(default)]
    pub retrain: RetrainConfig,
}

impl PipelineConfig {
    /// Load a configuration from a TOML file and normalize it.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Self = toml::from_str(&text)?;
        config.normalize()?;
        Ok(config)
    }

    /// Clamp values into valid ranges and reject unusable combinations.
    pub fn normalize(&mut self) -> Result<(), ConfigError> {
        self.quality.pass_threshold = self.quality.pass_threshold.clamp(0.0, 100.0);
        let weight_sum = self.quality.sharpness_weight
            + self.quality.exposure_weight
            + self.quality.contrast_weight
            + self.quality.coverage_weight;
        if weight_sum <= 0.0 {
            return Err(ConfigError::Invalid(
                "quality weights must sum to a positive value".to_string(),
            ));
        }
        self.ensemble.members = self.ensemble.members.clamp(1, MAX_ENSEMBLE_MEMBERS);
        self.ensemble.crop_variants = self.ensemble.crop_variants.min(MAX_CROP_VARIANTS);
        self.ensemble.brightness_jitter = self.ensemble.brightness_jitter.clamp(0.0, 0.5);
        self.ensemble.top_k = self.ensemble.top_k.max(1);
        self.calibration.auto_accept_threshold =
            self.calibration.auto_accept_threshold.clamp(0.0, 1.0);
        self.review.auto_accept_sample_rate =
            self.review.auto_accept_sample_rate.clamp(0.0, 1.0);
        if self.review.sla_seconds <= 0 {
            return Err(ConfigError::Invalid(
                "review.sla_seconds must be positive".to_string(),
            ));
        }
        self.retrain.promotion_margin = self.retrain.promotion_margin.max(0.0);
        if self.retrain.feedback_threshold == 0 {
            return Err(ConfigError::Invalid(
                "retrain.feedback_threshold must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

const MAX_ENSEMBLE_MEMBERS: usize = 16;
const MAX_CROP_VARIANTS: usize = 8;

/// Quality gate thresholds and score weights.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityConfig {
    /// Score below this value rejects the image before inference.
    #[serde(default = "default_pass_threshold")]
    pub pass_threshold: f32,
    #[serde(default = "default_sharpness_weight")]
    pub sharpness_weight: f32,
    #[serde(default = "default_exposure_weight")]
    pub exposure_weight: f32,
    #[serde(default = "default_contrast_weight")]
    pub contrast_weight: f32,
    #[serde(default = "default_coverage_weight")]
    pub coverage_weight: f32,
    /// Mean luma below this reports `too_dark`.
    #[serde(default = "default_min_brightness")]
    pub min_brightness: f32,
    /// Mean luma above this reports `too_bright`.
    #[serde(default = "default_max_brightness")]
    pub max_brightness: f32,
    /// Laplacian variance below this reports `too_blurry`.
    #[serde(default = "default_min_sharpness")]
    pub min_sharpness: f32,
    /// Subject fraction below this reports `insufficient_subject`.
    #[serde(default = "default_min_coverage")]
    pub min_coverage: f32,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            pass_threshold: default_pass_threshold(),
            sharpness_weight: default_sharpness_weight(),
            exposure_weight: default_exposure_weight(),
            contrast_weight: default_contrast_weight(),
            coverage_weight: default_coverage_weight(),
            min_brightness: default_min_brightness(),
            max_brightness: default_max_brightness(),
            min_sharpness: default_min_sharpness(),
            min_coverage: default_min_coverage(),
        }
    }
}

/// Ensemble size and test-time augmentation options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnsembleConfig {
    /// Number of independently parameterized member models per release.
    #[serde(default = "default_members")]
    pub members: usize,
    #[serde(default = "default_true")]
    pub use_tta: bool,
    /// Number of center-crop views added when TTA is enabled.
    #[serde(default = "default_crop_variants")]
    pub crop_variants: usize,
    /// Relative brightness offset for the jittered TTA views.
    #[serde(default = "default_brightness_jitter")]
    pub brightness_jitter: f32,
    /// Number of alternative labels reported alongside the top label.
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

impl Default for EnsembleConfig {
    fn default() -> Self {
        Self {
            members: default_members(),
            use_tta: true,
            crop_variants: default_crop_variants(),
            brightness_jitter: default_brightness_jitter(),
            top_k: default_top_k(),
        }
    }
}

/// Calibration decision policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationConfig {
    /// Calibrated confidence at or above this is returned directly;
    /// anything below creates a review case.
    #[serde(default = "default_auto_accept_threshold")]
    pub auto_accept_threshold: f32,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            auto_accept_threshold: default_auto_accept_threshold(),
        }
    }
}

/// Review queue SLA and feedback sampling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewConfig {
    /// Pending cases older than this expire and auto-resolve.
    #[serde(default = "default_sla_seconds")]
    pub sla_seconds: i64,
    /// Fraction of auto-accepted diagnoses retained as feedback.
    #[serde(default = "default_auto_accept_sample_rate")]
    pub auto_accept_sample_rate: f32,
    /// Seed for the feedback sampling RNG.
    #[serde(default)]
    pub sample_seed: u64,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            sla_seconds: default_sla_seconds(),
            auto_accept_sample_rate: default_auto_accept_sample_rate(),
            sample_seed: 0,
        }
    }
}

/// Retraining trigger and promotion gate settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrainConfig {
    /// New feedback records required before a retrain run starts.
    #[serde(default = "default_feedback_threshold")]
    pub feedback_threshold: u64,
    /// Minimum validation-accuracy improvement required for promotion.
    #[serde(default = "default_promotion_margin")]
    pub promotion_margin: f32,
    /// Seconds between scheduler wakeups.
    #[serde(default = "default_interval_seconds")]
    pub interval_seconds: u64,
    /// Boosting rounds for the bundled trainer.
    #[serde(default = "default_rounds")]
    pub rounds: usize,
    /// Learning rate for the bundled trainer.
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f32,
    /// Seed for bootstrap resampling of member training sets.
    #[serde(default)]
    pub train_seed: u64,
}

impl Default for RetrainConfig {
    fn default() -> Self {
        Self {
            feedback_threshold: default_feedback_threshold(),
            promotion_margin: default_promotion_margin(),
            interval_seconds: default_interval_seconds(),
            rounds: default_rounds(),
            learning_rate: default_learning_rate(),
            train_seed: 0,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_pass_threshold() -> f32 {
    50.0
}

fn default_sharpness_weight() -> f32 {
    0.35
}

fn default_exposure_weight() -> f32 {
    0.25
}

fn default_contrast_weight() -> f32 {
    0.15
}

fn default_coverage_weight() -> f32 {
    0.25
}

fn default_min_brightness() -> f32 {
    50.0
}

fn default_max_brightness() -> f32 {
    200.0
}

fn default_min_sharpness() -> f32 {
    100.0
}

fn default_min_coverage() -> f32 {
    0.10
}

fn default_members() -> usize {
    3
}

fn default_crop_variants() -> usize {
    2
}

fn default_brightness_jitter() -> f32 {
    0.08
}

fn default_top_k() -> usize {
    3
}

fn default_auto_accept_threshold() -> f32 {
    0.60
}

fn default_sla_seconds() -> i64 {
    72 * 3600
}

fn default_auto_accept_sample_rate() -> f32 {
    0.10
}

fn default_feedback_threshold() -> u64 {
    50
}

fn default_promotion_margin() -> f32 {
    0.02
}

fn default_interval_seconds() -> u64 {
    3600
}

fn default_rounds() -> usize {
    60
}

fn default_learning_rate() -> f32 {
    0.1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_yields_defaults() {
        let mut config: PipelineConfig = toml::from_str("").unwrap();
        config.normalize().unwrap();
        assert_eq!(config.calibration.auto_accept_threshold, 0.60);
        assert_eq!(config.retrain.feedback_threshold, 50);
        assert_eq!(config.ensemble.members, 3);
    }

    #[test]
    fn partial_section_keeps_other_defaults() {
        let mut config: PipelineConfig = toml::from_str(
            "[calibration]\nauto_accept_threshold = 0.8\n\n[review]\nsla_seconds = 60\n",
        )
        .unwrap();
        config.normalize().unwrap();
        assert_eq!(config.calibration.auto_accept_threshold, 0.8);
        assert_eq!(config.review.sla_seconds, 60);
        assert_eq!(config.quality.pass_threshold, 50.0);
    }

    #[test]
    fn normalize_clamps_out_of_range_values() {
        let mut config = PipelineConfig::default();
        config.calibration.auto_accept_threshold = 3.0;
        config.ensemble.members = 200;
        config.review.auto_accept_sample_rate = -1.0;
        config.normalize().unwrap();
        assert_eq!(config.calibration.auto_accept_threshold, 1.0);
        assert_eq!(config.ensemble.members, 16);
        assert_eq!(config.review.auto_accept_sample_rate, 0.0);
    }

    #[test]
    fn normalize_rejects_zero_feedback_threshold() {
        let mut config = PipelineConfig::default();
        config.retrain.feedback_threshold = 0;
        assert!(config.normalize().is_err());
    }
}
