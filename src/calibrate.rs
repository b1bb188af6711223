//! Confidence calibration and the auto-accept / review decision split.
//!
//! Raw softmax-style confidences are systematically overconfident. A
//! per-release isotonic-regression mapping, fitted on the frozen
//! validation split, rescales the raw top-class probability into an
//! empirical correctness likelihood. Isotonic regression is monotone
//! non-decreasing by construction, so downstream ranking (review-queue
//! priority) stays meaningful.

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};

/// Routing decision for one request. The split is exhaustive and mutually
/// exclusive: every request ends in exactly one branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Confidence clears the threshold; the diagnosis returns directly.
    AutoAccept,
    /// Confidence falls short; exactly one review case is created.
    RouteToReview,
}

/// Result of applying the calibration mapping to one raw confidence.
#[derive(Debug, Clone, Copy)]
pub struct CalibrationOutcome {
    /// Calibrated confidence in `[0, 1]`.
    pub calibrated: f32,
    /// The mapping produced an out-of-range value that had to be clamped.
    /// This indicates an internal defect and is flagged for investigation;
    /// the request still completes.
    pub clamped: bool,
}

/// One fitted isotonic block: all raw scores at or above `raw_start` (and
/// below the next block) map to `value`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct IsotonicBlock {
    raw_start: f32,
    value: f32,
}

/// Monotone calibration mapping fitted with pool-adjacent-violators.
///
/// An unfitted calibrator is the identity mapping, which serves a fresh
/// deployment until the first validation fit lands.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IsotonicCalibrator {
    blocks: Vec<IsotonicBlock>,
}

impl IsotonicCalibrator {
    /// Identity calibrator used before any fit exists.
    pub fn identity() -> Self {
        Self::default()
    }

    pub fn is_fitted(&self) -> bool {
        !self.blocks.is_empty()
    }

    /// Fit the mapping from `(raw_confidence, was_correct)` pairs observed
    /// on the frozen validation split.
    ///
    /// Returns the identity calibrator when no pairs are supplied.
    pub fn fit(pairs: &[(f32, bool)]) -> Self {
        if pairs.is_empty() {
            return Self::identity();
        }
        let mut sorted: Vec<(f32, f32)> = pairs
            .iter()
            .map(|&(raw, correct)| (raw.clamp(0.0, 1.0), if correct { 1.0 } else { 0.0 }))
            .collect();
        sorted.sort_by_key(|&(raw, _)| OrderedFloat(raw));

        // Pool adjacent violators: merge neighboring blocks until the mean
        // sequence is non-decreasing.
        struct Pool {
            raw_start: f32,
            sum: f32,
            count: f32,
        }
        let mut pools: Vec<Pool> = Vec::with_capacity(sorted.len());
        for (raw, correct) in sorted {
            pools.push(Pool {
                raw_start: raw,
                sum: correct,
                count: 1.0,
            });
            while pools.len() >= 2 {
                let last = pools.len() - 1;
                let mean_last = pools[last].sum / pools[last].count;
                let mean_prev = pools[last - 1].sum / pools[last - 1].count;
                if mean_prev <= mean_last {
                    break;
                }
                let merged = pools.pop().expect("pool stack underflow");
                let prev = pools.last_mut().expect("pool stack underflow");
                prev.sum += merged.sum;
                prev.count += merged.count;
            }
        }

        let blocks = pools
            .into_iter()
            .map(|pool| IsotonicBlock {
                raw_start: pool.raw_start,
                value: (pool.sum / pool.count).clamp(0.0, 1.0),
            })
            .collect();
        Self { blocks }
    }

    /// Map a raw confidence to its calibrated value.
    ///
    /// Monotone non-decreasing in the input; always inside `[0, 1]`. The
    /// `clamped` flag reports the defensive clamp having fired, which is
    /// an internal defect worth alerting on.
    pub fn calibrate(&self, raw: f32) -> CalibrationOutcome {
        let clamped_input = !(0.0..=1.0).contains(&raw);
        let raw = if raw.is_nan() { 0.0 } else { raw.clamp(0.0, 1.0) };
        if self.blocks.is_empty() {
            return CalibrationOutcome {
                calibrated: raw,
                clamped: clamped_input,
            };
        }
        // Value of the last block whose start is at or below `raw`; raw
        // scores below the first block floor at that block's value.
        let mut value = self.blocks[0].value;
        for block in &self.blocks {
            if block.raw_start <= raw {
                value = block.value;
            } else {
                break;
            }
        }
        let out_of_range = !(0.0..=1.0).contains(&value);
        CalibrationOutcome {
            calibrated: value.clamp(0.0, 1.0),
            clamped: clamped_input || out_of_range,
        }
    }

    /// Decide the routing for a calibrated confidence.
    pub fn decide(calibrated: f32, auto_accept_threshold: f32) -> Decision {
        if calibrated >= auto_accept_threshold {
            Decision::AutoAccept
        } else {
            Decision::RouteToReview
        }
    }
}
