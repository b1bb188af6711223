//! Operational alert channel.
//!
//! Alerts are delivered over a plain `mpsc` channel so the embedding
//! application decides how to surface them. Every alert is also written
//! to the log, so wiring a receiver is optional.

use std::sync::mpsc::Sender;

use uuid::Uuid;

/// Conditions the hosting application should know about.
#[derive(Debug, Clone)]
pub enum CoreAlert {
    /// A retrained candidate failed the promotion gate.
    CandidateRejected {
        version: Uuid,
        candidate_metric: f32,
        active_metric: Option<f32>,
    },
    /// The calibrator received a raw confidence outside `[0, 1]`.
    CalibrationClamped { raw: f32 },
    /// Some ensemble members were excluded from a prediction.
    InferenceDegraded {
        surviving_members: usize,
        failed_members: usize,
    },
    /// The active release failed entirely; serving from the previous one.
    ServingFallback { version: Uuid },
}

pub type AlertSender = Sender<CoreAlert>;

/// Log the alert and forward it if a receiver is wired up. A closed
/// receiver is not an error.
pub fn emit(sender: Option<&AlertSender>, alert: CoreAlert) {
    tracing::warn!("Alert: {alert:?}");
    if let Some(sender) = sender {
        let _ = sender.send(alert);
    }
}
