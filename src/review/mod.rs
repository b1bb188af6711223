//! Expert review queue.
//!
//! Low-confidence predictions become review cases served to experts in
//! ascending calibrated-confidence order (most uncertain first), FIFO
//! among equals. Claim and resolve are compare-and-set transitions so
//! concurrent experts cannot double-assign or double-resolve a case;
//! losers get a `Conflict` and state is untouched. Pending cases past the
//! SLA expire and auto-resolve with the original prediction so the queue
//! never grows unboundedly stale.

pub mod feedback;

use std::sync::Arc;

use rusqlite::{OptionalExtension, params};
use thiserror::Error;
use uuid::Uuid;

use crate::pipeline::ImageSample;
use crate::store::{DiagnosisStore, StoreError, encode_png};
use feedback::FeedbackSource;

/// Lifecycle state of a review case.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaseStatus {
    Pending,
    Assigned,
    Resolved,
    Expired,
}

impl CaseStatus {
    /// Convert the status to a SQLite-friendly integer.
    pub fn as_i64(self) -> i64 {
        match self {
            CaseStatus::Pending => 0,
            CaseStatus::Assigned => 1,
            CaseStatus::Resolved => 2,
            CaseStatus::Expired => 3,
        }
    }

    /// Parse an integer column value into a status.
    pub fn from_i64(value: i64) -> Self {
        match value {
            1 => CaseStatus::Assigned,
            2 => CaseStatus::Resolved,
            3 => CaseStatus::Expired,
            _ => CaseStatus::Pending,
        }
    }

    /// Whether the status is terminal.
    pub fn is_terminal(self) -> bool {
        matches!(self, CaseStatus::Resolved | CaseStatus::Expired)
    }
}

/// Errors returned by queue operations.
#[derive(Debug, Error)]
pub enum ReviewError {
    /// The compare-and-set transition lost: the case is already assigned
    /// or already terminal. State is unchanged.
    #[error("Case {0} is not in a state that allows this transition")]
    Conflict(Uuid),
    #[error("No case with id {0}")]
    NotFound(Uuid),
    #[error("Label is not part of the taxonomy: {0}")]
    UnknownLabel(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("Database query failed: {0}")]
    Sql(#[from] rusqlite::Error),
}

/// Prediction context retained on a review case.
#[derive(Debug, Clone)]
pub struct CasePrediction {
    pub predicted_class: usize,
    pub probabilities: Vec<f32>,
    pub raw_confidence: f32,
    pub calibrated_confidence: f32,
    pub quality_score: f32,
}

/// A review case as stored; the image blob is fetched separately.
#[derive(Debug, Clone)]
pub struct ReviewCase {
    pub id: Uuid,
    pub status: CaseStatus,
    pub predicted_class: usize,
    pub raw_confidence: f32,
    pub calibrated_confidence: f32,
    pub quality_score: f32,
    pub submitter: String,
    pub captured_at: i64,
    pub created_at: i64,
    pub assigned_to: Option<String>,
    pub resolved_at: Option<i64>,
}

/// SQLite-backed queue of review cases.
pub struct ReviewQueue {
    store: Arc<DiagnosisStore>,
}

impl ReviewQueue {
    pub fn new(store: Arc<DiagnosisStore>) -> Self {
        Self { store }
    }

    /// Persist a new pending case, taking ownership of the sample image.
    pub fn create_case(
        &self,
        sample: &ImageSample,
        prediction: &CasePrediction,
        now: i64,
    ) -> Result<Uuid, ReviewError> {
        let id = Uuid::new_v4();
        let image = encode_png(&sample.image)?;
        let probabilities = serde_json::to_string(&prediction.probabilities)
            .map_err(StoreError::CorruptDocument)?;
        let conn = self.store.lock();
        conn.execute(
            "INSERT INTO review_cases (
                id, image, captured_at, submitter, predicted_class,
                probabilities, raw_confidence, calibrated_confidence,
                quality_score, status, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                id.to_string(),
                image,
                sample.captured_at,
                sample.submitter,
                prediction.predicted_class as i64,
                probabilities,
                prediction.raw_confidence,
                prediction.calibrated_confidence,
                prediction.quality_score,
                CaseStatus::Pending.as_i64(),
                now,
            ],
        )?;
        tracing::info!(
            "Review case {id} created at calibrated confidence {:.3}",
            prediction.calibrated_confidence
        );
        Ok(id)
    }

    /// The pending case an expert should look at next: lowest calibrated
    /// confidence first, earliest creation among equals.
    pub fn next_pending(&self) -> Result<Option<ReviewCase>, ReviewError> {
        let conn = self.store.lock();
        let case = conn
            .query_row(
                &format!(
                    "SELECT {CASE_COLUMNS} FROM review_cases WHERE status = ?1
                     ORDER BY calibrated_confidence ASC, created_at ASC, id ASC LIMIT 1"
                ),
                params![CaseStatus::Pending.as_i64()],
                row_to_case,
            )
            .optional()?;
        Ok(case)
    }

    /// Atomically claim a pending case for an expert.
    ///
    /// A second claim on an already-assigned case fails with `Conflict`
    /// and does not alter state.
    pub fn claim(&self, case_id: Uuid, expert: &str) -> Result<(), ReviewError> {
        let conn = self.store.lock();
        let changed = conn.execute(
            "UPDATE review_cases SET status = ?1, assigned_to = ?2
             WHERE id = ?3 AND status = ?4",
            params![
                CaseStatus::Assigned.as_i64(),
                expert,
                case_id.to_string(),
                CaseStatus::Pending.as_i64(),
            ],
        )?;
        if changed == 1 {
            return Ok(());
        }
        Err(self.conflict_or_not_found(&conn, case_id))
    }

    /// Resolve a claimed case with an expert label.
    ///
    /// Stores the immutable expert label, appends one expert-corrected
    /// feedback record carrying the case image, and moves the case to
    /// `Resolved`. Only an assigned case can resolve; an unclaimed or
    /// already-terminal case fails with `Conflict`, and the first
    /// resolution's label is retained.
    pub fn resolve(
        &self,
        case_id: Uuid,
        expert: &str,
        corrected_class: usize,
        now: i64,
    ) -> Result<(), ReviewError> {
        let mut conn = self.store.lock();
        let tx = conn.transaction()?;
        let changed = tx.execute(
            "UPDATE review_cases SET status = ?1, resolved_at = ?2
             WHERE id = ?3 AND status = ?4",
            params![
                CaseStatus::Resolved.as_i64(),
                now,
                case_id.to_string(),
                CaseStatus::Assigned.as_i64(),
            ],
        )?;
        if changed != 1 {
            drop(tx);
            return Err(self.conflict_or_not_found(&conn, case_id));
        }
        tx.execute(
            "INSERT INTO expert_labels (case_id, class_index, expert, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![case_id.to_string(), corrected_class as i64, expert, now],
        )?;
        tx.execute(
            "INSERT INTO feedback_records (image, class_index, source, case_id, created_at)
             SELECT image, ?1, ?2, id, ?3 FROM review_cases WHERE id = ?4",
            params![
                corrected_class as i64,
                FeedbackSource::ExpertCorrected.as_i64(),
                now,
                case_id.to_string(),
            ],
        )?;
        tx.commit()?;
        tracing::info!("Case {case_id} resolved by {expert} as class {corrected_class}");
        Ok(())
    }

    /// Expire pending cases older than the SLA, auto-resolving each with
    /// its original prediction. Returns the expired case ids.
    pub fn expire_stale(&self, now: i64, sla_seconds: i64) -> Result<Vec<Uuid>, ReviewError> {
        let stale_before = now.saturating_sub(sla_seconds);
        let mut conn = self.store.lock();
        let tx = conn.transaction()?;
        let expired: Vec<Uuid> = {
            let mut statement = tx.prepare(
                "SELECT id FROM review_cases WHERE status = ?1 AND created_at <= ?2",
            )?;
            let ids = statement.query_map(
                params![CaseStatus::Pending.as_i64(), stale_before],
                |row| row.get::<_, String>(0),
            )?;
            ids.filter_map(|id| id.ok())
                .filter_map(|id| Uuid::parse_str(&id).ok())
                .collect()
        };
        for id in &expired {
            tx.execute(
                "UPDATE review_cases SET status = ?1, resolved_at = ?2
                 WHERE id = ?3 AND status = ?4",
                params![
                    CaseStatus::Expired.as_i64(),
                    now,
                    id.to_string(),
                    CaseStatus::Pending.as_i64(),
                ],
            )?;
            tx.execute(
                "INSERT INTO feedback_records (image, class_index, source, case_id, created_at)
                 SELECT image, predicted_class, ?1, id, ?2 FROM review_cases WHERE id = ?3",
                params![FeedbackSource::AutoAccepted.as_i64(), now, id.to_string()],
            )?;
        }
        tx.commit()?;
        if !expired.is_empty() {
            tracing::info!("Expired {} stale review cases", expired.len());
        }
        Ok(expired)
    }

    /// Fetch a case by id.
    pub fn case(&self, case_id: Uuid) -> Result<ReviewCase, ReviewError> {
        let conn = self.store.lock();
        conn.query_row(
            &format!("SELECT {CASE_COLUMNS} FROM review_cases WHERE id = ?1"),
            params![case_id.to_string()],
            row_to_case,
        )
        .optional()?
        .ok_or(ReviewError::NotFound(case_id))
    }

    /// The expert label stored for a resolved case, if any.
    pub fn expert_label(&self, case_id: Uuid) -> Result<Option<(usize, String)>, ReviewError> {
        let conn = self.store.lock();
        let label = conn
            .query_row(
                "SELECT class_index, expert FROM expert_labels WHERE case_id = ?1",
                params![case_id.to_string()],
                |row| Ok((row.get::<_, i64>(0)? as usize, row.get::<_, String>(1)?)),
            )
            .optional()?;
        Ok(label)
    }

    /// Number of pending cases.
    pub fn depth(&self) -> Result<u64, ReviewError> {
        let conn = self.store.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM review_cases WHERE status = ?1",
            params![CaseStatus::Pending.as_i64()],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Age in seconds of the oldest pending case, if any.
    pub fn oldest_pending_age(&self, now: i64) -> Result<Option<i64>, ReviewError> {
        let conn = self.store.lock();
        let oldest: Option<i64> = conn.query_row(
            "SELECT MIN(created_at) FROM review_cases WHERE status = ?1",
            params![CaseStatus::Pending.as_i64()],
            |row| row.get(0),
        )?;
        Ok(oldest.map(|created| now.saturating_sub(created)))
    }

    fn conflict_or_not_found(
        &self,
        conn: &rusqlite::Connection,
        case_id: Uuid,
    ) -> ReviewError {
        let exists = conn
            .query_row(
                "SELECT 1 FROM review_cases WHERE id = ?1",
                params![case_id.to_string()],
                |_| Ok(()),
            )
            .optional();
        match exists {
            Ok(Some(())) => ReviewError::Conflict(case_id),
            Ok(None) => ReviewError::NotFound(case_id),
            Err(err) => ReviewError::Sql(err),
        }
    }
}

const CASE_COLUMNS: &str = "id, status, predicted_class, raw_confidence, \
    calibrated_confidence, quality_score, submitter, captured_at, created_at, \
    assigned_to, resolved_at";

fn row_to_case(row: &rusqlite::Row<'_>) -> rusqlite::Result<ReviewCase> {
    let id: String = row.get(0)?;
    Ok(ReviewCase {
        id: Uuid::parse_str(&id).unwrap_or_default(),
        status: CaseStatus::from_i64(row.get(1)?),
        predicted_class: row.get::<_, i64>(2)? as usize,
        raw_confidence: row.get(3)?,
        calibrated_confidence: row.get(4)?,
        quality_score: row.get(5)?,
        submitter: row.get(6)?,
        captured_at: row.get(7)?,
        created_at: row.get(8)?,
        assigned_to: row.get(9)?,
        resolved_at: row.get(10)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn sample() -> ImageSample {
        ImageSample {
            image: RgbImage::from_pixel(16, 16, Rgb([40, 160, 60])),
            captured_at: 1_000,
            submitter: "farmer-7".to_string(),
        }
    }

    fn prediction(calibrated: f32) -> CasePrediction {
        CasePrediction {
            predicted_class: 1,
            probabilities: vec![0.3, 0.52, 0.18],
            raw_confidence: 0.52,
            calibrated_confidence: calibrated,
            quality_score: 82.0,
        }
    }

    fn queue() -> ReviewQueue {
        ReviewQueue::new(Arc::new(DiagnosisStore::open_in_memory().unwrap()))
    }

    #[test]
    fn serves_most_uncertain_first_then_fifo() {
        let queue = queue();
        let confident = queue
            .create_case(&sample(), &prediction(0.55), 100)
            .unwrap();
        let uncertain_late = queue
            .create_case(&sample(), &prediction(0.20), 300)
            .unwrap();
        let uncertain_early = queue
            .create_case(&sample(), &prediction(0.20), 200)
            .unwrap();

        let first = queue.next_pending().unwrap().unwrap();
        assert_eq!(first.id, uncertain_early);
        queue.claim(first.id, "expert-a").unwrap();

        let second = queue.next_pending().unwrap().unwrap();
        assert_eq!(second.id, uncertain_late);
        queue.claim(second.id, "expert-a").unwrap();

        let third = queue.next_pending().unwrap().unwrap();
        assert_eq!(third.id, confident);
    }

    #[test]
    fn double_claim_is_a_conflict_and_keeps_first_assignee() {
        let queue = queue();
        let id = queue.create_case(&sample(), &prediction(0.4), 100).unwrap();
        queue.claim(id, "expert-a").unwrap();
        let err = queue.claim(id, "expert-b").unwrap_err();
        assert!(matches!(err, ReviewError::Conflict(_)));
        let case = queue.case(id).unwrap();
        assert_eq!(case.assigned_to.as_deref(), Some("expert-a"));
        assert_eq!(case.status, CaseStatus::Assigned);
    }

    #[test]
    fn resolve_appends_expert_feedback_and_is_single_shot() {
        let queue = queue();
        let id = queue.create_case(&sample(), &prediction(0.45), 100).unwrap();
        queue.claim(id, "expert-a").unwrap();
        queue.resolve(id, "expert-a", 2, 200).unwrap();

        let case = queue.case(id).unwrap();
        assert_eq!(case.status, CaseStatus::Resolved);
        assert_eq!(queue.expert_label(id).unwrap().unwrap().0, 2);

        let err = queue.resolve(id, "expert-b", 0, 300).unwrap_err();
        assert!(matches!(err, ReviewError::Conflict(_)));
        // First resolution's label is retained.
        let (class, expert) = queue.expert_label(id).unwrap().unwrap();
        assert_eq!(class, 2);
        assert_eq!(expert, "expert-a");
    }

    #[test]
    fn resolving_an_unclaimed_case_is_a_conflict() {
        let queue = queue();
        let id = queue.create_case(&sample(), &prediction(0.4), 100).unwrap();
        let err = queue.resolve(id, "expert-a", 2, 200).unwrap_err();
        assert!(matches!(err, ReviewError::Conflict(_)));
        // The case stays pending and serveable.
        assert_eq!(queue.case(id).unwrap().status, CaseStatus::Pending);
        assert!(queue.expert_label(id).unwrap().is_none());
    }

    #[test]
    fn claiming_a_missing_case_reports_not_found() {
        let queue = queue();
        let err = queue.claim(Uuid::new_v4(), "expert-a").unwrap_err();
        assert!(matches!(err, ReviewError::NotFound(_)));
    }

    #[test]
    fn stale_pending_cases_expire_with_original_prediction() {
        let queue = queue();
        let stale = queue.create_case(&sample(), &prediction(0.4), 100).unwrap();
        let fresh = queue.create_case(&sample(), &prediction(0.4), 900).unwrap();

        let expired = queue.expire_stale(1_000, 500).unwrap();
        assert_eq!(expired, vec![stale]);
        assert_eq!(queue.case(stale).unwrap().status, CaseStatus::Expired);
        assert_eq!(queue.case(fresh).unwrap().status, CaseStatus::Pending);

        // Expiry is terminal; claiming now conflicts.
        let err = queue.claim(stale, "expert-a").unwrap_err();
        assert!(matches!(err, ReviewError::Conflict(_)));
    }

    #[test]
    fn depth_and_oldest_age_track_pending_only() {
        let queue = queue();
        assert_eq!(queue.depth().unwrap(), 0);
        assert_eq!(queue.oldest_pending_age(500).unwrap(), None);
        let id = queue.create_case(&sample(), &prediction(0.4), 100).unwrap();
        queue.create_case(&sample(), &prediction(0.5), 200).unwrap();
        assert_eq!(queue.depth().unwrap(), 2);
        assert_eq!(queue.oldest_pending_age(500).unwrap(), Some(400));
        queue.claim(id, "expert-a").unwrap();
        assert_eq!(queue.depth().unwrap(), 1);
    }
}
