//! Feedback corpus feeding the retraining pipeline.
//!
//! Expert-corrected records are always retained. Auto-accepted diagnoses
//! would swamp the corpus with easy cases, so only a sampled subset is
//! kept; the rate and seed are configuration.

use std::sync::{Arc, Mutex};

use image::RgbImage;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rusqlite::params;
use uuid::Uuid;

use crate::store::{DiagnosisStore, StoreError, decode_png, encode_png};

/// Provenance of a feedback record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedbackSource {
    /// High-confidence fast path or SLA expiry; label is the prediction.
    AutoAccepted,
    /// A human expert supplied or corrected the label.
    ExpertCorrected,
}

impl FeedbackSource {
    pub fn as_i64(self) -> i64 {
        match self {
            FeedbackSource::AutoAccepted => 0,
            FeedbackSource::ExpertCorrected => 1,
        }
    }

    pub fn from_i64(value: i64) -> Self {
        match value {
            1 => FeedbackSource::ExpertCorrected,
            _ => FeedbackSource::AutoAccepted,
        }
    }
}

/// One labeled example of the training corpus.
#[derive(Debug, Clone)]
pub struct FeedbackRecord {
    pub id: i64,
    pub class_index: usize,
    pub source: FeedbackSource,
    pub case_id: Option<Uuid>,
    pub created_at: i64,
}

/// A labeled image materialized for training.
#[derive(Debug, Clone)]
pub struct LabeledImage {
    pub record_id: i64,
    pub image: RgbImage,
    pub class_index: usize,
}

/// Append-only store of labeled feedback.
pub struct FeedbackStore {
    store: Arc<DiagnosisStore>,
    sample_rate: f32,
    rng: Mutex<StdRng>,
}

impl FeedbackStore {
    pub fn new(store: Arc<DiagnosisStore>, sample_rate: f32, seed: u64) -> Self {
        Self {
            store,
            sample_rate: sample_rate.clamp(0.0, 1.0),
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// Retain an auto-accepted diagnosis with probability `sample_rate`.
    ///
    /// Returns whether the record was kept.
    pub fn maybe_record_auto(
        &self,
        image: &RgbImage,
        class_index: usize,
        now: i64,
    ) -> Result<bool, StoreError> {
        let keep = {
            let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            rng.random::<f32>() < self.sample_rate
        };
        if !keep {
            return Ok(false);
        }
        self.append(image, class_index, FeedbackSource::AutoAccepted, None, now)?;
        Ok(true)
    }

    /// Append a record unconditionally.
    pub fn append(
        &self,
        image: &RgbImage,
        class_index: usize,
        source: FeedbackSource,
        case_id: Option<Uuid>,
        now: i64,
    ) -> Result<i64, StoreError> {
        let blob = encode_png(image)?;
        let conn = self.store.lock();
        conn.execute(
            "INSERT INTO feedback_records (image, class_index, source, case_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                blob,
                class_index as i64,
                source.as_i64(),
                case_id.map(|id| id.to_string()),
                now,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Highest record id currently in the corpus (0 when empty).
    pub fn max_record_id(&self) -> Result<i64, StoreError> {
        let conn = self.store.lock();
        let max: Option<i64> = conn.query_row(
            "SELECT MAX(id) FROM feedback_records",
            [],
            |row| row.get(0),
        )?;
        Ok(max.unwrap_or(0))
    }

    /// Number of records newer than a record id.
    pub fn count_since(&self, last_record_id: i64) -> Result<u64, StoreError> {
        let conn = self.store.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM feedback_records WHERE id > ?1",
            params![last_record_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Record metadata up to and including a record id.
    pub fn records_up_to(&self, up_to_id: i64) -> Result<Vec<FeedbackRecord>, StoreError> {
        let conn = self.store.lock();
        let mut statement = conn.prepare(
            "SELECT id, class_index, source, case_id, created_at
             FROM feedback_records WHERE id <= ?1 ORDER BY id ASC",
        )?;
        let rows = statement.query_map(params![up_to_id], |row| {
            let case_id: Option<String> = row.get(3)?;
            Ok(FeedbackRecord {
                id: row.get(0)?,
                class_index: row.get::<_, i64>(1)? as usize,
                source: FeedbackSource::from_i64(row.get(2)?),
                case_id: case_id.and_then(|id| Uuid::parse_str(&id).ok()),
                created_at: row.get(4)?,
            })
        })?;
        Ok(rows.filter_map(|row| row.ok()).collect())
    }

    /// Materialize the labeled corpus up to a record id for training.
    pub fn corpus_up_to(&self, up_to_id: i64) -> Result<Vec<LabeledImage>, StoreError> {
        let conn = self.store.lock();
        let mut statement = conn.prepare(
            "SELECT id, image, class_index FROM feedback_records
             WHERE id <= ?1 ORDER BY id ASC",
        )?;
        let rows = statement.query_map(params![up_to_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, Vec<u8>>(1)?,
                row.get::<_, i64>(2)? as usize,
            ))
        })?;
        let mut corpus = Vec::new();
        for row in rows {
            let (record_id, blob, class_index) = row?;
            corpus.push(LabeledImage {
                record_id,
                image: decode_png(&blob)?,
                class_index,
            });
        }
        Ok(corpus)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn leaf() -> RgbImage {
        RgbImage::from_pixel(12, 12, Rgb([30, 150, 50]))
    }

    fn store() -> Arc<DiagnosisStore> {
        Arc::new(DiagnosisStore::open_in_memory().unwrap())
    }

    #[test]
    fn append_and_count_since() {
        let feedback = FeedbackStore::new(store(), 0.1, 0);
        let first = feedback
            .append(&leaf(), 1, FeedbackSource::ExpertCorrected, None, 100)
            .unwrap();
        feedback
            .append(&leaf(), 2, FeedbackSource::AutoAccepted, None, 200)
            .unwrap();
        assert_eq!(feedback.count_since(0).unwrap(), 2);
        assert_eq!(feedback.count_since(first).unwrap(), 1);
        assert_eq!(feedback.max_record_id().unwrap(), first + 1);
    }

    #[test]
    fn sampling_rate_zero_keeps_nothing_and_one_keeps_everything() {
        let none = FeedbackStore::new(store(), 0.0, 7);
        for _ in 0..20 {
            assert!(!none.maybe_record_auto(&leaf(), 0, 100).unwrap());
        }
        assert_eq!(none.count_since(0).unwrap(), 0);

        let all = FeedbackStore::new(store(), 1.0, 7);
        for _ in 0..20 {
            assert!(all.maybe_record_auto(&leaf(), 0, 100).unwrap());
        }
        assert_eq!(all.count_since(0).unwrap(), 20);
    }

    #[test]
    fn sampling_is_reproducible_for_a_seed() {
        let a = FeedbackStore::new(store(), 0.5, 42);
        let b = FeedbackStore::new(store(), 0.5, 42);
        let kept_a: Vec<bool> = (0..50)
            .map(|_| a.maybe_record_auto(&leaf(), 0, 100).unwrap())
            .collect();
        let kept_b: Vec<bool> = (0..50)
            .map(|_| b.maybe_record_auto(&leaf(), 0, 100).unwrap())
            .collect();
        assert_eq!(kept_a, kept_b);
        assert!(kept_a.iter().any(|&k| k));
        assert!(kept_a.iter().any(|&k| !k));
    }

    #[test]
    fn corpus_round_trips_images_and_labels() {
        let feedback = FeedbackStore::new(store(), 0.1, 0);
        feedback
            .append(&leaf(), 3, FeedbackSource::ExpertCorrected, None, 100)
            .unwrap();
        let corpus = feedback.corpus_up_to(i64::MAX).unwrap();
        assert_eq!(corpus.len(), 1);
        assert_eq!(corpus[0].class_index, 3);
        assert_eq!(corpus[0].image, leaf());
    }

    #[test]
    fn records_carry_source_provenance() {
        let feedback = FeedbackStore::new(store(), 0.1, 0);
        feedback
            .append(&leaf(), 1, FeedbackSource::ExpertCorrected, None, 100)
            .unwrap();
        feedback
            .append(&leaf(), 1, FeedbackSource::AutoAccepted, None, 200)
            .unwrap();
        let records = feedback.records_up_to(i64::MAX).unwrap();
        assert_eq!(records[0].source, FeedbackSource::ExpertCorrected);
        assert_eq!(records[1].source, FeedbackSource::AutoAccepted);
    }
}
