//! Model registry: the authoritative record of released weight sets and
//! which one is currently serving.
//!
//! A version is one released *weight set*: a JSON document bundling every
//! ensemble member (each with its held-out validation accuracy) and the
//! calibrator fitted for the release. The active pointer is a
//! copy-on-write snapshot behind a `RwLock`: readers clone an `Arc` and
//! keep inferring against a consistent set while a promotion swaps the
//! pointer underneath them. Promotions and rollbacks serialize on a
//! dedicated mutex, so a second transition queues behind the first and
//! observes its result.

use std::sync::{Arc, Mutex, RwLock};

use rusqlite::{OptionalExtension, params};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::calibrate::IsotonicCalibrator;
use crate::inference::EnsembleMember;
use crate::inference::stump::{StumpClassifier, StumpModel};
use crate::store::{DiagnosisStore, StoreError};

/// Lifecycle state of a released weight set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VersionStatus {
    Candidate,
    Validated,
    Active,
    Rejected,
    Retired,
}

impl VersionStatus {
    pub fn as_i64(self) -> i64 {
        match self {
            VersionStatus::Candidate => 0,
            VersionStatus::Validated => 1,
            VersionStatus::Active => 2,
            VersionStatus::Rejected => 3,
            VersionStatus::Retired => 4,
        }
    }

    pub fn from_i64(value: i64) -> Self {
        match value {
            1 => VersionStatus::Validated,
            2 => VersionStatus::Active,
            3 => VersionStatus::Rejected,
            4 => VersionStatus::Retired,
            _ => VersionStatus::Candidate,
        }
    }
}

/// Manifest row for one released weight set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelVersion {
    pub id: Uuid,
    /// Ensemble validation accuracy on the frozen split.
    pub metric: f32,
    pub status: VersionStatus,
    pub created_at: i64,
    pub promoted_at: Option<i64>,
    /// Training batch this version was produced from, if retrained.
    pub batch_id: Option<Uuid>,
}

/// One ensemble member inside a weight-set document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberDoc {
    pub model: StumpModel,
    /// Held-out validation accuracy; the member's aggregation weight.
    pub validation_accuracy: f32,
}

/// Serialized weight set referenced from the manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeightSetDoc {
    pub taxonomy_version: i64,
    pub members: Vec<MemberDoc>,
    pub calibration: IsotonicCalibrator,
}

/// A weight set materialized for serving.
pub struct LoadedRelease {
    pub version: ModelVersion,
    pub members: Vec<EnsembleMember>,
    pub calibrator: IsotonicCalibrator,
}

/// Materializes classifiers from a stored weight document. The bundled
/// loader understands stump-GBDT documents; deployments with other model
/// families substitute their own.
pub trait ModelLoader: Send + Sync {
    fn load(&self, version: &ModelVersion, weights_json: &str)
    -> Result<LoadedRelease, RegistryError>;
}

/// Loader for the bundled stump-GBDT weight documents.
pub struct StumpLoader;

impl ModelLoader for StumpLoader {
    fn load(
        &self,
        version: &ModelVersion,
        weights_json: &str,
    ) -> Result<LoadedRelease, RegistryError> {
        let doc: WeightSetDoc = serde_json::from_str(weights_json)
            .map_err(|err| RegistryError::CorruptWeights(version.id, err.to_string()))?;
        let mut members = Vec::with_capacity(doc.members.len());
        for (member_index, member) in doc.members.into_iter().enumerate() {
            let classifier = StumpClassifier::new(member.model)
                .map_err(|err| RegistryError::CorruptWeights(version.id, err))?;
            members.push(EnsembleMember {
                member_index,
                weight: member.validation_accuracy,
                classifier: Arc::new(classifier),
            });
        }
        Ok(LoadedRelease {
            version: version.clone(),
            members,
            calibrator: doc.calibration,
        })
    }
}

/// Explicit operator identity required for manual registry transitions.
///
/// Passing it through the call makes promotion logic testable without any
/// ambient authentication state.
#[derive(Debug, Clone)]
pub struct OperatorContext {
    pub operator: String,
}

/// Errors returned by registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("No model version with id {0}")]
    NotFound(Uuid),
    #[error("Version {id} is {status:?}; transition to {target:?} is not allowed")]
    InvalidTransition {
        id: Uuid,
        status: VersionStatus,
        target: VersionStatus,
    },
    #[error("Weight document for version {0} is corrupt: {1}")]
    CorruptWeights(Uuid, String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("Database query failed: {0}")]
    Sql(#[from] rusqlite::Error),
}

/// Summary row exposed to operational tooling.
#[derive(Debug, Clone, Serialize)]
pub struct VersionSummary {
    pub id: Uuid,
    pub metric: f32,
    pub status: VersionStatus,
    pub created_at: i64,
}

/// Introspection snapshot for dashboards.
#[derive(Debug, Clone, Serialize)]
pub struct RegistryStatus {
    pub active: Option<VersionSummary>,
    pub candidates: Vec<VersionSummary>,
    pub rejected: Vec<VersionSummary>,
    pub retired: Vec<VersionSummary>,
}

/// Absorbs f32 rounding so a candidate exactly at the margin is not
/// rejected by the subtraction landing an ulp short.
const GATE_EPSILON: f32 = 1e-6;

/// Whether a candidate metric clears the promotion gate against the
/// incumbent. Pure so repeated evaluation is trivially deterministic; a
/// missing incumbent always passes (first deployment).
pub fn promotion_gate(candidate_metric: f32, active_metric: Option<f32>, margin: f32) -> bool {
    match active_metric {
        Some(active) => candidate_metric - active >= margin - GATE_EPSILON,
        None => true,
    }
}

/// Registry over the manifest table plus the in-memory serving pointer.
pub struct ModelRegistry {
    store: Arc<DiagnosisStore>,
    loader: Box<dyn ModelLoader>,
    active: RwLock<Option<Arc<LoadedRelease>>>,
    /// Previous active release, retained for total-failure fallback.
    last_known_good: RwLock<Option<Arc<LoadedRelease>>>,
    /// Serializes promotion and rollback transitions.
    transition: Mutex<()>,
}

impl ModelRegistry {
    /// Open the registry, loading the active version from the manifest if
    /// one exists.
    pub fn open(
        store: Arc<DiagnosisStore>,
        loader: Box<dyn ModelLoader>,
    ) -> Result<Self, RegistryError> {
        let registry = Self {
            store,
            loader,
            active: RwLock::new(None),
            last_known_good: RwLock::new(None),
            transition: Mutex::new(()),
        };
        if let Some(version) = registry.version_with_status(VersionStatus::Active)? {
            let release = registry.load_release(version.id)?;
            *registry.active.write().unwrap_or_else(|p| p.into_inner()) = Some(Arc::new(release));
        }
        // The most recently retired version backs total-failure fallback
        // across restarts. A corrupt one just forfeits the fallback.
        if let Some(version) = registry.version_with_status(VersionStatus::Retired)? {
            match registry.load_release(version.id) {
                Ok(release) => {
                    *registry
                        .last_known_good
                        .write()
                        .unwrap_or_else(|p| p.into_inner()) = Some(Arc::new(release));
                }
                Err(err) => {
                    tracing::warn!("Retired version {} unavailable as fallback: {err}", version.id);
                }
            }
        }
        Ok(registry)
    }

    /// Immutable snapshot of the serving release, if any. Concurrent
    /// requests each hold their own `Arc` and never observe a partial
    /// swap.
    pub fn snapshot(&self) -> Option<Arc<LoadedRelease>> {
        self.active
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// The previously active release, kept for total-failure fallback.
    pub fn last_known_good(&self) -> Option<Arc<LoadedRelease>> {
        self.last_known_good
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Persist a freshly trained weight set as a candidate.
    pub fn register_candidate(
        &self,
        doc: &WeightSetDoc,
        batch_id: Option<Uuid>,
        now: i64,
    ) -> Result<ModelVersion, RegistryError> {
        let id = Uuid::new_v4();
        let weights_json =
            serde_json::to_string(doc).map_err(StoreError::CorruptDocument)?;
        let conn = self.store.lock();
        conn.execute(
            "INSERT INTO model_versions (id, weights_json, metric, status, created_at, batch_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                id.to_string(),
                weights_json,
                0.0f64,
                VersionStatus::Candidate.as_i64(),
                now,
                batch_id.map(|b| b.to_string()),
            ],
        )?;
        Ok(ModelVersion {
            id,
            metric: 0.0,
            status: VersionStatus::Candidate,
            created_at: now,
            promoted_at: None,
            batch_id,
        })
    }

    /// Record a candidate's validation metric and mark it validated.
    pub fn mark_validated(&self, id: Uuid, metric: f32) -> Result<(), RegistryError> {
        self.transition_status(id, &[VersionStatus::Candidate], VersionStatus::Validated, |tx| {
            tx.execute(
                "UPDATE model_versions SET metric = ?1 WHERE id = ?2",
                params![metric as f64, id.to_string()],
            )?;
            Ok(())
        })
    }

    /// Reject a candidate that failed the promotion gate. Terminal, but
    /// retained for audit.
    pub fn reject(&self, id: Uuid) -> Result<(), RegistryError> {
        self.transition_status(
            id,
            &[VersionStatus::Candidate, VersionStatus::Validated],
            VersionStatus::Rejected,
            |_| Ok(()),
        )
    }

    /// Atomically make a validated version the active one.
    ///
    /// The previous active version is retired (and retained as the
    /// last-known-good fallback). Promoting the already-active version is
    /// a no-op. Callers are expected to have passed [`promotion_gate`].
    pub fn promote(&self, id: Uuid, now: i64) -> Result<(), RegistryError> {
        let _guard = self
            .transition
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let target = self.version(id)?;
        if target.status == VersionStatus::Active {
            return Ok(());
        }
        if !matches!(
            target.status,
            VersionStatus::Validated | VersionStatus::Retired
        ) {
            return Err(RegistryError::InvalidTransition {
                id,
                status: target.status,
                target: VersionStatus::Active,
            });
        }

        // Load before touching the manifest so a corrupt weight document
        // cannot leave the registry without an active version.
        let release = Arc::new(self.load_release(id)?);

        {
            let mut conn = self.store.lock();
            let tx = conn.transaction()?;
            tx.execute(
                "UPDATE model_versions SET status = ?1 WHERE status = ?2",
                params![VersionStatus::Retired.as_i64(), VersionStatus::Active.as_i64()],
            )?;
            tx.execute(
                "UPDATE model_versions SET status = ?1, promoted_at = ?2 WHERE id = ?3",
                params![VersionStatus::Active.as_i64(), now, id.to_string()],
            )?;
            tx.commit()?;
        }

        let previous = {
            let mut active = self.active.write().unwrap_or_else(|p| p.into_inner());
            std::mem::replace(&mut *active, Some(release))
        };
        if let Some(previous) = previous {
            let mut known_good = self
                .last_known_good
                .write()
                .unwrap_or_else(|p| p.into_inner());
            *known_good = Some(previous);
        }
        tracing::info!("Model version {id} promoted to active");
        Ok(())
    }

    /// Operator-triggered rollback to a retired or validated version.
    /// Uses the same atomic swap path as promotion.
    pub fn rollback(
        &self,
        id: Uuid,
        ctx: &OperatorContext,
        now: i64,
    ) -> Result<(), RegistryError> {
        tracing::warn!("Rollback to version {id} requested by {}", ctx.operator);
        self.promote(id, now)
    }

    /// Fetch a manifest row.
    pub fn version(&self, id: Uuid) -> Result<ModelVersion, RegistryError> {
        let conn = self.store.lock();
        conn.query_row(
            "SELECT id, metric, status, created_at, promoted_at, batch_id
             FROM model_versions WHERE id = ?1",
            params![id.to_string()],
            row_to_version,
        )
        .optional()?
        .ok_or(RegistryError::NotFound(id))
    }

    /// All manifest rows, oldest first. Nothing is ever deleted.
    pub fn versions(&self) -> Result<Vec<ModelVersion>, RegistryError> {
        let conn = self.store.lock();
        let mut statement = conn.prepare(
            "SELECT id, metric, status, created_at, promoted_at, batch_id
             FROM model_versions ORDER BY created_at ASC, id ASC",
        )?;
        let rows = statement.query_map([], row_to_version)?;
        Ok(rows.filter_map(|row| row.ok()).collect())
    }

    /// Introspection snapshot for operational tooling.
    pub fn status(&self) -> Result<RegistryStatus, RegistryError> {
        let versions = self.versions()?;
        let summarize = |v: &ModelVersion| VersionSummary {
            id: v.id,
            metric: v.metric,
            status: v.status,
            created_at: v.created_at,
        };
        Ok(RegistryStatus {
            active: versions
                .iter()
                .find(|v| v.status == VersionStatus::Active)
                .map(summarize),
            candidates: versions
                .iter()
                .filter(|v| {
                    matches!(v.status, VersionStatus::Candidate | VersionStatus::Validated)
                })
                .map(summarize)
                .collect(),
            rejected: versions
                .iter()
                .filter(|v| v.status == VersionStatus::Rejected)
                .map(summarize)
                .collect(),
            retired: versions
                .iter()
                .filter(|v| v.status == VersionStatus::Retired)
                .map(summarize)
                .collect(),
        })
    }

    /// Record a training batch snapshot for audit/reproducibility.
    pub fn record_batch(
        &self,
        record_count: u64,
        last_record_id: i64,
        now: i64,
    ) -> Result<Uuid, RegistryError> {
        let id = Uuid::new_v4();
        let conn = self.store.lock();
        conn.execute(
            "INSERT INTO training_batches (id, created_at, record_count, last_record_id)
             VALUES (?1, ?2, ?3, ?4)",
            params![id.to_string(), now, record_count as i64, last_record_id],
        )?;
        Ok(id)
    }

    /// Feedback high-water mark of the most recent training batch.
    pub fn last_batch_record_id(&self) -> Result<i64, RegistryError> {
        let conn = self.store.lock();
        let max: Option<i64> = conn.query_row(
            "SELECT last_record_id FROM training_batches ORDER BY created_at DESC, id DESC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .optional()?;
        Ok(max.unwrap_or(0))
    }

    fn version_with_status(
        &self,
        status: VersionStatus,
    ) -> Result<Option<ModelVersion>, RegistryError> {
        let conn = self.store.lock();
        let version = conn
            .query_row(
                "SELECT id, metric, status, created_at, promoted_at, batch_id
                 FROM model_versions WHERE status = ?1
                 ORDER BY promoted_at DESC, created_at DESC LIMIT 1",
                params![status.as_i64()],
                row_to_version,
            )
            .optional()?;
        Ok(version)
    }

    fn load_release(&self, id: Uuid) -> Result<LoadedRelease, RegistryError> {
        let (version, weights_json) = {
            let conn = self.store.lock();
            let row = conn
                .query_row(
                    "SELECT id, metric, status, created_at, promoted_at, batch_id, weights_json
                     FROM model_versions WHERE id = ?1",
                    params![id.to_string()],
                    |row| Ok((row_to_version(row)?, row.get::<_, String>(6)?)),
                )
                .optional()?;
            row.ok_or(RegistryError::NotFound(id))?
        };
        self.loader.load(&version, &weights_json)
    }

    fn transition_status(
        &self,
        id: Uuid,
        allowed_from: &[VersionStatus],
        to: VersionStatus,
        extra: impl FnOnce(&rusqlite::Transaction<'_>) -> Result<(), RegistryError>,
    ) -> Result<(), RegistryError> {
        let current = self.version(id)?;
        if !allowed_from.contains(&current.status) {
            return Err(RegistryError::InvalidTransition {
                id,
                status: current.status,
                target: to,
            });
        }
        let mut conn = self.store.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE model_versions SET status = ?1 WHERE id = ?2",
            params![to.as_i64(), id.to_string()],
        )?;
        extra(&tx)?;
        tx.commit()?;
        Ok(())
    }
}

fn row_to_version(row: &rusqlite::Row<'_>) -> rusqlite::Result<ModelVersion> {
    let id: String = row.get(0)?;
    let batch_id: Option<String> = row.get(5)?;
    Ok(ModelVersion {
        id: Uuid::parse_str(&id).unwrap_or_default(),
        metric: row.get::<_, f64>(1)? as f32,
        status: VersionStatus::from_i64(row.get(2)?),
        created_at: row.get(3)?,
        promoted_at: row.get(4)?,
        batch_id: batch_id.and_then(|b| Uuid::parse_str(&b).ok()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::features::{FEAT_VERSION, FEATURE_LEN};
    use crate::inference::stump::StumpSplit;

    fn weight_doc(bias_class: usize) -> WeightSetDoc {
        let classes = vec!["a___x".to_string(), "b___y".to_string()];
        let mut init_raw = vec![0.0; 2];
        init_raw[bias_class] = 2.0;
        WeightSetDoc {
            taxonomy_version: 1,
            members: vec![MemberDoc {
                model: StumpModel {
                    model_version: 1,
                    feat_version: FEAT_VERSION,
                    feature_len: FEATURE_LEN,
                    classes,
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
                },
                validation_accuracy: 0.8,
            }],
            calibration: IsotonicCalibrator::identity(),
        }
    }

    fn registry() -> ModelRegistry {
        let store = Arc::new(DiagnosisStore::open_in_memory().unwrap());
        ModelRegistry::open(store, Box::new(StumpLoader)).unwrap()
    }

    #[test]
    fn gate_requires_margin_and_is_deterministic() {
        assert!(promotion_gate(0.91, Some(0.88), 0.02));
        assert!(!promotion_gate(0.89, Some(0.88), 0.02));
        // Exactly at the margin promotes, even when the f32 difference
        // lands an ulp below it.
        assert!(promotion_gate(0.90, Some(0.88), 0.02));
        assert!(!promotion_gate(0.9199, Some(0.90), 0.02));
        assert!(promotion_gate(0.5, None, 0.02));
        for _ in 0..10 {
            assert!(promotion_gate(0.91, Some(0.88), 0.02));
        }
    }

    #[test]
    fn candidate_lifecycle_to_active_retires_predecessor() {
        let registry = registry();
        let first = registry
            .register_candidate(&weight_doc(0), None, 100)
            .unwrap();
        registry.mark_validated(first.id, 0.88).unwrap();
        registry.promote(first.id, 110).unwrap();
        assert_eq!(registry.snapshot().unwrap().version.id, first.id);

        let second = registry
            .register_candidate(&weight_doc(1), None, 200)
            .unwrap();
        registry.mark_validated(second.id, 0.91).unwrap();
        registry.promote(second.id, 210).unwrap();

        assert_eq!(registry.snapshot().unwrap().version.id, second.id);
        assert_eq!(
            registry.version(first.id).unwrap().status,
            VersionStatus::Retired
        );
        // Predecessor stays queryable and serves as the fallback.
        assert_eq!(registry.last_known_good().unwrap().version.id, first.id);

        let active_count = registry
            .versions()
            .unwrap()
            .iter()
            .filter(|v| v.status == VersionStatus::Active)
            .count();
        assert_eq!(active_count, 1);
    }

    #[test]
    fn promoting_the_active_version_is_a_no_op() {
        let registry = registry();
        let version = registry
            .register_candidate(&weight_doc(0), None, 100)
            .unwrap();
        registry.mark_validated(version.id, 0.9).unwrap();
        registry.promote(version.id, 110).unwrap();
        registry.promote(version.id, 120).unwrap();
        assert_eq!(
            registry.version(version.id).unwrap().status,
            VersionStatus::Active
        );
    }

    #[test]
    fn rejecting_a_candidate_is_terminal_but_queryable() {
        let registry = registry();
        let version = registry
            .register_candidate(&weight_doc(0), None, 100)
            .unwrap();
        registry.reject(version.id).unwrap();
        assert_eq!(
            registry.version(version.id).unwrap().status,
            VersionStatus::Rejected
        );
        let err = registry.promote(version.id, 110).unwrap_err();
        assert!(matches!(err, RegistryError::InvalidTransition { .. }));
        assert_eq!(registry.status().unwrap().rejected.len(), 1);
    }

    #[test]
    fn rollback_reactivates_a_retired_version() {
        let registry = registry();
        let first = registry
            .register_candidate(&weight_doc(0), None, 100)
            .unwrap();
        registry.mark_validated(first.id, 0.88).unwrap();
        registry.promote(first.id, 110).unwrap();
        let second = registry
            .register_candidate(&weight_doc(1), None, 200)
            .unwrap();
        registry.mark_validated(second.id, 0.91).unwrap();
        registry.promote(second.id, 210).unwrap();

        let ctx = OperatorContext {
            operator: "ops-on-call".to_string(),
        };
        registry.rollback(first.id, &ctx, 300).unwrap();
        assert_eq!(registry.snapshot().unwrap().version.id, first.id);
        assert_eq!(
            registry.version(second.id).unwrap().status,
            VersionStatus::Retired
        );
    }

    #[test]
    fn reopening_restores_the_active_release() {
        let dir = tempfile::tempdir().unwrap();
        let id = {
            let store = Arc::new(DiagnosisStore::open(dir.path()).unwrap());
            let registry = ModelRegistry::open(store, Box::new(StumpLoader)).unwrap();
            let version = registry
                .register_candidate(&weight_doc(0), None, 100)
                .unwrap();
            registry.mark_validated(version.id, 0.9).unwrap();
            registry.promote(version.id, 110).unwrap();
            version.id
        };
        let store = Arc::new(DiagnosisStore::open(dir.path()).unwrap());
        let registry = ModelRegistry::open(store, Box::new(StumpLoader)).unwrap();
        assert_eq!(registry.snapshot().unwrap().version.id, id);
    }

    #[test]
    fn reopening_restores_the_fallback_release() {
        let dir = tempfile::tempdir().unwrap();
        let (first_id, second_id) = {
            let store = Arc::new(DiagnosisStore::open(dir.path()).unwrap());
            let registry = ModelRegistry::open(store, Box::new(StumpLoader)).unwrap();
            let first = registry
                .register_candidate(&weight_doc(0), None, 100)
                .unwrap();
            registry.mark_validated(first.id, 0.88).unwrap();
            registry.promote(first.id, 110).unwrap();
            let second = registry
                .register_candidate(&weight_doc(1), None, 200)
                .unwrap();
            registry.mark_validated(second.id, 0.91).unwrap();
            registry.promote(second.id, 210).unwrap();
            (first.id, second.id)
        };
        let store = Arc::new(DiagnosisStore::open(dir.path()).unwrap());
        let registry = ModelRegistry::open(store, Box::new(StumpLoader)).unwrap();
        assert_eq!(registry.snapshot().unwrap().version.id, second_id);
        assert_eq!(registry.last_known_good().unwrap().version.id, first_id);
    }

    #[test]
    fn batches_are_recorded_with_a_high_water_mark() {
        let registry = registry();
        assert_eq!(registry.last_batch_record_id().unwrap(), 0);
        registry.record_batch(50, 50, 100).unwrap();
        registry.record_batch(30, 80, 200).unwrap();
        assert_eq!(registry.last_batch_record_id().unwrap(), 80);
    }
}
