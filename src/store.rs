//! SQLite persistence owned by the diagnosis core.
//!
//! One database file holds everything the core is responsible for: review
//! cases, expert labels, the feedback corpus, the model-version manifest
//! and training-batch snapshots. All other persistence (accounts, chat,
//! advisory content) belongs to external collaborators.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use image::RgbImage;
use rusqlite::Connection;
use thiserror::Error;

/// Filename used when a directory rather than a file path is supplied.
pub const DB_FILE_NAME: &str = "kropscan_core.db";

/// Errors returned when accessing the core database.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database query failed: {0}")]
    Sql(#[from] rusqlite::Error),
    #[error("Could not create database directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Could not encode retained image: {0}")]
    ImageEncode(image::ImageError),
    #[error("Could not decode retained image: {0}")]
    ImageDecode(image::ImageError),
    #[error("Stored JSON document is corrupt: {0}")]
    CorruptDocument(serde_json::Error),
}

/// Shared handle to the core SQLite database.
///
/// The connection is guarded by a mutex; callers take short transactions
/// through [`DiagnosisStore::lock`]. Schema is created on open and every
/// open applies WAL pragmas.
pub struct DiagnosisStore {
    conn: Mutex<Connection>,
}

impl DiagnosisStore {
    /// Open (or create) the database inside `dir`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir).map_err(|source| StoreError::CreateDir {
            path: dir.to_path_buf(),
            source,
        })?;
        let conn = Connection::open(dir.join(DB_FILE_NAME))?;
        Self::from_connection(conn)
    }

    /// Open a private in-memory database (tests and ephemeral tooling).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        apply_pragmas(&conn)?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Take the connection lock. Poisoning is ignored: SQLite state stays
    /// consistent because every mutation runs inside its own transaction.
    pub(crate) fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn apply_pragmas(conn: &Connection) -> Result<(), StoreError> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    Ok(())
}

fn init_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS review_cases (
            id TEXT PRIMARY KEY,
            image BLOB NOT NULL,
            captured_at INTEGER NOT NULL,
            submitter TEXT NOT NULL,
            predicted_class INTEGER NOT NULL,
            probabilities TEXT NOT NULL,
            raw_confidence REAL NOT NULL,
            calibrated_confidence REAL NOT NULL,
            quality_score REAL NOT NULL,
            status INTEGER NOT NULL DEFAULT 0,
            assigned_to TEXT,
            created_at INTEGER NOT NULL,
            resolved_at INTEGER
        );
        CREATE INDEX IF NOT EXISTS idx_review_pending
            ON review_cases (status, calibrated_confidence, created_at);
        CREATE TABLE IF NOT EXISTS expert_labels (
            case_id TEXT PRIMARY KEY REFERENCES review_cases (id),
            class_index INTEGER NOT NULL,
            expert TEXT NOT NULL,
            created_at INTEGER NOT NULL
        );
        CREATE TABLE IF NOT EXISTS feedback_records (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            image BLOB NOT NULL,
            class_index INTEGER NOT NULL,
            source INTEGER NOT NULL,
            case_id TEXT,
            created_at INTEGER NOT NULL
        );
        CREATE TABLE IF NOT EXISTS model_versions (
            id TEXT PRIMARY KEY,
            weights_json TEXT NOT NULL,
            metric REAL NOT NULL,
            status INTEGER NOT NULL,
            created_at INTEGER NOT NULL,
            promoted_at INTEGER,
            batch_id TEXT
        );
        CREATE TABLE IF NOT EXISTS training_batches (
            id TEXT PRIMARY KEY,
            created_at INTEGER NOT NULL,
            record_count INTEGER NOT NULL,
            last_record_id INTEGER NOT NULL
        );",
    )?;
    Ok(())
}

/// Current wall-clock time as unix epoch seconds.
pub fn now_epoch_seconds() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Encode a retained image as PNG bytes for blob storage.
pub fn encode_png(image: &RgbImage) -> Result<Vec<u8>, StoreError> {
    let mut bytes = Vec::new();
    image
        .write_to(
            &mut std::io::Cursor::new(&mut bytes),
            image::ImageFormat::Png,
        )
        .map_err(StoreError::ImageEncode)?;
    Ok(bytes)
}

/// Decode a stored PNG blob back into an RGB image.
pub fn decode_png(bytes: &[u8]) -> Result<RgbImage, StoreError> {
    let decoded = image::load_from_memory_with_format(bytes, image::ImageFormat::Png)
        .map_err(StoreError::ImageDecode)?;
    Ok(decoded.into_rgb8())
}
