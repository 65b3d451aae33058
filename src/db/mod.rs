pub mod models;
pub mod queries;

use rusqlite::Connection;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration failed: {0}")]
    Migration(String),
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Track does not belong under cache key {0}")]
    KeyMismatch(String),
    #[error("Track rejected: {0}")]
    InvalidTrack(#[from] crate::pose::TrackError),
    #[error("Database lock poisoned")]
    Poisoned,
}

pub type Result<T> = std::result::Result<T, DbError>;

/// Schema version written to `PRAGMA user_version`.
const SCHEMA_VERSION: i32 = 1;

pub struct Database {
    pub conn: Connection,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(path)?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        // WAL mode so readers in other processes never block on a write
        self.conn.pragma_update(None, "journal_mode", "WAL")?;
        self.conn.pragma_update(None, "synchronous", "NORMAL")?;
        self.conn.busy_timeout(std::time::Duration::from_secs(5))?;
        self.migrate()?;
        Ok(())
    }

    fn migrate(&self) -> Result<()> {
        let version: i32 = self
            .conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap_or(0);

        if version > SCHEMA_VERSION {
            return Err(DbError::Migration(format!(
                "database schema v{version} is newer than this build (v{SCHEMA_VERSION})"
            )));
        }
        if version < 1 {
            self.migrate_v1()?;
        }

        self.conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        Ok(())
    }

    /// V1: one row per (content hash, model), full track stored as JSON.
    fn migrate_v1(&self) -> Result<()> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS pose_tracks (
                content_hash        TEXT NOT NULL,
                model_id            TEXT NOT NULL,

                -- Copied out of the track metadata for listing without parsing
                model_version       TEXT NOT NULL DEFAULT '',
                format_version      TEXT NOT NULL,
                source_video_name   TEXT NOT NULL DEFAULT '',
                frame_count         INTEGER NOT NULL,
                fps                 REAL,
                duration_secs       REAL,
                extracted_at        TEXT NOT NULL,

                track_json          TEXT NOT NULL,
                stored_at           TEXT NOT NULL DEFAULT (datetime('now')),

                PRIMARY KEY (content_hash, model_id)
            );

            CREATE INDEX IF NOT EXISTS idx_pose_tracks_model ON pose_tracks(model_id);
            ",
        )?;
        Ok(())
    }
}
