//! SQLite-backed persistence for media metadata and link previews

use std::path::Path;

use parking_lot::{Mutex, MutexGuard};
use rusqlite::Connection;
use tracing::info;

use crate::Result;

mod media;
mod url_preview;

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS media_repository (
    media_id TEXT NOT NULL,
    media_origin TEXT NOT NULL,
    content_type TEXT NOT NULL,
    file_size INTEGER NOT NULL,
    upload_name TEXT NOT NULL,
    base64hash TEXT NOT NULL,
    user_id TEXT NOT NULL,
    creation_ts INTEGER NOT NULL,
    quarantined INTEGER NOT NULL DEFAULT 0,
    quarantined_at INTEGER,
    quarantined_by TEXT,
    quarantine_reason TEXT,
    UNIQUE (media_id, media_origin)
);
CREATE INDEX IF NOT EXISTS media_repository_user_id
    ON media_repository (user_id);

CREATE TABLE IF NOT EXISTS thumbnails (
    media_id TEXT NOT NULL,
    media_origin TEXT NOT NULL,
    width INTEGER NOT NULL,
    height INTEGER NOT NULL,
    resize_method TEXT NOT NULL,
    content_type TEXT NOT NULL,
    file_size INTEGER NOT NULL,
    base64hash TEXT NOT NULL,
    creation_ts INTEGER NOT NULL,
    quarantined INTEGER NOT NULL DEFAULT 0,
    quarantined_at INTEGER,
    quarantined_by TEXT,
    quarantine_reason TEXT,
    UNIQUE (media_id, media_origin, width, height, resize_method)
);

CREATE TABLE IF NOT EXISTS url_previews (
    url_hash TEXT PRIMARY KEY NOT NULL,
    url TEXT NOT NULL,
    preview TEXT NOT NULL,
    creation_ts INTEGER NOT NULL
);
";

/// Metadata database
///
/// Every query goes through one connection, so writes are serialized.
pub(crate) struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Opens or creates the database at `path`
    #[tracing::instrument]
    pub(crate) fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            ",
        )?;

        info!("Opened database");
        Self::init(conn)
    }

    /// Opens a fresh database that lives only as long as the returned value
    #[cfg(test)]
    pub(crate) fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::Database;

    #[test]
    fn schema_is_idempotent() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let path = dir.path().join("nested").join("media.db");

        drop(Database::open(&path).expect("first open should succeed"));
        Database::open(&path).expect("reopening should keep the schema");
    }
}
