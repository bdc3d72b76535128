//! Database connection management.
//!
//! The [`Database`] struct owns a [`rusqlite::Connection`] and guarantees
//! that migrations have run before any other operation. Writes are short
//! transactions serialized by the single connection.

use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use rusqlite::Connection;

use crate::error::{Result, StoreError};
use crate::migrations;

/// Wrapper around a [`rusqlite::Connection`].
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open (or create) the default message database in the platform data
    /// directory.
    ///
    /// # Arguments
    /// * `_db_key` -- reserved for SQLCipher support; derived from the
    ///   local identity.
    pub fn new(_db_key: &[u8; 32]) -> Result<Self> {
        let project_dirs =
            ProjectDirs::from("io", "bitdust", "bitdust").ok_or(StoreError::NoDataDir)?;

        let data_dir = project_dirs.data_dir();
        std::fs::create_dir_all(data_dir)?;

        let db_path = data_dir.join("messages.sqlite");

        tracing::info!(path = %db_path.display(), "opening message database");

        Self::open_at(&db_path, _db_key)
    }

    /// Open (or create) a database at an explicit path. Used by tests and
    /// custom data-dir layouts.
    pub fn open_at(path: &Path, _db_key: &[u8; 32]) -> Result<Self> {
        let conn = Connection::open(path)?;

        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        migrations::run_migrations(&conn)?;

        Ok(Self { conn })
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        migrations::run_migrations(&conn)?;
        Ok(Self { conn })
    }

    /// Prefer the typed helpers; direct access is for transactions and
    /// ad-hoc queries.
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn conn_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    pub fn path(&self) -> Option<PathBuf> {
        self.conn.path().map(PathBuf::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.sqlite");
        let key = [0xABu8; 32];

        let db = Database::open_at(&path, &key).expect("should open");
        assert!(db.path().is_some());
    }

    #[test]
    fn in_memory_open() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.path().is_none() || db.path().is_some());
        let _ = db.conn();
    }
}
