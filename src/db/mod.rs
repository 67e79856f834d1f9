pub mod models;

mod chunks;
mod conversations;
mod guides;
mod licenses;

pub use chunks::{bytes_to_embedding, embedding_to_bytes, ChunkRow, NewChunk};
pub use guides::{BlockWrite, GuidePatch, NewGuide};

use rusqlite::{Connection, Row};
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("JSON encode error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("database lock poisoned")]
    Poisoned,
}

impl DbError {
    /// True when the statement failed on a UNIQUE or PRIMARY KEY constraint.
    pub fn is_unique_violation(&self) -> bool {
        match self {
            DbError::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.extended_code,
                rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE | rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
            ),
            _ => false,
        }
    }
}

pub type DbResult<T> = std::result::Result<T, DbError>;

pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn new(data_dir: &Path) -> DbResult<Self> {
        std::fs::create_dir_all(data_dir).ok();
        let conn = Connection::open(data_dir.join("roomy.db"))?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> DbResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> DbResult<Self> {
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        Ok(db)
    }

    pub(crate) fn conn(&self) -> DbResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| DbError::Poisoned)
    }

    fn migrate(&self) -> DbResult<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA foreign_keys=ON;

            CREATE TABLE IF NOT EXISTS guides (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                slug TEXT NOT NULL UNIQUE,
                title TEXT NOT NULL,
                accommodation_name TEXT,
                is_published INTEGER NOT NULL DEFAULT 0,
                theme_id TEXT,
                theme_settings TEXT NOT NULL DEFAULT '{}',
                ai_enabled INTEGER NOT NULL DEFAULT 1,
                ai_instructions TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_guides_user ON guides(user_id, created_at);

            CREATE TABLE IF NOT EXISTS blocks (
                id TEXT PRIMARY KEY,
                guide_id TEXT NOT NULL,
                type TEXT NOT NULL CHECK (type IN
                    ('hero', 'quick_info', 'amenities', 'map', 'host_pick', 'notice', 'gallery')),
                order_index INTEGER NOT NULL,
                content TEXT NOT NULL,
                is_visible INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE (guide_id, order_index),
                FOREIGN KEY (guide_id) REFERENCES guides(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS guide_embeddings (
                id TEXT PRIMARY KEY,
                guide_id TEXT NOT NULL,
                block_id TEXT,
                content TEXT NOT NULL,
                embedding BLOB NOT NULL,
                dimensions INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                FOREIGN KEY (guide_id) REFERENCES guides(id) ON DELETE CASCADE,
                FOREIGN KEY (block_id) REFERENCES blocks(id) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_embeddings_guide ON guide_embeddings(guide_id);
            CREATE INDEX IF NOT EXISTS idx_embeddings_block ON guide_embeddings(block_id);

            CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                guide_id TEXT NOT NULL,
                session_id TEXT NOT NULL,
                role TEXT NOT NULL CHECK (role IN ('user', 'assistant')),
                content TEXT NOT NULL,
                metadata TEXT,
                created_at TEXT NOT NULL,
                FOREIGN KEY (guide_id) REFERENCES guides(id) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_conversations_session
                ON conversations(guide_id, session_id, created_at);

            CREATE TABLE IF NOT EXISTS licenses (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                license_key TEXT NOT NULL UNIQUE,
                plan TEXT NOT NULL CHECK (plan IN ('free', 'monthly', 'biannual', 'annual')),
                status TEXT NOT NULL CHECK (status IN ('active', 'expired')),
                features TEXT NOT NULL,
                started_at TEXT NOT NULL,
                expires_at TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_licenses_user ON licenses(user_id, status, created_at);
            ",
        )?;
        Ok(())
    }
}

/// Reads a TEXT column holding JSON into a typed value.
pub(crate) fn json_column<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}
