use super::models::GuideChunk;
use super::{Database, DbResult};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::collections::HashMap;

/// Chunk ready to be written: text plus its embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct NewChunk {
    pub block_id: Option<String>,
    pub content: String,
    pub embedding: Vec<f32>,
}

/// Stored chunk including its decoded vector, as read for similarity search.
#[derive(Debug, Clone)]
pub struct ChunkRow {
    pub id: String,
    pub guide_id: String,
    pub block_id: Option<String>,
    pub content: String,
    pub embedding: Vec<f32>,
    pub created_at: DateTime<Utc>,
}

/// Serialize embedding to bytes for SQLite BLOB storage
pub fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
}

/// Deserialize embedding from SQLite BLOB bytes
pub fn bytes_to_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

pub(crate) fn insert(conn: &Connection, guide_id: &str, chunk: &NewChunk) -> DbResult<String> {
    let id = uuid::Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO guide_embeddings (id, guide_id, block_id, content, embedding, dimensions, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            id,
            guide_id,
            chunk.block_id,
            chunk.content,
            embedding_to_bytes(&chunk.embedding),
            chunk.embedding.len() as i64,
            Utc::now()
        ],
    )?;
    Ok(id)
}

pub(crate) fn delete_for_block(conn: &Connection, block_id: &str) -> DbResult<usize> {
    Ok(conn.execute(
        "DELETE FROM guide_embeddings WHERE block_id = ?1",
        params![block_id],
    )?)
}

/// Delete-then-insert per block: prior chunks of every block present in
/// `chunks` are removed once, chunks of other blocks are left alone.
pub(crate) fn write_all(conn: &Connection, guide_id: &str, chunks: &[NewChunk]) -> DbResult<Vec<String>> {
    let mut cleared: Vec<&str> = Vec::new();
    let mut ids = Vec::with_capacity(chunks.len());
    for chunk in chunks {
        if let Some(block_id) = chunk.block_id.as_deref() {
            if !cleared.contains(&block_id) {
                delete_for_block(conn, block_id)?;
                cleared.push(block_id);
            }
        }
        ids.push(insert(conn, guide_id, chunk)?);
    }
    Ok(ids)
}

impl Database {
    // ── Guide embeddings ──

    pub fn upsert_chunks(&self, guide_id: &str, chunks: &[NewChunk]) -> DbResult<Vec<String>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let ids = write_all(&tx, guide_id, chunks)?;
        tx.commit()?;
        Ok(ids)
    }

    pub fn delete_chunks_for_block(&self, block_id: &str) -> DbResult<usize> {
        let conn = self.conn()?;
        delete_for_block(&conn, block_id)
    }

    pub fn delete_chunks_for_guide(&self, guide_id: &str) -> DbResult<usize> {
        let conn = self.conn()?;
        Ok(conn.execute(
            "DELETE FROM guide_embeddings WHERE guide_id = ?1",
            params![guide_id],
        )?)
    }

    pub fn list_chunks(&self, guide_id: &str) -> DbResult<Vec<GuideChunk>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, guide_id, block_id, content, created_at FROM guide_embeddings
             WHERE guide_id = ?1 ORDER BY created_at ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![guide_id], |row| {
            Ok(GuideChunk {
                id: row.get(0)?,
                guide_id: row.get(1)?,
                block_id: row.get(2)?,
                content: row.get(3)?,
                created_at: row.get(4)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Every chunk of one guide with its vector. Always filtered by guide.
    pub fn chunk_rows(&self, guide_id: &str) -> DbResult<Vec<ChunkRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, guide_id, block_id, content, embedding, created_at FROM guide_embeddings
             WHERE guide_id = ?1",
        )?;
        let rows = stmt.query_map(params![guide_id], |row| {
            let bytes: Vec<u8> = row.get(4)?;
            Ok(ChunkRow {
                id: row.get(0)?,
                guide_id: row.get(1)?,
                block_id: row.get(2)?,
                content: row.get(3)?,
                embedding: bytes_to_embedding(&bytes),
                created_at: row.get(5)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Stored chunk text keyed by block id, used to skip re-embedding
    /// blocks whose text did not change.
    pub fn chunk_texts_by_block(&self, guide_id: &str) -> DbResult<HashMap<String, String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT block_id, content FROM guide_embeddings
             WHERE guide_id = ?1 AND block_id IS NOT NULL
             ORDER BY created_at ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![guide_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut texts: HashMap<String, String> = HashMap::new();
        for row in rows {
            let (block_id, content) = row?;
            texts
                .entry(block_id)
                .and_modify(|existing| {
                    existing.push('\n');
                    existing.push_str(&content);
                })
                .or_insert(content);
        }
        Ok(texts)
    }
}
