use super::chunks::{self, NewChunk};
use super::models::{Block, BlockType, Guide};
use super::{json_column, Database, DbResult};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};

const GUIDE_COLUMNS: &str = "id, user_id, slug, title, accommodation_name, is_published, theme_id, \
     theme_settings, ai_enabled, ai_instructions, created_at, updated_at";

const BLOCK_COLUMNS: &str =
    "id, guide_id, type, order_index, content, is_visible, created_at, updated_at";

#[derive(Debug, Clone)]
pub struct NewGuide {
    pub user_id: String,
    pub slug: String,
    pub title: String,
    pub accommodation_name: Option<String>,
}

/// Partial guide update; `None` leaves the column untouched. For nullable
/// columns `Some(None)` clears the value.
#[derive(Debug, Clone, Default)]
pub struct GuidePatch {
    pub title: Option<String>,
    pub accommodation_name: Option<Option<String>>,
    pub theme_id: Option<Option<String>>,
    pub theme_settings: Option<serde_json::Value>,
    pub ai_enabled: Option<bool>,
    pub ai_instructions: Option<Option<String>>,
}

/// One block of a full-list save. Its position in the list is its order.
#[derive(Debug, Clone)]
pub struct BlockWrite {
    pub id: String,
    pub block_type: BlockType,
    pub content: serde_json::Value,
    pub is_visible: bool,
}

fn guide_from_row(row: &Row<'_>) -> rusqlite::Result<Guide> {
    Ok(Guide {
        id: row.get(0)?,
        user_id: row.get(1)?,
        slug: row.get(2)?,
        title: row.get(3)?,
        accommodation_name: row.get(4)?,
        is_published: row.get(5)?,
        theme_id: row.get(6)?,
        theme_settings: json_column(row, 7)?,
        ai_enabled: row.get(8)?,
        ai_instructions: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

fn block_from_row(row: &Row<'_>) -> rusqlite::Result<Block> {
    Ok(Block {
        id: row.get(0)?,
        guide_id: row.get(1)?,
        block_type: row.get(2)?,
        order_index: row.get(3)?,
        content: json_column(row, 4)?,
        is_visible: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

fn query_guide(conn: &Connection, clause: &str, value: &str) -> DbResult<Option<Guide>> {
    let sql = format!("SELECT {GUIDE_COLUMNS} FROM guides WHERE {clause} = ?1");
    Ok(conn
        .query_row(&sql, params![value], guide_from_row)
        .optional()?)
}

impl Database {
    // ── Guides ──

    pub fn create_guide(&self, new: &NewGuide) -> DbResult<Guide> {
        let conn = self.conn()?;
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        conn.execute(
            "INSERT INTO guides (id, user_id, slug, title, accommodation_name, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
            params![id, new.user_id, new.slug, new.title, new.accommodation_name, now],
        )?;
        Ok(conn.query_row(
            &format!("SELECT {GUIDE_COLUMNS} FROM guides WHERE id = ?1"),
            params![id],
            guide_from_row,
        )?)
    }

    pub fn get_guide(&self, id: &str) -> DbResult<Option<Guide>> {
        let conn = self.conn()?;
        query_guide(&conn, "id", id)
    }

    pub fn get_guide_by_slug(&self, slug: &str) -> DbResult<Option<Guide>> {
        let conn = self.conn()?;
        query_guide(&conn, "slug", slug)
    }

    pub fn slug_exists(&self, slug: &str) -> DbResult<bool> {
        let conn = self.conn()?;
        let found: Option<i64> = conn
            .query_row("SELECT 1 FROM guides WHERE slug = ?1", params![slug], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(found.is_some())
    }

    pub fn list_guides(&self, user_id: &str) -> DbResult<Vec<Guide>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {GUIDE_COLUMNS} FROM guides WHERE user_id = ?1 ORDER BY created_at DESC"
        ))?;
        let rows = stmt.query_map(params![user_id], guide_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn count_guides(&self, user_id: &str) -> DbResult<i64> {
        let conn = self.conn()?;
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM guides WHERE user_id = ?1",
            params![user_id],
            |row| row.get(0),
        )?)
    }

    pub fn update_guide(&self, id: &str, patch: &GuidePatch) -> DbResult<Option<Guide>> {
        let conn = self.conn()?;
        let theme_settings = patch
            .theme_settings
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        conn.execute(
            "UPDATE guides SET
                title = COALESCE(?1, title),
                accommodation_name = CASE WHEN ?2 THEN ?3 ELSE accommodation_name END,
                theme_id = CASE WHEN ?4 THEN ?5 ELSE theme_id END,
                theme_settings = COALESCE(?6, theme_settings),
                ai_enabled = COALESCE(?7, ai_enabled),
                ai_instructions = CASE WHEN ?8 THEN ?9 ELSE ai_instructions END,
                updated_at = ?10
             WHERE id = ?11",
            params![
                patch.title,
                patch.accommodation_name.is_some(),
                patch.accommodation_name.clone().flatten(),
                patch.theme_id.is_some(),
                patch.theme_id.clone().flatten(),
                theme_settings,
                patch.ai_enabled,
                patch.ai_instructions.is_some(),
                patch.ai_instructions.clone().flatten(),
                Utc::now(),
                id
            ],
        )?;
        query_guide(&conn, "id", id)
    }

    /// Returns false when no guide has this id.
    pub fn set_published(&self, id: &str, published: bool) -> DbResult<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE guides SET is_published = ?1, updated_at = ?2 WHERE id = ?3",
            params![published, Utc::now(), id],
        )?;
        Ok(changed > 0)
    }

    /// Deletes the guide; blocks, embeddings and conversations cascade.
    pub fn delete_guide(&self, id: &str) -> DbResult<bool> {
        let conn = self.conn()?;
        let changed = conn.execute("DELETE FROM guides WHERE id = ?1", params![id])?;
        Ok(changed > 0)
    }

    // ── Blocks ──

    pub fn list_blocks(&self, guide_id: &str) -> DbResult<Vec<Block>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {BLOCK_COLUMNS} FROM blocks WHERE guide_id = ?1 ORDER BY order_index ASC"
        ))?;
        let rows = stmt.query_map(params![guide_id], block_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Replaces the guide's block list and applies the matching embedding
    /// changes in one transaction. Blocks are renumbered 0..N-1 by position;
    /// blocks missing from `blocks` are deleted together with their chunks.
    pub fn replace_blocks(
        &self,
        guide_id: &str,
        blocks: &[BlockWrite],
        new_chunks: &[NewChunk],
        cleared_blocks: &[String],
    ) -> DbResult<Vec<Block>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let now = Utc::now();

        // Park existing orders below zero so renumbering cannot trip UNIQUE(guide_id, order_index).
        tx.execute(
            "UPDATE blocks SET order_index = -order_index - 1 WHERE guide_id = ?1",
            params![guide_id],
        )?;

        let keep: Vec<&str> = blocks.iter().map(|b| b.id.as_str()).collect();
        {
            let mut existing = tx.prepare("SELECT id FROM blocks WHERE guide_id = ?1")?;
            let ids = existing
                .query_map(params![guide_id], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            for id in ids.iter().filter(|id| !keep.contains(&id.as_str())) {
                tx.execute("DELETE FROM blocks WHERE id = ?1", params![id])?;
            }
        }

        for (order, block) in blocks.iter().enumerate() {
            tx.execute(
                "INSERT INTO blocks (id, guide_id, type, order_index, content, is_visible, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
                 ON CONFLICT(id) DO UPDATE SET
                    type = excluded.type,
                    order_index = excluded.order_index,
                    content = excluded.content,
                    is_visible = excluded.is_visible,
                    updated_at = excluded.updated_at",
                params![
                    block.id,
                    guide_id,
                    block.block_type,
                    order as i64,
                    serde_json::to_string(&block.content)?,
                    block.is_visible,
                    now
                ],
            )?;
        }

        for block_id in cleared_blocks {
            chunks::delete_for_block(&tx, block_id)?;
        }
        chunks::write_all(&tx, guide_id, new_chunks)?;

        tx.execute(
            "UPDATE guides SET updated_at = ?1 WHERE id = ?2",
            params![now, guide_id],
        )?;
        tx.commit()?;
        drop(conn);
        self.list_blocks(guide_id)
    }
}
