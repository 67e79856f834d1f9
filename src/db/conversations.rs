use super::models::{ConversationTurn, Role};
use super::{Database, DbResult};
use chrono::Utc;
use rusqlite::{params, Row};

const TURN_COLUMNS: &str = "id, guide_id, session_id, role, content, metadata, created_at";

fn turn_from_row(row: &Row<'_>) -> rusqlite::Result<ConversationTurn> {
    let metadata: Option<String> = row.get(5)?;
    let metadata = metadata
        .map(|raw| serde_json::from_str(&raw))
        .transpose()
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(e))
        })?;
    Ok(ConversationTurn {
        id: row.get(0)?,
        guide_id: row.get(1)?,
        session_id: row.get(2)?,
        role: row.get(3)?,
        content: row.get(4)?,
        metadata,
        created_at: row.get(6)?,
    })
}

impl Database {
    // ── Conversations ──

    /// Append-only insert; the timestamp is assigned here, never by callers.
    pub fn append_turn(
        &self,
        guide_id: &str,
        session_id: &str,
        role: Role,
        content: &str,
        metadata: Option<&serde_json::Value>,
    ) -> DbResult<ConversationTurn> {
        let conn = self.conn()?;
        let id = uuid::Uuid::new_v4().to_string();
        let metadata = metadata.map(serde_json::to_string).transpose()?;
        conn.execute(
            "INSERT INTO conversations (id, guide_id, session_id, role, content, metadata, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![id, guide_id, session_id, role, content, metadata, Utc::now()],
        )?;
        Ok(conn.query_row(
            &format!("SELECT {TURN_COLUMNS} FROM conversations WHERE id = ?1"),
            params![id],
            turn_from_row,
        )?)
    }

    /// The `limit` most recent turns of a session, returned oldest first.
    pub fn recent_turns(
        &self,
        guide_id: &str,
        session_id: &str,
        limit: usize,
    ) -> DbResult<Vec<ConversationTurn>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {TURN_COLUMNS} FROM conversations
             WHERE guide_id = ?1 AND session_id = ?2
             ORDER BY created_at DESC, rowid DESC
             LIMIT ?3"
        ))?;
        let rows = stmt.query_map(params![guide_id, session_id, limit as i64], turn_from_row)?;
        let mut turns = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        turns.reverse();
        Ok(turns)
    }

    pub fn session_turns(&self, guide_id: &str, session_id: &str) -> DbResult<Vec<ConversationTurn>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {TURN_COLUMNS} FROM conversations
             WHERE guide_id = ?1 AND session_id = ?2
             ORDER BY created_at ASC, rowid ASC"
        ))?;
        let rows = stmt.query_map(params![guide_id, session_id], turn_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::NewGuide;
    use serde_json::json;

    fn setup() -> (Database, String) {
        let db = Database::open_in_memory().unwrap();
        let guide = db
            .create_guide(&NewGuide {
                user_id: "host".into(),
                slug: "chat".into(),
                title: "Chat".into(),
                accommodation_name: None,
            })
            .unwrap();
        (db, guide.id)
    }

    #[test]
    fn recent_turns_are_chronological() {
        let (db, guide_id) = setup();
        for i in 0..15 {
            let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
            db.append_turn(&guide_id, "s1", role, &format!("turn {i}"), None)
                .unwrap();
        }

        let turns = db.recent_turns(&guide_id, "s1", 10).unwrap();
        assert_eq!(turns.len(), 10);
        assert_eq!(turns.first().unwrap().content, "turn 5");
        assert_eq!(turns.last().unwrap().content, "turn 14");
        assert!(turns.windows(2).all(|w| w[0].created_at <= w[1].created_at));
    }

    #[test]
    fn recent_turns_returns_what_exists() {
        let (db, guide_id) = setup();
        for i in 0..3 {
            db.append_turn(&guide_id, "s1", Role::User, &format!("q{i}"), None)
                .unwrap();
        }
        db.append_turn(&guide_id, "other", Role::User, "elsewhere", None)
            .unwrap();

        let turns = db.recent_turns(&guide_id, "s1", 10).unwrap();
        let contents: Vec<&str> = turns.iter().map(|t| t.content.as_str()).collect();
        assert_eq!(contents, vec!["q0", "q1", "q2"]);
    }

    #[test]
    fn metadata_round_trips() {
        let (db, guide_id) = setup();
        let meta = json!({ "referencedBlockIds": ["b1", "b2"] });
        let turn = db
            .append_turn(&guide_id, "s1", Role::Assistant, "답변", Some(&meta))
            .unwrap();
        assert_eq!(turn.metadata, Some(meta));
        assert_eq!(db.session_turns(&guide_id, "s1").unwrap(), vec![turn]);
    }
}
