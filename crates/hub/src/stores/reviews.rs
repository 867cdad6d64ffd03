use std::{
    path::Path,
    sync::{Arc, Mutex},
};

use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;
use serde_json::Value;

use super::{now_ms, open_connection, SharedConnection};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS review_sessions (
    id           TEXT PRIMARY KEY,
    thread_id    TEXT,
    item_id      TEXT,
    profile_id   TEXT NOT NULL,
    label        TEXT,
    status       TEXT NOT NULL,
    started_at   INTEGER NOT NULL,
    completed_at INTEGER,
    model        TEXT,
    cwd          TEXT,
    review       TEXT
);
CREATE INDEX IF NOT EXISTS idx_review_sessions_thread ON review_sessions (thread_id);
";

/// One in-IDE review session inferred from `enteredReviewMode` /
/// `exitedReviewMode` item traffic.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewSession {
    pub id: String,
    pub thread_id: Option<String>,
    pub item_id: Option<String>,
    pub profile_id: String,
    pub label: Option<String>,
    pub status: String,
    pub started_at: i64,
    pub completed_at: Option<i64>,
    pub model: Option<String>,
    pub cwd: Option<String>,
    pub review: Option<Value>,
}

/// Fields captured when a review session begins.
#[derive(Clone, Debug, Default)]
pub struct ReviewStart<'a> {
    pub id: &'a str,
    pub thread_id: Option<&'a str>,
    pub item_id: Option<&'a str>,
    pub label: Option<&'a str>,
    pub model: Option<&'a str>,
    pub cwd: Option<&'a str>,
}

/// Upsert/complete state machine for review sessions. Status transitions
/// only advance: a completed row is never taken back to running.
#[derive(Clone)]
pub struct ReviewSessionStore {
    conn: SharedConnection,
}

impl ReviewSessionStore {
    pub fn open(path: &Path) -> rusqlite::Result<Self> {
        let conn = open_connection(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Marks a session running. Re-entrant for the same id; a session that
    /// already completed keeps its terminal status.
    pub fn begin(&self, profile_id: &str, start: &ReviewStart<'_>) -> rusqlite::Result<()> {
        let conn = self.conn.lock().expect("review store poisoned");
        conn.execute(
            "INSERT INTO review_sessions (id, thread_id, item_id, profile_id, label, status, started_at, model, cwd)
             VALUES (?1, ?2, ?3, ?4, ?5, 'running', ?6, ?7, ?8)
             ON CONFLICT (id) DO UPDATE SET
                 thread_id = COALESCE(excluded.thread_id, review_sessions.thread_id),
                 item_id   = COALESCE(excluded.item_id, review_sessions.item_id),
                 label     = COALESCE(excluded.label, review_sessions.label),
                 model     = COALESCE(excluded.model, review_sessions.model),
                 cwd       = COALESCE(excluded.cwd, review_sessions.cwd),
                 status    = CASE WHEN review_sessions.status IN ('completed', 'failed')
                                  THEN review_sessions.status ELSE 'running' END",
            params![
                start.id,
                start.thread_id,
                start.item_id,
                profile_id,
                start.label,
                now_ms(),
                start.model,
                start.cwd,
            ],
        )?;
        Ok(())
    }

    /// Completes a session. The primary lookup is by id; when the completing
    /// frame carries a different id than the starting one, the running row
    /// is found by `(thread_id, item_id)`, then by newest running row for
    /// the thread. A row that already reached a terminal status is left
    /// untouched; a completion with no matching row records a terminal row
    /// directly.
    pub fn complete(
        &self,
        profile_id: &str,
        id: &str,
        thread_id: Option<&str>,
        item_id: Option<&str>,
        status: &str,
        review: Option<&Value>,
    ) -> rusqlite::Result<()> {
        let now = now_ms();
        let review_text = review.map(Value::to_string);
        let conn = self.conn.lock().expect("review store poisoned");

        let updated = conn.execute(
            "UPDATE review_sessions
             SET status = ?2, completed_at = ?3, review = COALESCE(?4, review)
             WHERE id = ?1 AND status NOT IN ('completed', 'failed')",
            params![id, status, now, review_text],
        )?;
        if updated > 0 {
            return Ok(());
        }

        // The id may already hold a terminal row; never downgrade it.
        let existing: Option<String> = conn
            .query_row(
                "SELECT status FROM review_sessions WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        if existing.is_some() {
            return Ok(());
        }

        if let (Some(thread_id), Some(item_id)) = (thread_id, item_id) {
            let updated = conn.execute(
                "UPDATE review_sessions
                 SET status = ?3, completed_at = ?4, review = COALESCE(?5, review)
                 WHERE thread_id = ?1 AND item_id = ?2 AND status = 'running'",
                params![thread_id, item_id, status, now, review_text],
            )?;
            if updated > 0 {
                return Ok(());
            }
        }

        if let Some(thread_id) = thread_id {
            let updated = conn.execute(
                "UPDATE review_sessions
                 SET status = ?2, completed_at = ?3, review = COALESCE(?4, review)
                 WHERE id = (SELECT id FROM review_sessions
                             WHERE thread_id = ?1 AND status = 'running'
                             ORDER BY started_at DESC LIMIT 1)",
                params![thread_id, status, now, review_text],
            )?;
            if updated > 0 {
                return Ok(());
            }
        }

        conn.execute(
            "INSERT INTO review_sessions (id, thread_id, item_id, profile_id, status, started_at, completed_at, review)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, ?7)",
            params![id, thread_id, item_id, profile_id, status, now, review_text],
        )?;
        Ok(())
    }

    pub fn get(&self, id: &str) -> rusqlite::Result<Option<ReviewSession>> {
        let conn = self.conn.lock().expect("review store poisoned");
        conn.query_row(
            &format!("{SELECT_ROW} WHERE id = ?1"),
            params![id],
            row_to_session,
        )
        .optional()
    }

    /// Lists sessions, newest first. `limit` is clamped to `[1, 200]` and
    /// defaults to 100.
    pub fn list(
        &self,
        profile_id: Option<&str>,
        limit: Option<u32>,
        offset: Option<u32>,
    ) -> rusqlite::Result<Vec<ReviewSession>> {
        let limit = i64::from(limit.unwrap_or(100).clamp(1, 200));
        let offset = i64::from(offset.unwrap_or(0));
        let conn = self.conn.lock().expect("review store poisoned");
        match profile_id {
            Some(profile_id) => {
                let mut stmt = conn.prepare(&format!(
                    "{SELECT_ROW} WHERE profile_id = ?1 ORDER BY started_at DESC LIMIT ?2 OFFSET ?3"
                ))?;
                let rows = stmt.query_map(params![profile_id, limit, offset], row_to_session)?;
                rows.collect()
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "{SELECT_ROW} ORDER BY started_at DESC LIMIT ?1 OFFSET ?2"
                ))?;
                let rows = stmt.query_map(params![limit, offset], row_to_session)?;
                rows.collect()
            }
        }
    }
}

const SELECT_ROW: &str = "SELECT id, thread_id, item_id, profile_id, label, status, \
     started_at, completed_at, model, cwd, review FROM review_sessions";

fn row_to_session(row: &Row<'_>) -> rusqlite::Result<ReviewSession> {
    let review: Option<String> = row.get(10)?;
    Ok(ReviewSession {
        id: row.get(0)?,
        thread_id: row.get(1)?,
        item_id: row.get(2)?,
        profile_id: row.get(3)?,
        label: row.get(4)?,
        status: row.get(5)?,
        started_at: row.get(6)?,
        completed_at: row.get(7)?,
        model: row.get(8)?,
        cwd: row.get(9)?,
        review: review.and_then(|raw| serde_json::from_str(&raw).ok()),
    })
}
