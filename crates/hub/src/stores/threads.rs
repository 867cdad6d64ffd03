use std::{
    path::Path,
    sync::{Arc, Mutex},
};

use rusqlite::{params, Connection, Row, ToSql};
use serde::Serialize;
use serde_json::Value;

use super::{now_ms, open_connection, string_field, timestamp_field, SharedConnection};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS thread_index (
    thread_id      TEXT PRIMARY KEY,
    profile_id     TEXT NOT NULL,
    preview        TEXT,
    model_provider TEXT,
    created_at     INTEGER,
    path           TEXT,
    cwd            TEXT,
    source         TEXT,
    cli_version    TEXT,
    status         TEXT NOT NULL DEFAULT 'active',
    archived_at    INTEGER,
    last_seen_at   INTEGER NOT NULL
);
CREATE VIRTUAL TABLE IF NOT EXISTS thread_index_fts USING fts5(
    thread_id, preview, path, cwd, model_provider, profile_id
);
";

/// Fields harvested from one thread payload, however the child shaped it.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ThreadRecord {
    pub thread_id: String,
    pub profile_id: String,
    pub preview: Option<String>,
    pub model_provider: Option<String>,
    pub created_at: Option<i64>,
    pub path: Option<String>,
    pub cwd: Option<String>,
    pub source: Option<String>,
    pub cli_version: Option<String>,
}

impl ThreadRecord {
    /// Harvests a record from a `thread/*` payload. The thread object may
    /// sit under a `thread` key or be the payload itself; `None` when no
    /// thread id can be found.
    pub fn from_value(profile_id: &str, value: &Value) -> Option<Self> {
        let thread = value.get("thread").unwrap_or(value);
        let thread_id = string_field(thread, &["threadId", "thread_id", "id"])?;
        Some(Self {
            thread_id,
            profile_id: profile_id.to_string(),
            preview: string_field(thread, &["preview", "title"]),
            model_provider: string_field(thread, &["modelProvider", "model_provider", "provider"]),
            created_at: timestamp_field(thread, &["createdAt", "created_at"]),
            path: string_field(thread, &["path"]),
            cwd: string_field(thread, &["cwd", "workingDirectory"]),
            source: string_field(thread, &["source"]),
            cli_version: string_field(thread, &["cliVersion", "cli_version"]),
        })
    }
}

/// One indexed thread as persisted.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadIndexRow {
    pub thread_id: String,
    pub profile_id: String,
    pub preview: Option<String>,
    pub model_provider: Option<String>,
    pub created_at: Option<i64>,
    pub path: Option<String>,
    pub cwd: Option<String>,
    pub source: Option<String>,
    pub cli_version: Option<String>,
    pub status: String,
    pub archived_at: Option<i64>,
    pub last_seen_at: i64,
}

/// Search filters. `query` joins against the FTS mirror; everything else is
/// a plain column filter.
#[derive(Clone, Debug, Default)]
pub struct ThreadSearchQuery {
    pub query: Option<String>,
    pub profile_id: Option<String>,
    pub model: Option<String>,
    pub status: Option<String>,
    pub created_after: Option<i64>,
    pub created_before: Option<i64>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

/// SQL-backed index of every thread the hub has seen, with full-text search
/// over preview/path/cwd/model/profile.
#[derive(Clone)]
pub struct ThreadIndexStore {
    conn: SharedConnection,
}

impl ThreadIndexStore {
    pub fn open(path: &Path) -> rusqlite::Result<Self> {
        let conn = open_connection(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Inserts or refreshes a thread row and rewrites its FTS mirror.
    ///
    /// Existing values survive when the new record carries no replacement;
    /// status is untouched so archived threads stay archived.
    pub fn upsert(&self, record: &ThreadRecord) -> rusqlite::Result<()> {
        let conn = self.conn.lock().expect("thread index poisoned");
        let now = now_ms();
        conn.execute(
            "INSERT INTO thread_index (
                 thread_id, profile_id, preview, model_provider, created_at,
                 path, cwd, source, cli_version, status, archived_at, last_seen_at
             ) VALUES (?1, ?2, ?3, ?4, COALESCE(?5, ?10), ?6, ?7, ?8, ?9, 'active', NULL, ?10)
             ON CONFLICT(thread_id) DO UPDATE SET
                 profile_id     = excluded.profile_id,
                 preview        = COALESCE(excluded.preview, thread_index.preview),
                 model_provider = COALESCE(excluded.model_provider, thread_index.model_provider),
                 created_at     = COALESCE(?5, thread_index.created_at),
                 path           = COALESCE(excluded.path, thread_index.path),
                 cwd            = COALESCE(excluded.cwd, thread_index.cwd),
                 source         = COALESCE(excluded.source, thread_index.source),
                 cli_version    = COALESCE(excluded.cli_version, thread_index.cli_version),
                 last_seen_at   = ?10",
            params![
                record.thread_id,
                record.profile_id,
                record.preview,
                record.model_provider,
                record.created_at,
                record.path,
                record.cwd,
                record.source,
                record.cli_version,
                now,
            ],
        )?;
        rewrite_fts(&conn, &record.thread_id)
    }

    /// Marks a thread archived, creating a stub row when the archive request
    /// arrives for a thread the index never saw.
    pub fn mark_archived(&self, profile_id: &str, thread_id: &str) -> rusqlite::Result<()> {
        let conn = self.conn.lock().expect("thread index poisoned");
        let now = now_ms();
        conn.execute(
            "INSERT INTO thread_index (thread_id, profile_id, created_at, status, archived_at, last_seen_at)
             VALUES (?1, ?2, ?3, 'archived', ?3, ?3)
             ON CONFLICT(thread_id) DO UPDATE SET
                 status = 'archived', archived_at = ?3, last_seen_at = ?3",
            params![thread_id, profile_id, now],
        )?;
        rewrite_fts(&conn, thread_id)
    }

    pub fn get(&self, thread_id: &str) -> rusqlite::Result<Option<ThreadIndexRow>> {
        let conn = self.conn.lock().expect("thread index poisoned");
        let mut stmt = conn.prepare(&format!("{SELECT_ROW} WHERE t.thread_id = ?1"))?;
        let mut rows = stmt.query_map(params![thread_id], row_to_thread)?;
        rows.next().transpose()
    }

    pub fn search(&self, query: &ThreadSearchQuery) -> rusqlite::Result<Vec<ThreadIndexRow>> {
        let mut sql = String::from(SELECT_ROW);
        let mut clauses: Vec<String> = Vec::new();
        let mut values: Vec<Box<dyn ToSql>> = Vec::new();

        let match_expression = query
            .query
            .as_deref()
            .map(fts_match_expression)
            .filter(|expression| !expression.is_empty());
        if let Some(expression) = match_expression {
            sql.push_str(" JOIN thread_index_fts f ON f.thread_id = t.thread_id");
            clauses.push(format!("f.thread_index_fts MATCH ?{}", values.len() + 1));
            values.push(Box::new(expression));
        }
        if let Some(profile_id) = &query.profile_id {
            clauses.push(format!("t.profile_id = ?{}", values.len() + 1));
            values.push(Box::new(profile_id.clone()));
        }
        if let Some(model) = &query.model {
            clauses.push(format!("t.model_provider = ?{}", values.len() + 1));
            values.push(Box::new(model.clone()));
        }
        if let Some(status) = &query.status {
            clauses.push(format!("t.status = ?{}", values.len() + 1));
            values.push(Box::new(status.clone()));
        }
        if let Some(created_after) = query.created_after {
            clauses.push(format!("t.created_at >= ?{}", values.len() + 1));
            values.push(Box::new(created_after));
        }
        if let Some(created_before) = query.created_before {
            clauses.push(format!("t.created_at <= ?{}", values.len() + 1));
            values.push(Box::new(created_before));
        }

        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }

        let limit = query.limit.unwrap_or(50).clamp(1, 200);
        let offset = query.offset.unwrap_or(0);
        sql.push_str(" ORDER BY t.created_at DESC");
        sql.push_str(&format!(
            " LIMIT ?{} OFFSET ?{}",
            values.len() + 1,
            values.len() + 2
        ));
        values.push(Box::new(i64::from(limit)));
        values.push(Box::new(i64::from(offset)));

        let conn = self.conn.lock().expect("thread index poisoned");
        let mut stmt = conn.prepare(&sql)?;
        let refs: Vec<&dyn ToSql> = values.iter().map(|value| value.as_ref()).collect();
        let rows = stmt.query_map(refs.as_slice(), row_to_thread)?;
        rows.collect()
    }
}

const SELECT_ROW: &str = "SELECT t.thread_id, t.profile_id, t.preview, t.model_provider, \
     t.created_at, t.path, t.cwd, t.source, t.cli_version, t.status, t.archived_at, \
     t.last_seen_at FROM thread_index t";

fn row_to_thread(row: &Row<'_>) -> rusqlite::Result<ThreadIndexRow> {
    Ok(ThreadIndexRow {
        thread_id: row.get(0)?,
        profile_id: row.get(1)?,
        preview: row.get(2)?,
        model_provider: row.get(3)?,
        created_at: row.get(4)?,
        path: row.get(5)?,
        cwd: row.get(6)?,
        source: row.get(7)?,
        cli_version: row.get(8)?,
        status: row.get(9)?,
        archived_at: row.get(10)?,
        last_seen_at: row.get(11)?,
    })
}

/// The FTS row is always rewritten whole so it can never drift from the
/// primary row.
fn rewrite_fts(conn: &Connection, thread_id: &str) -> rusqlite::Result<()> {
    conn.execute(
        "DELETE FROM thread_index_fts WHERE thread_id = ?1",
        params![thread_id],
    )?;
    conn.execute(
        "INSERT INTO thread_index_fts (thread_id, preview, path, cwd, model_provider, profile_id)
         SELECT thread_id, COALESCE(preview, ''), COALESCE(path, ''), COALESCE(cwd, ''),
                COALESCE(model_provider, ''), profile_id
         FROM thread_index WHERE thread_id = ?1",
        params![thread_id],
    )?;
    Ok(())
}

/// Quotes each whitespace-separated token so user input cannot inject FTS
/// query syntax.
fn fts_match_expression(raw: &str) -> String {
    raw.split_whitespace()
        .map(|token| format!("\"{}\"", token.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(" ")
}
