use std::{
    collections::HashMap,
    path::Path,
    sync::{Arc, Mutex},
};

use chrono::{Duration, Utc};
use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use serde_json::Value;

use super::{date_key, now_ms, open_connection, string_field, SharedConnection};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS analytics_events (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    occurred_at INTEGER NOT NULL,
    date_key    TEXT NOT NULL,
    profile_id  TEXT NOT NULL,
    event_type  TEXT NOT NULL,
    thread_id   TEXT,
    turn_id     TEXT,
    item_id     TEXT,
    model       TEXT,
    status      TEXT,
    payload     TEXT
);
CREATE INDEX IF NOT EXISTS idx_analytics_events_date ON analytics_events (date_key);
CREATE TABLE IF NOT EXISTS analytics_daily (
    date_key   TEXT NOT NULL,
    metric     TEXT NOT NULL,
    profile_id TEXT NOT NULL,
    model      TEXT NOT NULL DEFAULT '',
    count      INTEGER NOT NULL DEFAULT 0,
    UNIQUE (date_key, metric, profile_id, model)
);
CREATE TABLE IF NOT EXISTS analytics_thread_meta (
    thread_id  TEXT PRIMARY KEY,
    profile_id TEXT NOT NULL,
    model      TEXT,
    created_at INTEGER,
    updated_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS analytics_turn_meta (
    turn_id      TEXT PRIMARY KEY,
    thread_id    TEXT,
    profile_id   TEXT NOT NULL,
    model        TEXT,
    started_at   INTEGER,
    completed_at INTEGER,
    status       TEXT,
    updated_at   INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS analytics_token_usage (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    occurred_at INTEGER NOT NULL,
    date_key    TEXT NOT NULL,
    profile_id  TEXT NOT NULL,
    thread_id   TEXT,
    payload     TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS analytics_approvals (
    profile_id    TEXT NOT NULL,
    request_id    INTEGER NOT NULL,
    approval_type TEXT NOT NULL,
    thread_id     TEXT,
    item_id       TEXT,
    requested_at  INTEGER NOT NULL,
    decision      TEXT,
    decided_at    INTEGER,
    PRIMARY KEY (profile_id, request_id)
);
";

/// One point of a daily metric series.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyCount {
    pub date_key: String,
    pub count: i64,
}

/// A recorded approval request with its (eventual) decision.
#[derive(Clone, Debug, PartialEq)]
pub struct ApprovalRow {
    pub approval_type: String,
    pub thread_id: Option<String>,
    pub item_id: Option<String>,
    pub decision: Option<String>,
}

/// Append-only event log plus daily counters and meta tables derived from
/// observed RPC traffic.
#[derive(Clone)]
pub struct AnalyticsStore {
    conn: SharedConnection,
}

impl AnalyticsStore {
    pub fn open(path: &Path) -> rusqlite::Result<Self> {
        let conn = open_connection(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Appends one event row, harvesting common correlation fields from the
    /// payload.
    pub fn record_event(
        &self,
        profile_id: &str,
        event_type: &str,
        payload: &Value,
    ) -> rusqlite::Result<()> {
        let now = now_ms();
        let thread_id = string_field(payload, &["threadId", "thread_id"])
            .or_else(|| payload.get("thread").and_then(|t| string_field(t, &["id"])));
        let turn_id = string_field(payload, &["turnId", "turn_id"])
            .or_else(|| payload.get("turn").and_then(|t| string_field(t, &["id"])));
        let item_id = string_field(payload, &["itemId", "item_id"])
            .or_else(|| payload.get("item").and_then(|i| string_field(i, &["id"])));
        let model = string_field(payload, &["model"])
            .or_else(|| payload.get("turn").and_then(|t| string_field(t, &["model"])))
            .or_else(|| payload.get("thread").and_then(|t| string_field(t, &["model"])));
        let status = string_field(payload, &["status"])
            .or_else(|| payload.get("turn").and_then(|t| string_field(t, &["status"])))
            .or_else(|| payload.get("item").and_then(|i| string_field(i, &["status"])));

        let conn = self.conn.lock().expect("analytics store poisoned");
        conn.execute(
            "INSERT INTO analytics_events (
                 occurred_at, date_key, profile_id, event_type,
                 thread_id, turn_id, item_id, model, status, payload
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                now,
                date_key(now),
                profile_id,
                event_type,
                thread_id,
                turn_id,
                item_id,
                model,
                status,
                payload.to_string(),
            ],
        )?;
        Ok(())
    }

    /// Bumps today's counter for `(metric, profile, model)` by one. A single
    /// upsert statement, so concurrent observers can never lose an
    /// increment.
    pub fn increment_daily(
        &self,
        metric: &str,
        profile_id: &str,
        model: Option<&str>,
    ) -> rusqlite::Result<()> {
        let conn = self.conn.lock().expect("analytics store poisoned");
        conn.execute(
            "INSERT INTO analytics_daily (date_key, metric, profile_id, model, count)
             VALUES (?1, ?2, ?3, ?4, 1)
             ON CONFLICT (date_key, metric, profile_id, model)
             DO UPDATE SET count = count + 1",
            params![date_key(now_ms()), metric, profile_id, model.unwrap_or("")],
        )?;
        Ok(())
    }

    pub fn upsert_thread_meta(
        &self,
        profile_id: &str,
        thread_id: &str,
        model: Option<&str>,
        created_at: Option<i64>,
    ) -> rusqlite::Result<()> {
        let conn = self.conn.lock().expect("analytics store poisoned");
        conn.execute(
            "INSERT INTO analytics_thread_meta (thread_id, profile_id, model, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (thread_id) DO UPDATE SET
                 profile_id = excluded.profile_id,
                 model      = COALESCE(excluded.model, analytics_thread_meta.model),
                 created_at = COALESCE(excluded.created_at, analytics_thread_meta.created_at),
                 updated_at = excluded.updated_at",
            params![thread_id, profile_id, model, created_at, now_ms()],
        )?;
        Ok(())
    }

    pub fn upsert_turn_started(
        &self,
        profile_id: &str,
        turn_id: &str,
        thread_id: Option<&str>,
        model: Option<&str>,
    ) -> rusqlite::Result<()> {
        let now = now_ms();
        let conn = self.conn.lock().expect("analytics store poisoned");
        conn.execute(
            "INSERT INTO analytics_turn_meta (turn_id, thread_id, profile_id, model, started_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)
             ON CONFLICT (turn_id) DO UPDATE SET
                 thread_id  = COALESCE(excluded.thread_id, analytics_turn_meta.thread_id),
                 model      = COALESCE(excluded.model, analytics_turn_meta.model),
                 started_at = COALESCE(analytics_turn_meta.started_at, excluded.started_at),
                 updated_at = excluded.updated_at",
            params![turn_id, thread_id, profile_id, model, now],
        )?;
        Ok(())
    }

    pub fn upsert_turn_completed(
        &self,
        profile_id: &str,
        turn_id: &str,
        thread_id: Option<&str>,
        status: &str,
    ) -> rusqlite::Result<()> {
        let now = now_ms();
        let conn = self.conn.lock().expect("analytics store poisoned");
        conn.execute(
            "INSERT INTO analytics_turn_meta (turn_id, thread_id, profile_id, status, completed_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)
             ON CONFLICT (turn_id) DO UPDATE SET
                 thread_id    = COALESCE(excluded.thread_id, analytics_turn_meta.thread_id),
                 status       = excluded.status,
                 completed_at = excluded.completed_at,
                 updated_at   = excluded.updated_at",
            params![turn_id, thread_id, profile_id, status, now],
        )?;
        Ok(())
    }

    pub fn record_token_usage(
        &self,
        profile_id: &str,
        thread_id: Option<&str>,
        payload: &Value,
    ) -> rusqlite::Result<()> {
        let now = now_ms();
        let conn = self.conn.lock().expect("analytics store poisoned");
        conn.execute(
            "INSERT INTO analytics_token_usage (occurred_at, date_key, profile_id, thread_id, payload)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![now, date_key(now), profile_id, thread_id, payload.to_string()],
        )?;
        Ok(())
    }

    pub fn record_approval_request(
        &self,
        profile_id: &str,
        request_id: i64,
        approval_type: &str,
        thread_id: Option<&str>,
        item_id: Option<&str>,
    ) -> rusqlite::Result<()> {
        let conn = self.conn.lock().expect("analytics store poisoned");
        conn.execute(
            "INSERT INTO analytics_approvals (profile_id, request_id, approval_type, thread_id, item_id, requested_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT (profile_id, request_id) DO UPDATE SET
                 approval_type = excluded.approval_type,
                 thread_id     = COALESCE(excluded.thread_id, analytics_approvals.thread_id),
                 item_id       = COALESCE(excluded.item_id, analytics_approvals.item_id),
                 requested_at  = excluded.requested_at",
            params![profile_id, request_id, approval_type, thread_id, item_id, now_ms()],
        )?;
        Ok(())
    }

    pub fn record_approval_decision(
        &self,
        profile_id: &str,
        request_id: i64,
        decision: &str,
    ) -> rusqlite::Result<()> {
        let conn = self.conn.lock().expect("analytics store poisoned");
        conn.execute(
            "UPDATE analytics_approvals SET decision = ?3, decided_at = ?4
             WHERE profile_id = ?1 AND request_id = ?2",
            params![profile_id, request_id, decision, now_ms()],
        )?;
        Ok(())
    }

    pub fn approval(
        &self,
        profile_id: &str,
        request_id: i64,
    ) -> rusqlite::Result<Option<ApprovalRow>> {
        let conn = self.conn.lock().expect("analytics store poisoned");
        conn.query_row(
            "SELECT approval_type, thread_id, item_id, decision FROM analytics_approvals
             WHERE profile_id = ?1 AND request_id = ?2",
            params![profile_id, request_id],
            |row| {
                Ok(ApprovalRow {
                    approval_type: row.get(0)?,
                    thread_id: row.get(1)?,
                    item_id: row.get(2)?,
                    decision: row.get(3)?,
                })
            },
        )
        .optional()
    }

    /// Daily series for a metric over the last `days` days (UTC), oldest
    /// first, with missing dates zero-filled.
    pub fn daily_series(
        &self,
        metric: &str,
        profile_id: Option<&str>,
        model: Option<&str>,
        days: u32,
    ) -> rusqlite::Result<Vec<DailyCount>> {
        let mut sql = String::from(
            "SELECT date_key, SUM(count) FROM analytics_daily WHERE metric = ?1",
        );
        let mut values: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(metric.to_string())];
        if let Some(profile_id) = profile_id {
            sql.push_str(&format!(" AND profile_id = ?{}", values.len() + 1));
            values.push(Box::new(profile_id.to_string()));
        }
        if let Some(model) = model {
            sql.push_str(&format!(" AND model = ?{}", values.len() + 1));
            values.push(Box::new(model.to_string()));
        }
        sql.push_str(" GROUP BY date_key");

        let counts: HashMap<String, i64> = {
            let conn = self.conn.lock().expect("analytics store poisoned");
            let mut stmt = conn.prepare(&sql)?;
            let refs: Vec<&dyn rusqlite::ToSql> =
                values.iter().map(|value| value.as_ref()).collect();
            let rows = stmt.query_map(refs.as_slice(), |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            rows.collect::<rusqlite::Result<_>>()?
        };

        let days = days.max(1);
        let today = Utc::now().date_naive();
        let mut series = Vec::with_capacity(days as usize);
        for offset in (0..days).rev() {
            let date = today - Duration::days(i64::from(offset));
            let key = date.format("%Y-%m-%d").to_string();
            let count = counts.get(&key).copied().unwrap_or(0);
            series.push(DailyCount {
                date_key: key,
                count,
            });
        }
        Ok(series)
    }

    /// Today's count for one exact counter tuple.
    pub fn daily_count(
        &self,
        metric: &str,
        profile_id: &str,
        model: Option<&str>,
    ) -> rusqlite::Result<i64> {
        let conn = self.conn.lock().expect("analytics store poisoned");
        let count = conn
            .query_row(
                "SELECT count FROM analytics_daily
                 WHERE date_key = ?1 AND metric = ?2 AND profile_id = ?3 AND model = ?4",
                params![date_key(now_ms()), metric, profile_id, model.unwrap_or("")],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        Ok(count.unwrap_or(0))
    }

    /// Number of rows in the append-only event log (test support).
    pub fn event_count(&self, event_type: Option<&str>) -> rusqlite::Result<i64> {
        let conn = self.conn.lock().expect("analytics store poisoned");
        match event_type {
            Some(event_type) => conn.query_row(
                "SELECT COUNT(*) FROM analytics_events WHERE event_type = ?1",
                params![event_type],
                |row| row.get(0),
            ),
            None => conn.query_row("SELECT COUNT(*) FROM analytics_events", [], |row| row.get(0)),
        }
    }
}
