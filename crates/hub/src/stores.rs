//! Embedded SQLite stores fed by the traffic observers.
//!
//! Each store owns one WAL-journaled connection behind a mutex, so writes
//! are serialized at the statement level and readers (HTTP handlers) share
//! the same connection safely.

pub mod analytics;
pub mod reviews;
pub mod threads;

use std::{
    path::Path,
    sync::{Arc, Mutex},
};

use chrono::Utc;
use rusqlite::Connection;
use serde_json::Value;

pub(crate) type SharedConnection = Arc<Mutex<Connection>>;

pub(crate) fn open_connection(path: &Path) -> rusqlite::Result<Connection> {
    let conn = Connection::open(path)?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA foreign_keys = ON;",
    )?;
    Ok(conn)
}

/// Current time as UTC milliseconds.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Timestamps at or below 1e12 are seconds; everything above is already
/// milliseconds.
pub fn normalize_timestamp_ms(raw: f64) -> i64 {
    if raw <= 1.0e12 {
        (raw * 1000.0) as i64
    } else {
        raw as i64
    }
}

/// `YYYY-MM-DD` in UTC for a millisecond timestamp.
pub fn date_key(timestamp_ms: i64) -> String {
    chrono::DateTime::<Utc>::from_timestamp_millis(timestamp_ms)
        .map(|at| at.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| "1970-01-01".to_string())
}

/// First string value found under any of `keys`.
pub(crate) fn string_field(value: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|key| value.get(key).and_then(Value::as_str))
        .map(str::to_string)
}

/// First numeric value found under any of `keys`, normalized to UTC ms.
pub(crate) fn timestamp_field(value: &Value, keys: &[&str]) -> Option<i64> {
    keys.iter()
        .find_map(|key| value.get(key).and_then(Value::as_f64))
        .map(normalize_timestamp_ms)
}
