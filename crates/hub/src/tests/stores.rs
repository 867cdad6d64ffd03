use serde_json::json;
use tempfile::TempDir;

use crate::stores::{
    analytics::AnalyticsStore,
    reviews::{ReviewSessionStore, ReviewStart},
    threads::{ThreadIndexStore, ThreadRecord, ThreadSearchQuery},
};

fn thread_store() -> (TempDir, ThreadIndexStore) {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = ThreadIndexStore::open(&dir.path().join("threads.sqlite")).expect("open");
    (dir, store)
}

fn analytics_store() -> (TempDir, AnalyticsStore) {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = AnalyticsStore::open(&dir.path().join("analytics.sqlite")).expect("open");
    (dir, store)
}

fn review_store() -> (TempDir, ReviewSessionStore) {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = ReviewSessionStore::open(&dir.path().join("reviews.sqlite")).expect("open");
    (dir, store)
}

fn record(thread_id: &str, profile_id: &str, preview: &str) -> ThreadRecord {
    ThreadRecord {
        thread_id: thread_id.to_string(),
        profile_id: profile_id.to_string(),
        preview: Some(preview.to_string()),
        ..ThreadRecord::default()
    }
}

fn search_query(query: &str) -> ThreadSearchQuery {
    ThreadSearchQuery {
        query: Some(query.to_string()),
        ..ThreadSearchQuery::default()
    }
}

#[test]
fn fts_search_matches_previews() {
    let (_dir, store) = thread_store();
    store.upsert(&record("t1", "p1", "fix parser bug")).expect("upsert");
    store.upsert(&record("t2", "p1", "refactor schema")).expect("upsert");

    let parser = store.search(&search_query("parser")).expect("search");
    assert_eq!(parser.len(), 1);
    assert_eq!(parser[0].thread_id, "t1");

    let schema = store.search(&search_query("schema")).expect("search");
    assert_eq!(schema.len(), 1);
    assert_eq!(schema[0].thread_id, "t2");

    let mut filtered = search_query("parser");
    filtered.profile_id = Some("other".to_string());
    assert!(store.search(&filtered).expect("search").is_empty());
}

#[test]
fn fts_mirror_follows_every_upsert() {
    let (_dir, store) = thread_store();
    store.upsert(&record("t1", "p1", "fix parser bug")).expect("upsert");
    store.upsert(&record("t1", "p1", "rewrite tokenizer")).expect("upsert");

    assert!(store.search(&search_query("parser")).expect("search").is_empty());
    let hits = store.search(&search_query("tokenizer")).expect("search");
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].thread_id, "t1");
}

#[test]
fn upsert_preserves_existing_fields() {
    let (_dir, store) = thread_store();
    let mut first = record("t1", "p1", "fix parser bug");
    first.cwd = Some("/work".to_string());
    store.upsert(&first).expect("upsert");

    // A later sighting without cwd/preview keeps the known values.
    store
        .upsert(&ThreadRecord {
            thread_id: "t1".to_string(),
            profile_id: "p1".to_string(),
            ..ThreadRecord::default()
        })
        .expect("upsert");

    let row = store.get("t1").expect("get").expect("row");
    assert_eq!(row.preview.as_deref(), Some("fix parser bug"));
    assert_eq!(row.cwd.as_deref(), Some("/work"));
}

#[test]
fn archive_marks_status_and_clears_from_active_search() {
    let (_dir, store) = thread_store();
    store.upsert(&record("t1", "p1", "fix parser bug")).expect("upsert");
    store.mark_archived("p1", "t1").expect("archive");

    let row = store.get("t1").expect("get").expect("row");
    assert_eq!(row.status, "archived");
    assert!(row.archived_at.unwrap_or(0) > 0);

    let mut active_only = ThreadSearchQuery::default();
    active_only.status = Some("active".to_string());
    assert!(store.search(&active_only).expect("search").is_empty());

    // Archiving a thread the index never saw creates a stub row.
    store.mark_archived("p1", "t-unseen").expect("archive");
    assert_eq!(
        store.get("t-unseen").expect("get").expect("row").status,
        "archived"
    );
}

#[test]
fn created_at_seconds_are_normalized_to_millis() {
    let value = json!({ "id": "t1", "createdAt": 1_700_000_000 });
    let record = ThreadRecord::from_value("p1", &value).expect("record");
    assert_eq!(record.created_at, Some(1_700_000_000_000));

    let value = json!({ "thread": { "id": "t2", "createdAt": 1_700_000_000_123_i64 } });
    let record = ThreadRecord::from_value("p1", &value).expect("record");
    assert_eq!(record.thread_id, "t2");
    assert_eq!(record.created_at, Some(1_700_000_000_123));
}

#[test]
fn search_orders_newest_first_and_honors_limits() {
    let (_dir, store) = thread_store();
    for (thread_id, created_at) in [("t1", 1_000), ("t2", 3_000), ("t3", 2_000)] {
        store
            .upsert(&ThreadRecord {
                thread_id: thread_id.to_string(),
                profile_id: "p1".to_string(),
                created_at: Some(created_at),
                ..ThreadRecord::default()
            })
            .expect("upsert");
    }

    let mut query = ThreadSearchQuery::default();
    let rows = store.search(&query).expect("search");
    let ids: Vec<&str> = rows.iter().map(|row| row.thread_id.as_str()).collect();
    assert_eq!(ids, vec!["t2", "t3", "t1"]);

    query.limit = Some(2);
    assert_eq!(store.search(&query).expect("search").len(), 2);
    query.offset = Some(2);
    assert_eq!(store.search(&query).expect("search").len(), 1);

    let range = ThreadSearchQuery {
        created_after: Some(1_500),
        created_before: Some(2_500),
        ..ThreadSearchQuery::default()
    };
    let rows = store.search(&range).expect("search");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].thread_id, "t3");
}

#[test]
fn daily_counter_is_exact_over_repeated_increments() {
    let (_dir, store) = analytics_store();
    for _ in 0..5 {
        store
            .increment_daily("turns_started", "p1", Some("gpt-5"))
            .expect("increment");
    }
    store
        .increment_daily("turns_started", "p1", None)
        .expect("increment");

    assert_eq!(
        store.daily_count("turns_started", "p1", Some("gpt-5")).expect("count"),
        5
    );
    assert_eq!(store.daily_count("turns_started", "p1", None).expect("count"), 1);
    assert_eq!(store.daily_count("turns_started", "p2", None).expect("count"), 0);
}

#[test]
fn daily_series_zero_fills_gaps_in_date_order() {
    let (_dir, store) = analytics_store();
    store.increment_daily("threads_started", "p1", None).expect("increment");
    store.increment_daily("threads_started", "p1", None).expect("increment");

    let series = store
        .daily_series("threads_started", None, None, 7)
        .expect("series");
    assert_eq!(series.len(), 7);
    assert!(series.windows(2).all(|pair| pair[0].date_key < pair[1].date_key));
    assert_eq!(series.last().expect("today").count, 2);
    assert!(series[..6].iter().all(|point| point.count == 0));
}

#[test]
fn approval_rows_record_request_and_decision() {
    let (_dir, store) = analytics_store();
    store
        .record_approval_request("p1", 42, "command", Some("t1"), Some("i1"))
        .expect("request");
    store
        .record_approval_decision("p1", 42, "approved")
        .expect("decision");

    let row = store.approval("p1", 42).expect("query").expect("row");
    assert_eq!(row.approval_type, "command");
    assert_eq!(row.thread_id.as_deref(), Some("t1"));
    assert_eq!(row.item_id.as_deref(), Some("i1"));
    assert_eq!(row.decision.as_deref(), Some("approved"));
}

#[test]
fn event_log_appends_with_harvested_fields() {
    let (_dir, store) = analytics_store();
    store
        .record_event(
            "p1",
            "rpc.event:turn/started",
            &json!({ "threadId": "t1", "turn": { "id": "u1", "model": "gpt-5" } }),
        )
        .expect("record");
    store
        .record_event("p1", "rpc.request:ping", &json!({}))
        .expect("record");

    assert_eq!(store.event_count(None).expect("count"), 2);
    assert_eq!(
        store.event_count(Some("rpc.event:turn/started")).expect("count"),
        1
    );
}

#[test]
fn review_sessions_complete_and_stay_completed() {
    let (_dir, store) = review_store();
    store
        .begin(
            "p1",
            &ReviewStart {
                id: "turn-1",
                thread_id: Some("t1"),
                item_id: Some("i1"),
                label: Some("review src/"),
                ..ReviewStart::default()
            },
        )
        .expect("begin");
    assert_eq!(store.get("turn-1").expect("get").expect("row").status, "running");

    store
        .complete("p1", "turn-1", Some("t1"), Some("i1"), "completed", None)
        .expect("complete");
    let row = store.get("turn-1").expect("get").expect("row");
    assert_eq!(row.status, "completed");
    assert!(row.completed_at.is_some());

    // A late started event must not reopen the session.
    store
        .begin(
            "p1",
            &ReviewStart {
                id: "turn-1",
                thread_id: Some("t1"),
                ..ReviewStart::default()
            },
        )
        .expect("begin again");
    assert_eq!(store.get("turn-1").expect("get").expect("row").status, "completed");
}

#[test]
fn review_completion_falls_back_to_thread_and_item() {
    let (_dir, store) = review_store();
    store
        .begin(
            "p1",
            &ReviewStart {
                id: "turn-9",
                thread_id: Some("t1"),
                item_id: Some("i1"),
                ..ReviewStart::default()
            },
        )
        .expect("begin");

    // The completing frame carries a different id than the starting one.
    store
        .complete(
            "p1",
            "item-only-id",
            Some("t1"),
            Some("i1"),
            "completed",
            Some(&json!({ "verdict": "ok" })),
        )
        .expect("complete");

    let row = store.get("turn-9").expect("get").expect("row");
    assert_eq!(row.status, "completed");
    assert_eq!(row.review, Some(json!({ "verdict": "ok" })));
    assert!(store.get("item-only-id").expect("get").is_none());
}

#[test]
fn review_completion_without_a_start_records_a_terminal_row() {
    let (_dir, store) = review_store();
    store
        .complete("p1", "orphan", Some("t1"), None, "completed", None)
        .expect("complete");
    let row = store.get("orphan").expect("get").expect("row");
    assert_eq!(row.status, "completed");
}

#[test]
fn review_listing_is_newest_first_and_clamped() {
    let (_dir, store) = review_store();
    for index in 0..3 {
        store
            .begin(
                "p1",
                &ReviewStart {
                    id: &format!("r-{index}"),
                    thread_id: Some("t1"),
                    ..ReviewStart::default()
                },
            )
            .expect("begin");
    }
    store
        .begin(
            "p2",
            &ReviewStart {
                id: "other",
                ..ReviewStart::default()
            },
        )
        .expect("begin");

    assert_eq!(store.list(None, None, None).expect("list").len(), 4);
    assert_eq!(store.list(Some("p1"), None, None).expect("list").len(), 3);
    assert_eq!(store.list(Some("p1"), Some(2), None).expect("list").len(), 2);
    assert_eq!(store.list(Some("p1"), Some(0), None).expect("list").len(), 1);
}
