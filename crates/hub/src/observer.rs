//! Stateful observers over the supervisor's traffic.
//!
//! Everything here is read-only with respect to the broker's fan-out: the
//! broker hands copies of observed frames to [`ObserverHub`], a single task
//! applies them in arrival order, and every store failure is logged and
//! swallowed so indexing trouble can never stall the wire.

use std::{collections::HashSet, sync::Arc};

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::warn;

use crate::{
    activity::ActivityMap,
    stores::{
        analytics::AnalyticsStore,
        now_ms,
        reviews::{ReviewSessionStore, ReviewStart},
        string_field,
        threads::{ThreadIndexStore, ThreadRecord},
    },
};

/// One observed frame, tagged with the direction it travelled.
#[derive(Clone, Debug)]
pub enum Traffic {
    /// Notification from a child.
    Event {
        profile_id: String,
        method: String,
        params: Value,
    },
    /// Request a client routed through the broker.
    ClientRequest {
        profile_id: String,
        method: String,
        params: Value,
    },
    /// Result the child returned for a client-routed request.
    ClientResponse {
        profile_id: String,
        method: String,
        result: Value,
    },
    /// Request the child initiated (approval flows).
    ServerRequest {
        profile_id: String,
        id: i64,
        method: String,
        params: Value,
    },
    /// A client's reply to a child-initiated request.
    ServerResponse {
        profile_id: String,
        id: i64,
        result: Value,
    },
    /// The profile's child stopped or exited.
    ProfileStopped { profile_id: String },
}

/// Cheap cloneable handle used by the broker to feed the observer task.
#[derive(Clone)]
pub struct ObserverHub {
    tx: mpsc::UnboundedSender<Traffic>,
}

impl ObserverHub {
    pub fn observe(&self, traffic: Traffic) {
        let _ = self.tx.send(traffic);
    }

    pub fn event(&self, profile_id: &str, method: &str, params: &Value) {
        self.observe(Traffic::Event {
            profile_id: profile_id.to_string(),
            method: method.to_string(),
            params: params.clone(),
        });
    }

    pub fn client_request(&self, profile_id: &str, method: &str, params: &Value) {
        self.observe(Traffic::ClientRequest {
            profile_id: profile_id.to_string(),
            method: method.to_string(),
            params: params.clone(),
        });
    }

    pub fn client_response(&self, profile_id: &str, method: &str, result: &Value) {
        self.observe(Traffic::ClientResponse {
            profile_id: profile_id.to_string(),
            method: method.to_string(),
            result: result.clone(),
        });
    }

    pub fn server_request(&self, profile_id: &str, id: i64, method: &str, params: &Value) {
        self.observe(Traffic::ServerRequest {
            profile_id: profile_id.to_string(),
            id,
            method: method.to_string(),
            params: params.clone(),
        });
    }

    pub fn server_response(&self, profile_id: &str, id: i64, result: &Value) {
        self.observe(Traffic::ServerResponse {
            profile_id: profile_id.to_string(),
            id,
            result: result.clone(),
        });
    }

    pub fn profile_stopped(&self, profile_id: &str) {
        self.observe(Traffic::ProfileStopped {
            profile_id: profile_id.to_string(),
        });
    }
}

/// The stores the observer task writes into.
pub struct Observers {
    pub activity: Arc<ActivityMap>,
    pub threads: ThreadIndexStore,
    pub analytics: AnalyticsStore,
    pub reviews: ReviewSessionStore,
}

/// Spawns the observer task and returns the hub that feeds it.
pub fn spawn_observer(observers: Observers) -> ObserverHub {
    let (tx, mut rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        // Server-request ids we expect an approval decision for.
        let mut pending_approvals: HashSet<(String, i64)> = HashSet::new();
        while let Some(traffic) = rx.recv().await {
            apply(&observers, &mut pending_approvals, traffic);
        }
    });
    ObserverHub { tx }
}

fn apply(obs: &Observers, pending_approvals: &mut HashSet<(String, i64)>, traffic: Traffic) {
    match traffic {
        Traffic::Event {
            profile_id,
            method,
            params,
        } => apply_event(obs, &profile_id, &method, &params),
        Traffic::ClientRequest {
            profile_id,
            method,
            params,
        } => apply_client_request(obs, &profile_id, &method, &params),
        Traffic::ClientResponse {
            profile_id,
            method,
            result,
        } => apply_client_response(obs, &profile_id, &method, &result),
        Traffic::ServerRequest {
            profile_id,
            id,
            method,
            params,
        } => apply_server_request(obs, pending_approvals, &profile_id, id, &method, &params),
        Traffic::ServerResponse {
            profile_id,
            id,
            result,
        } => apply_server_response(obs, pending_approvals, &profile_id, id, &result),
        Traffic::ProfileStopped { profile_id } => obs.activity.clear_profile(&profile_id),
    }
}

fn apply_event(obs: &Observers, profile_id: &str, method: &str, params: &Value) {
    log_sql(
        "event log",
        obs.analytics
            .record_event(profile_id, &format!("rpc.event:{method}"), params),
    );

    match method {
        "thread/started" => {
            let model = model_of(params);
            if let Some(record) = ThreadRecord::from_value(profile_id, params) {
                log_sql("thread index", obs.threads.upsert(&record));
                log_sql(
                    "thread meta",
                    obs.analytics.upsert_thread_meta(
                        profile_id,
                        &record.thread_id,
                        model.as_deref(),
                        record.created_at,
                    ),
                );
            }
            log_sql(
                "daily counter",
                obs.analytics
                    .increment_daily("threads_started", profile_id, model.as_deref()),
            );
        }
        "turn/started" => {
            let thread_id = thread_id_of(params);
            let turn_id = turn_id_of(params);
            let model = model_of(params);
            if let Some(thread_id) = &thread_id {
                obs.activity
                    .mark_started(profile_id, thread_id, turn_id.clone());
            }
            if let Some(turn_id) = &turn_id {
                log_sql(
                    "turn meta",
                    obs.analytics.upsert_turn_started(
                        profile_id,
                        turn_id,
                        thread_id.as_deref(),
                        model.as_deref(),
                    ),
                );
            }
            log_sql(
                "daily counter",
                obs.analytics
                    .increment_daily("turns_started", profile_id, model.as_deref()),
            );
        }
        "turn/completed" => {
            let thread_id = thread_id_of(params);
            let turn_id = turn_id_of(params);
            let model = model_of(params);
            let status = status_of(params).unwrap_or_else(|| "completed".to_string());
            if let Some(thread_id) = &thread_id {
                obs.activity.mark_completed(profile_id, thread_id);
            }
            if let Some(turn_id) = &turn_id {
                log_sql(
                    "turn meta",
                    obs.analytics.upsert_turn_completed(
                        profile_id,
                        turn_id,
                        thread_id.as_deref(),
                        &status,
                    ),
                );
            }
            log_sql(
                "daily counter",
                obs.analytics
                    .increment_daily("turns_completed", profile_id, model.as_deref()),
            );
            log_sql(
                "daily counter",
                obs.analytics.increment_daily(
                    &format!("turns_{status}"),
                    profile_id,
                    model.as_deref(),
                ),
            );
        }
        "item/started" => {
            let item_type = item_type_of(params);
            log_sql(
                "daily counter",
                obs.analytics
                    .increment_daily(&format!("items_{item_type}"), profile_id, None),
            );
            if item_type == "enteredReviewMode" {
                begin_review(obs, profile_id, params);
            }
        }
        "item/completed" => {
            let item_type = item_type_of(params);
            log_sql(
                "daily counter",
                obs.analytics.increment_daily(
                    &format!("items_completed_{item_type}"),
                    profile_id,
                    None,
                ),
            );
            if item_type == "exitedReviewMode" {
                complete_review(obs, profile_id, params);
            }
        }
        "thread/tokenUsage/updated" => {
            log_sql(
                "token usage",
                obs.analytics.record_token_usage(
                    profile_id,
                    thread_id_of(params).as_deref(),
                    params,
                ),
            );
        }
        _ => {}
    }
}

fn apply_client_request(obs: &Observers, profile_id: &str, method: &str, params: &Value) {
    log_sql(
        "event log",
        obs.analytics
            .record_event(profile_id, &format!("rpc.request:{method}"), params),
    );

    match method {
        "turn/start" => {
            if let (Some(model), Some(thread_id)) = (model_of(params), thread_id_of(params)) {
                log_sql(
                    "thread meta",
                    obs.analytics
                        .upsert_thread_meta(profile_id, &thread_id, Some(&model), None),
                );
            }
        }
        "command/exec" => log_sql(
            "daily counter",
            obs.analytics
                .increment_daily("command_exec", profile_id, None),
        ),
        "review/start" => log_sql(
            "daily counter",
            obs.analytics
                .increment_daily("reviews_started", profile_id, None),
        ),
        "account/login/start" => {
            let login_type =
                string_field(params, &["type", "mode"]).unwrap_or_else(|| "unknown".to_string());
            log_sql(
                "daily counter",
                obs.analytics.increment_daily(
                    &format!("login_started_{login_type}"),
                    profile_id,
                    None,
                ),
            );
        }
        "thread/archive" => {
            if let Some(thread_id) = thread_id_of(params) {
                log_sql(
                    "thread index",
                    obs.threads.mark_archived(profile_id, &thread_id),
                );
                obs.activity.mark_completed(profile_id, &thread_id);
            }
        }
        _ => {}
    }
}

fn apply_client_response(obs: &Observers, profile_id: &str, method: &str, result: &Value) {
    log_sql(
        "event log",
        obs.analytics
            .record_event(profile_id, &format!("rpc.response:{method}"), result),
    );

    match method {
        "thread/start" | "thread/resume" => {
            if let Some(record) = ThreadRecord::from_value(profile_id, result) {
                log_sql("thread index", obs.threads.upsert(&record));
                log_sql(
                    "thread meta",
                    obs.analytics.upsert_thread_meta(
                        profile_id,
                        &record.thread_id,
                        model_of(result).as_deref(),
                        record.created_at,
                    ),
                );
                if method == "thread/resume" {
                    // A resumed thread with an in-flight turn is active again.
                    let turn = result
                        .get("thread")
                        .and_then(|thread| thread.get("turn"))
                        .or_else(|| result.get("turn"));
                    let in_progress = turn
                        .and_then(|turn| turn.get("status"))
                        .and_then(Value::as_str)
                        == Some("inProgress");
                    if in_progress {
                        let turn_id = turn.and_then(|turn| string_field(turn, &["id", "turnId"]));
                        obs.activity
                            .mark_started(profile_id, &record.thread_id, turn_id);
                    } else {
                        obs.activity.mark_completed(profile_id, &record.thread_id);
                    }
                }
            }
        }
        "thread/list" => {
            for row in thread_rows(result) {
                if let Some(record) = ThreadRecord::from_value(profile_id, row) {
                    log_sql("thread index", obs.threads.upsert(&record));
                }
            }
        }
        _ => {}
    }
}

fn apply_server_request(
    obs: &Observers,
    pending_approvals: &mut HashSet<(String, i64)>,
    profile_id: &str,
    id: i64,
    method: &str,
    params: &Value,
) {
    log_sql(
        "event log",
        obs.analytics
            .record_event(profile_id, &format!("rpc.serverRequest:{method}"), params),
    );

    if let Some(approval_type) = approval_type(method) {
        log_sql(
            "approval request",
            obs.analytics.record_approval_request(
                profile_id,
                id,
                &approval_type,
                thread_id_of(params).as_deref(),
                item_id_of(params).as_deref(),
            ),
        );
        log_sql(
            "daily counter",
            obs.analytics.increment_daily(
                &format!("approvals_requested_{approval_type}"),
                profile_id,
                None,
            ),
        );
        pending_approvals.insert((profile_id.to_string(), id));
    }
}

fn apply_server_response(
    obs: &Observers,
    pending_approvals: &mut HashSet<(String, i64)>,
    profile_id: &str,
    id: i64,
    result: &Value,
) {
    if !pending_approvals.remove(&(profile_id.to_string(), id)) {
        log_sql(
            "event log",
            obs.analytics.record_event(profile_id, "rpc.response", result),
        );
        return;
    }

    let decision = result
        .get("decision")
        .and_then(Value::as_str)
        .or_else(|| result.as_str())
        .unwrap_or("unknown")
        .to_string();
    log_sql(
        "event log",
        obs.analytics
            .record_event(profile_id, "approval.decision", result),
    );
    log_sql(
        "approval decision",
        obs.analytics
            .record_approval_decision(profile_id, id, &decision),
    );
    log_sql(
        "daily counter",
        obs.analytics
            .increment_daily(&format!("approvals_{decision}"), profile_id, None),
    );
}

fn begin_review(obs: &Observers, profile_id: &str, params: &Value) {
    let item = params.get("item").unwrap_or(params);
    let thread_id = thread_id_of(params);
    let item_id = string_field(item, &["id", "itemId"]);
    let turn_id = turn_id_of(params);
    let session_id = review_session_id(&thread_id, &item_id, &turn_id);
    log_sql(
        "review session",
        obs.reviews.begin(
            profile_id,
            &ReviewStart {
                id: &session_id,
                thread_id: thread_id.as_deref(),
                item_id: item_id.as_deref(),
                label: string_field(item, &["label", "prompt"]).as_deref(),
                model: model_of(params).as_deref(),
                cwd: string_field(item, &["cwd"])
                    .or_else(|| string_field(params, &["cwd"]))
                    .as_deref(),
            },
        ),
    );
}

fn complete_review(obs: &Observers, profile_id: &str, params: &Value) {
    let item = params.get("item").unwrap_or(params);
    let thread_id = thread_id_of(params);
    let item_id = string_field(item, &["id", "itemId"]);
    let turn_id = turn_id_of(params);
    let session_id = review_session_id(&thread_id, &item_id, &turn_id);
    let status = match string_field(item, &["status"]).as_deref() {
        Some("failed") => "failed",
        _ => "completed",
    };
    log_sql(
        "review session",
        obs.reviews.complete(
            profile_id,
            &session_id,
            thread_id.as_deref(),
            item_id.as_deref(),
            status,
            item.get("review"),
        ),
    );
}

/// turnId first, then the item id, then a synthetic `{threadId}-{now}`.
fn review_session_id(
    thread_id: &Option<String>,
    item_id: &Option<String>,
    turn_id: &Option<String>,
) -> String {
    turn_id
        .clone()
        .or_else(|| item_id.clone())
        .unwrap_or_else(|| {
            format!("{}-{}", thread_id.clone().unwrap_or_default(), now_ms())
        })
}

/// `item/<kind>/requestApproval` methods drive the approval bookkeeping.
fn approval_type(method: &str) -> Option<String> {
    let kind = method
        .strip_prefix("item/")?
        .strip_suffix("/requestApproval")?;
    let mapped = match kind {
        "commandExecution" => "command",
        "applyPatch" => "patch",
        other => other,
    };
    Some(mapped.to_string())
}

fn thread_rows(result: &Value) -> Vec<&Value> {
    let page = result
        .get("threads")
        .or_else(|| result.get("items"))
        .unwrap_or(result);
    page.as_array()
        .map(|rows| rows.iter().collect())
        .unwrap_or_default()
}

fn thread_id_of(value: &Value) -> Option<String> {
    string_field(value, &["threadId", "thread_id"])
        .or_else(|| value.get("thread").and_then(|t| string_field(t, &["id"])))
}

fn turn_id_of(value: &Value) -> Option<String> {
    value
        .get("turn")
        .and_then(|turn| string_field(turn, &["id"]))
        .or_else(|| string_field(value, &["turnId", "turn_id"]))
}

fn item_id_of(value: &Value) -> Option<String> {
    string_field(value, &["itemId", "item_id"])
        .or_else(|| value.get("item").and_then(|item| string_field(item, &["id"])))
}

fn model_of(value: &Value) -> Option<String> {
    string_field(value, &["model"])
        .or_else(|| value.get("turn").and_then(|turn| string_field(turn, &["model"])))
        .or_else(|| {
            value
                .get("thread")
                .and_then(|thread| string_field(thread, &["model"]))
        })
}

fn status_of(value: &Value) -> Option<String> {
    value
        .get("turn")
        .and_then(|turn| string_field(turn, &["status"]))
        .or_else(|| string_field(value, &["status"]))
}

fn item_type_of(value: &Value) -> String {
    value
        .get("item")
        .and_then(|item| string_field(item, &["type", "itemType", "item_type"]))
        .or_else(|| string_field(value, &["itemType", "item_type"]))
        .unwrap_or_else(|| "unknown".to_string())
}

fn log_sql(context: &str, result: rusqlite::Result<()>) {
    if let Err(err) = result {
        warn!("{context} write failed: {err}");
    }
}
