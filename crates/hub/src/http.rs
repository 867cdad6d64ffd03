//! HTTP surface: thread search and activity, reindexing, analytics series,
//! review listings, profile CRUD, and the config.toml MCP-server editor.
//! Everything except `/healthz` and `/ws` sits behind the shared bearer
//! token.

use axum::{
    extract::{Path, Query, Request, State},
    http::{HeaderMap, StatusCode, Uri},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::{
    config_toml::{ConfigTomlEditor, ConfigTomlError, McpServerDefinition},
    error::HubError,
    state::AppState,
    stores::threads::ThreadSearchQuery,
    ws,
};

pub fn build_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/threads/search", get(threads_search))
        .route("/threads/active", get(threads_active))
        .route("/threads/reindex", post(threads_reindex))
        .route("/analytics/daily", get(analytics_daily))
        .route("/reviews", get(reviews_list))
        .route("/profiles", get(profiles_list).post(profiles_create))
        .route("/profiles/:id", delete(profiles_delete))
        .route("/profiles/:id/mcp-servers", get(mcp_servers_list))
        .route(
            "/profiles/:id/mcp-servers/:name",
            put(mcp_servers_upsert).delete(mcp_servers_remove),
        )
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_token,
        ));

    Router::new()
        .route("/healthz", get(healthz))
        .route("/ws", get(ws::ws_handler))
        .merge(api)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn require_token(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let token = state.config.token.as_str();
    let authorized = bearer_token(request.headers()) == Some(token)
        || query_token(request.uri()).as_deref() == Some(token);
    if !authorized {
        return error_response(StatusCode::UNAUTHORIZED, "unauthorized");
    }
    next.run(request).await
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

fn query_token(uri: &Uri) -> Option<String> {
    uri.query()?
        .split('&')
        .find_map(|pair| pair.strip_prefix("token=").map(str::to_string))
}

async fn healthz() -> Json<Value> {
    Json(json!({ "ok": true }))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ThreadSearchParams {
    query: Option<String>,
    profile_id: Option<String>,
    model: Option<String>,
    status: Option<String>,
    created_after: Option<i64>,
    created_before: Option<i64>,
    limit: Option<u32>,
    offset: Option<u32>,
}

async fn threads_search(
    State(state): State<AppState>,
    Query(params): Query<ThreadSearchParams>,
) -> Response {
    let query = ThreadSearchQuery {
        query: params.query,
        profile_id: params.profile_id,
        model: params.model,
        status: params.status,
        created_after: params.created_after,
        created_before: params.created_before,
        limit: params.limit,
        offset: params.offset,
    };
    match state.threads.search(&query) {
        Ok(threads) => Json(json!({ "threads": threads })).into_response(),
        Err(err) => storage_error(err),
    }
}

async fn threads_active(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "threads": state.activity.list() }))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ReindexRequest {
    profile_id: Option<String>,
    limit: Option<u32>,
    auto_start: Option<bool>,
}

/// Walks profiles, asks each running (or auto-started) child for its thread
/// list, and feeds the pages through the regular observer path.
async fn threads_reindex(
    State(state): State<AppState>,
    Json(request): Json<ReindexRequest>,
) -> Response {
    let profiles = match &request.profile_id {
        Some(id) => match state.profiles.get(id) {
            Some(profile) => vec![profile],
            None => {
                return error_response(
                    StatusCode::NOT_FOUND,
                    &format!("unknown profile `{id}`"),
                )
            }
        },
        None => state.profiles.list(),
    };
    let auto_start = request.auto_start.unwrap_or(false);
    let limit = request.limit.unwrap_or(100);

    let mut indexed = 0usize;
    let mut scanned: Vec<String> = Vec::new();
    for profile in profiles {
        if !state.supervisor.is_running(&profile.id).await {
            if !auto_start {
                continue;
            }
            if let Err(err) = state.supervisor.start(&profile).await {
                warn!(profile_id = %profile.id, "reindex could not start app-server: {err}");
                continue;
            }
        }

        match state
            .supervisor
            .request(&profile.id, "thread/list", json!({ "limit": limit }))
            .await
        {
            Ok(result) => {
                indexed += thread_page_len(&result);
                state
                    .observer
                    .client_response(&profile.id, "thread/list", &result);
                scanned.push(profile.id.clone());
            }
            Err(err) => {
                warn!(profile_id = %profile.id, "thread/list failed during reindex: {err}")
            }
        }
    }

    Json(json!({ "profiles": scanned, "indexed": indexed })).into_response()
}

fn thread_page_len(result: &Value) -> usize {
    result
        .get("threads")
        .or_else(|| result.get("items"))
        .unwrap_or(result)
        .as_array()
        .map(Vec::len)
        .unwrap_or(0)
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct DailyParams {
    metric: Option<String>,
    profile_id: Option<String>,
    model: Option<String>,
    days: Option<u32>,
}

async fn analytics_daily(
    State(state): State<AppState>,
    Query(params): Query<DailyParams>,
) -> Response {
    let Some(metric) = params.metric.filter(|metric| !metric.is_empty()) else {
        return error_response(StatusCode::BAD_REQUEST, "metric is required");
    };
    let days = params.days.unwrap_or(365);
    match state.analytics.daily_series(
        &metric,
        params.profile_id.as_deref(),
        params.model.as_deref(),
        days,
    ) {
        Ok(series) => Json(json!({ "metric": metric, "series": series })).into_response(),
        Err(err) => storage_error(err),
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ReviewsParams {
    profile_id: Option<String>,
    limit: Option<u32>,
    offset: Option<u32>,
}

async fn reviews_list(
    State(state): State<AppState>,
    Query(params): Query<ReviewsParams>,
) -> Response {
    match state
        .reviews
        .list(params.profile_id.as_deref(), params.limit, params.offset)
    {
        Ok(reviews) => Json(json!({ "reviews": reviews })).into_response(),
        Err(err) => storage_error(err),
    }
}

async fn profiles_list(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "profiles": state.profiles.list() }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateProfileRequest {
    name: String,
    #[serde(default)]
    codex_home: Option<std::path::PathBuf>,
}

async fn profiles_create(
    State(state): State<AppState>,
    Json(request): Json<CreateProfileRequest>,
) -> Response {
    if request.name.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "name must not be empty");
    }
    match state.profiles.create(request.name.trim(), request.codex_home) {
        Ok(profile) => (StatusCode::CREATED, Json(profile)).into_response(),
        Err(err) => hub_error(err),
    }
}

async fn profiles_delete(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.profiles.remove(&id) {
        Ok(()) => {
            state.supervisor.stop(&id).await;
            state.observer.profile_stopped(&id);
            StatusCode::NO_CONTENT.into_response()
        }
        Err(err) => hub_error(err),
    }
}

async fn mcp_servers_list(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let Some(profile) = state.profiles.get(&id) else {
        return error_response(StatusCode::NOT_FOUND, &format!("unknown profile `{id}`"));
    };
    match ConfigTomlEditor::for_home(&profile.codex_home).list() {
        Ok(servers) => Json(json!({ "servers": servers })).into_response(),
        Err(err) => config_error(err),
    }
}

async fn mcp_servers_upsert(
    State(state): State<AppState>,
    Path((id, name)): Path<(String, String)>,
    Json(definition): Json<McpServerDefinition>,
) -> Response {
    let Some(profile) = state.profiles.get(&id) else {
        return error_response(StatusCode::NOT_FOUND, &format!("unknown profile `{id}`"));
    };
    match ConfigTomlEditor::for_home(&profile.codex_home).upsert(&name, &definition) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => config_error(err),
    }
}

async fn mcp_servers_remove(
    State(state): State<AppState>,
    Path((id, name)): Path<(String, String)>,
) -> Response {
    let Some(profile) = state.profiles.get(&id) else {
        return error_response(StatusCode::NOT_FOUND, &format!("unknown profile `{id}`"));
    };
    match ConfigTomlEditor::for_home(&profile.codex_home).remove(&name) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => config_error(err),
    }
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

fn storage_error(err: rusqlite::Error) -> Response {
    warn!("storage query failed: {err}");
    error_response(StatusCode::INTERNAL_SERVER_ERROR, "storage failure")
}

fn hub_error(err: HubError) -> Response {
    let status = match &err {
        HubError::UnknownProfile(_) => StatusCode::NOT_FOUND,
        HubError::DefaultProfileProtected => StatusCode::FORBIDDEN,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(status, &err.to_string())
}

fn config_error(err: ConfigTomlError) -> Response {
    let status = match &err {
        ConfigTomlError::NotFound(_) => StatusCode::NOT_FOUND,
        ConfigTomlError::Parse { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(status, &err.to_string())
}
