use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::Json;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;
use tokio_stream::StreamExt;
use tracing::debug;

use tailcast_core::types::{Destination, SessionId};
use tailcast_core::TailcastError;
use tailcast_index::{SearchQuery, SearchSort};

use crate::state::{AppState, AttachRequest};

const SSE_KEEPALIVE: Duration = Duration::from_secs(15);

fn error_status(e: &TailcastError) -> StatusCode {
    match e {
        TailcastError::InvalidDestination(_) => StatusCode::BAD_REQUEST,
        TailcastError::BotNotConfigured(_) => StatusCode::UNAUTHORIZED,
        TailcastError::BadCredentials { .. } => StatusCode::FORBIDDEN,
        TailcastError::SessionFileNotFound(_)
        | TailcastError::SessionNotFound(_)
        | TailcastError::DestinationNotAttached(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(e: TailcastError) -> (StatusCode, Json<serde_json::Value>) {
    (
        error_status(&e),
        Json(serde_json::json!({ "error": e.to_string() })),
    )
}

/// Rate-limit key: forwarded client address when present, else a fixed
/// local key.
fn client_key(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .unwrap_or_else(|| "local".to_string())
}

fn rate_limited(retry_after: u64) -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::TOO_MANY_REQUESTS,
        Json(serde_json::json!({ "error": "rate limited", "retry_after": retry_after })),
    )
}

#[derive(Deserialize)]
pub struct AttachBody {
    pub session_id: String,
    #[serde(default)]
    pub path: Option<PathBuf>,
    pub destination: Destination,
    #[serde(default)]
    pub replay_count: Option<usize>,
}

// POST /attach
pub async fn attach(
    State(state): State<Arc<AppState>>,
    Json(body): Json<AttachBody>,
) -> impl IntoResponse {
    let request = AttachRequest {
        session_id: SessionId::from_str(&body.session_id),
        path: body.path,
        destination: body.destination,
        replay_count: body.replay_count.unwrap_or(0),
    };
    match state.api.attach(request).await {
        Ok(outcome) => (
            StatusCode::CREATED,
            Json(serde_json::json!({
                "attached": outcome.attached,
                "replayed_events": outcome.replayed_events,
            })),
        ),
        Err(e) => error_response(e),
    }
}

#[derive(Deserialize)]
pub struct DetachBody {
    pub session_id: String,
    pub destination: Destination,
}

// POST /detach
pub async fn detach(
    State(state): State<Arc<AppState>>,
    Json(body): Json<DetachBody>,
) -> axum::response::Response {
    let session_id = SessionId::from_str(&body.session_id);
    match state.api.detach(&session_id, &body.destination).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

// GET /sessions
pub async fn list_sessions(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let sessions: Vec<serde_json::Value> = state
        .manager
        .list()
        .into_iter()
        .map(|(session_id, destinations)| {
            let dests: Vec<serde_json::Value> = destinations
                .iter()
                .map(|d| {
                    serde_json::json!({
                        "kind": d.destination.kind(),
                        "identifier": d.destination.identifier(),
                        "attached_at": d.attached_at,
                    })
                })
                .collect();
            serde_json::json!({
                "session_id": session_id.to_string(),
                "destinations": dests,
                "subscribers": state.broker.subscriber_count(&session_id),
            })
        })
        .collect();
    Json(serde_json::json!({ "sessions": sessions }))
}

// GET /sessions/{id}/events, the SSE stream
pub async fn session_events(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, StatusCode> {
    let session_id = SessionId::from_str(&id);
    if !state.api.is_watched(&session_id) {
        return Err(StatusCode::NOT_FOUND);
    }

    let last_event_id = headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    debug!(session = %session_id, last_event_id = ?last_event_id, "SSE connect");

    let stream = state
        .broker
        .subscribe(&session_id, last_event_id.as_deref())
        .map(Ok::<_, Infallible>);

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(SSE_KEEPALIVE)
            .text("keepalive"),
    ))
}

#[derive(Deserialize)]
pub struct PreviewQuery {
    #[serde(default = "default_preview_limit")]
    pub limit: usize,
}

fn default_preview_limit() -> usize {
    20
}

// GET /sessions/{id}/preview?limit=N
pub async fn session_preview(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<PreviewQuery>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if let Err(retry_after) = state.preview_limiter.check(&client_key(&headers)) {
        return rate_limited(retry_after);
    }
    let session_id = SessionId::from_str(&id);
    match state.api.preview(&session_id, query.limit).await {
        Ok(rendered) => (
            StatusCode::OK,
            Json(serde_json::json!({ "preview": rendered })),
        ),
        Err(e) => error_response(e),
    }
}

#[derive(Deserialize)]
pub struct SearchParams {
    #[serde(default)]
    pub q: Option<String>,
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub since: Option<String>,
    #[serde(default)]
    pub until: Option<String>,
    #[serde(default)]
    pub sort: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: Option<usize>,
}

fn parse_date(s: &str, end_of_day: bool) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()?;
    let time = if end_of_day {
        date.and_hms_opt(23, 59, 59)?
    } else {
        date.and_hms_opt(0, 0, 0)?
    };
    Some(DateTime::from_naive_utc_and_offset(time, Utc))
}

// GET /search
pub async fn search(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SearchParams>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if let Err(retry_after) = state.search_limiter.check(&client_key(&headers)) {
        return rate_limited(retry_after);
    }
    let Some(index) = &state.index else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "error": "search index unavailable" })),
        );
    };

    let since = match params.since.as_deref().map(|s| parse_date(s, false)) {
        Some(None) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": "invalid since date" })),
            )
        }
        Some(parsed) => parsed,
        None => None,
    };
    let until = match params.until.as_deref().map(|s| parse_date(s, true)) {
        Some(None) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": "invalid until date" })),
            )
        }
        Some(parsed) => parsed,
        None => None,
    };

    let sort = match params.sort.as_deref() {
        Some(raw) => match SearchSort::parse(raw) {
            Some(sort) => sort,
            None => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(serde_json::json!({ "error": "invalid sort" })),
                )
            }
        },
        None => SearchSort::parse(&state.search.default_sort).unwrap_or_default(),
    };

    let limit = params
        .limit
        .unwrap_or(state.search.default_limit)
        .min(state.search.max_limit);

    let query = SearchQuery {
        query: params.q.unwrap_or_default(),
        project: params.project,
        since,
        until,
        sort,
        limit,
        offset: params.offset.unwrap_or(0),
    };

    match index.search(&query) {
        Ok(results) => {
            let rows: Vec<serde_json::Value> = results
                .iter()
                .map(|r| {
                    serde_json::json!({
                        "session_id": r.session.session_id,
                        "project": r.session.project_display_name,
                        "project_path": r.session.project_path,
                        "summary": r.session.summary,
                        "file_path": r.session.file_path,
                        "modified_at": r.session.file_modified_at,
                        "size_bytes": r.session.size_bytes,
                        "line_count": r.session.line_count,
                        "duration_ms": r.session.duration_ms,
                        "score": r.score,
                    })
                })
                .collect();
            (
                StatusCode::OK,
                Json(serde_json::json!({ "results": rows, "count": rows.len() })),
            )
        }
        Err(e) => error_response(e),
    }
}

// GET /projects
pub async fn projects(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let Some(index) = &state.index else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "error": "search index unavailable" })),
        );
    };
    match index.project_stats() {
        Ok(stats) => {
            let rows: Vec<serde_json::Value> = stats
                .iter()
                .map(|p| {
                    serde_json::json!({
                        "project": p.project_display_name,
                        "project_path": p.project_path,
                        "sessions": p.session_count,
                        "last_modified": p.last_modified,
                    })
                })
                .collect();
            (StatusCode::OK, Json(serde_json::json!({ "projects": rows })))
        }
        Err(e) => error_response(e),
    }
}

// POST /index/refresh, limited globally to one per minute
pub async fn index_refresh(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    if let Err(retry_after) = state.refresh_limiter.check("global") {
        return rate_limited(retry_after);
    }
    match state.api.refresh_index().await {
        Ok(()) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({ "status": "refresh started" })),
        ),
        Err(e) => error_response(e),
    }
}

// GET /health
pub async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let index_health = match &state.index {
        Some(index) => serde_json::json!({
            "sessions": index.session_count().unwrap_or(0),
            "projects": index.project_stats().map(|p| p.len()).unwrap_or(0),
            "fts_enabled": index.fts_enabled(),
            "last_refresh": index.metadata("last_refresh").ok().flatten(),
        }),
        None => serde_json::json!(null),
    };
    Json(serde_json::json!({
        "status": "ok",
        "sessions_watched": state.api.sessions_watched(),
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "bots": state.api.bot_status(),
        "index": index_health,
    }))
}
