//! HTTP request handlers.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, Request, State};
use axum::http::{StatusCode, header};
use axum::middleware::Next;
use axum::response::Response;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tracing::info;
use tunehub_admission::{AccessLogEntry, AccessLogStats, BanEntry, ClientKey, Clock};

use crate::error::{ServerError, ServerResult};
use crate::state::AppState;

const DEFAULT_LOG_LIMIT: usize = 100;
const MAX_LOG_LIMIT: usize = 1000;
const TOP_OFFENDERS: usize = 10;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Status message.
    pub status: String,
    /// Server uptime in seconds.
    pub uptime_secs: u64,
}

/// Service status response.
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    /// Crate version.
    pub version: &'static str,
    /// Server uptime in seconds.
    pub uptime_secs: u64,
    /// Requests allowed per window.
    pub rate_limit_max_requests: u32,
    /// Window length in seconds.
    pub rate_limit_window_secs: u64,
}

/// Body of `POST /admin/bans`.
#[derive(Debug, Deserialize)]
pub struct BanRequest {
    /// Client key to ban (normally an IP address).
    pub ip: String,
    /// Why the client is banned.
    #[serde(default)]
    pub reason: Option<String>,
    /// Ban length in hours; omitted means permanent.
    #[serde(default)]
    pub duration_hours: Option<u32>,
}

/// Response of `DELETE /admin/bans/{ip}`.
#[derive(Debug, Serialize)]
pub struct UnbanResponse {
    /// The client key.
    pub ip: String,
    /// Always true; a missing ban is a 404.
    pub removed: bool,
}

/// One row of the top-offenders table.
#[derive(Debug, Serialize)]
pub struct Offender {
    /// Client key.
    pub ip: ClientKey,
    /// Denied requests.
    pub blocked: u64,
}

/// Response of `GET /admin/stats`.
#[derive(Debug, Serialize)]
pub struct StatsResponse {
    /// Requests recorded.
    pub total_requests: u64,
    /// Requests recorded today (UTC).
    pub today_requests: u64,
    /// Requests denied.
    pub blocked_requests: u64,
    /// Clients with the most denials.
    pub top_blocked: Vec<Offender>,
    /// Live bans.
    pub active_bans: usize,
    /// Clients with a live rate-limit bucket.
    pub active_rate_limit_buckets: usize,
    /// Clients locked out of login.
    pub locked_keys: usize,
    /// Reputation-store failures.
    pub storage_errors: u64,
    /// Access-log write failures.
    pub log_write_failures: u64,
    /// Bans issued automatically.
    pub escalated_bans: u64,
}

/// Query parameters for the access-log listing.
#[derive(Debug, Deserialize)]
pub struct LogQuery {
    /// Maximum number of records (newest first).
    pub limit: Option<usize>,
}

/// Handle GET /health.
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs: state.uptime_secs(),
    })
}

/// Handle GET /status.
pub async fn get_status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let config = state.pipeline().config();
    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: state.uptime_secs(),
        rate_limit_max_requests: config.rate_limit.max_requests,
        rate_limit_window_secs: config.rate_limit.window_secs,
    })
}

/// Reject admin requests without the configured bearer token. With no
/// token configured every admin request is rejected.
pub async fn require_admin(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> ServerResult<Response> {
    let Some(expected) = &state.config().admin_token else {
        return Err(ServerError::Unauthorized);
    };
    let presented = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or_default();

    if !bool::from(presented.as_bytes().ct_eq(expected.as_bytes())) {
        return Err(ServerError::Unauthorized);
    }
    Ok(next.run(request).await)
}

/// Handle GET /admin/bans.
pub async fn list_bans(State(state): State<Arc<AppState>>) -> ServerResult<Json<Vec<BanEntry>>> {
    Ok(Json(state.pipeline().list_bans()?))
}

/// Handle POST /admin/bans.
pub async fn create_ban(
    State(state): State<Arc<AppState>>,
    Json(body): Json<BanRequest>,
) -> ServerResult<(StatusCode, Json<BanEntry>)> {
    let key = ClientKey::new(&body.ip);
    if key.is_unknown() {
        return Err(ServerError::InvalidRequest("ip must not be empty".into()));
    }
    let reason = body
        .reason
        .filter(|r| !r.trim().is_empty())
        .unwrap_or_else(|| "manual ban".to_string());

    let entry = state.pipeline().ban(&key, reason, body.duration_hours)?;
    info!(key = %key, reason = %entry.reason, expires_at = ?entry.expires_at, "Ban added");
    Ok((StatusCode::CREATED, Json(entry)))
}

/// Handle DELETE /admin/bans/{ip}.
pub async fn delete_ban(
    State(state): State<Arc<AppState>>,
    Path(ip): Path<String>,
) -> ServerResult<Json<UnbanResponse>> {
    let key = ClientKey::new(&ip);
    if !state.pipeline().unban(&key)? {
        return Err(ServerError::NotFound("ban".to_string(), ip));
    }
    info!(key = %key, "Ban removed");
    Ok(Json(UnbanResponse { ip, removed: true }))
}

/// Handle GET /admin/stats.
pub async fn get_stats(State(state): State<Arc<AppState>>) -> ServerResult<Json<StatsResponse>> {
    let pipeline = state.pipeline();
    let summary = state
        .access_log()
        .summary(pipeline.clock().now(), TOP_OFFENDERS)?;
    let stats = pipeline.stats();

    Ok(Json(StatsResponse {
        total_requests: summary.total,
        today_requests: summary.today,
        blocked_requests: summary.blocked,
        top_blocked: summary
            .top_blocked
            .into_iter()
            .map(|(ip, blocked)| Offender { ip, blocked })
            .collect(),
        active_bans: pipeline.list_bans()?.len(),
        active_rate_limit_buckets: pipeline.active_rate_limit_buckets(),
        locked_keys: pipeline.locked_key_count(),
        storage_errors: stats.storage_errors,
        log_write_failures: stats.log_write_failures,
        escalated_bans: stats.escalated_bans,
    }))
}

/// Handle GET /admin/access-logs.
pub async fn list_access_logs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LogQuery>,
) -> ServerResult<Json<Vec<AccessLogEntry>>> {
    let limit = query.limit.unwrap_or(DEFAULT_LOG_LIMIT).min(MAX_LOG_LIMIT);
    Ok(Json(state.access_log().recent(limit)?))
}
