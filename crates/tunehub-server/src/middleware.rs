//! Admission middleware: gates every request through the pipeline.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Json;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderValue, StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use tracing::debug;
use tunehub_admission::{AdmissionRequest, ClientKey, Verdict};

use crate::config::ServerConfig;
use crate::state::AppState;

const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// JSON body returned for denied requests.
#[derive(Debug, Serialize)]
pub struct DenyResponse {
    /// Always 403.
    pub code: u16,
    /// User-facing explanation.
    pub message: String,
    /// Machine-readable deny reason.
    pub reason: &'static str,
    /// Seconds until a lockout lifts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

/// Derive the client key for a request.
///
/// With `trust_forwarded`, the first `X-Forwarded-For` hop wins. Otherwise
/// (or when the header is absent) the socket peer address is used. Requests
/// with neither share the `unknown` bucket.
pub fn client_key(request: &Request, trust_forwarded: bool) -> ClientKey {
    if trust_forwarded {
        let first_hop = request
            .headers()
            .get(X_FORWARDED_FOR)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|hop| !hop.is_empty());
        if let Some(hop) = first_hop {
            return ClientKey::new(hop);
        }
    }

    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map_or_else(ClientKey::unknown, |ConnectInfo(addr)| ClientKey::from(addr.ip()))
}

fn admission_request(request: &Request, key: ClientKey) -> AdmissionRequest {
    AdmissionRequest {
        key,
        path: request.uri().path().to_string(),
        method: request.method().to_string(),
        user_agent: request
            .headers()
            .get(header::USER_AGENT)
            .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned()),
    }
}

fn deny_response(verdict: &Verdict) -> Response {
    let body = DenyResponse {
        code: StatusCode::FORBIDDEN.as_u16(),
        message: verdict.message(),
        reason: verdict.reason.map_or("denied", |r| r.as_str()),
        retry_after: verdict.retry_after_secs,
    };

    let mut response = (StatusCode::FORBIDDEN, Json(body)).into_response();
    if let Some(secs) = verdict.retry_after_secs {
        response
            .headers_mut()
            .insert(header::RETRY_AFTER, HeaderValue::from(secs));
    }
    response
}

/// `Access-Control-Allow-Origin` for a denial, matching the CORS layer.
/// Denials are produced outside that layer.
fn allowed_origin(config: &ServerConfig, origin: Option<&HeaderValue>) -> Option<HeaderValue> {
    let origin = origin?;
    if config.cors_origins.is_empty() {
        return Some(HeaderValue::from_static("*"));
    }
    let requested = origin.to_str().ok()?;
    config
        .cors_origins
        .iter()
        .any(|o| o == requested)
        .then(|| origin.clone())
}

/// Evaluate the request, short-circuit denials, and record the outcome.
///
/// Admitted requests run the inner service; the access-log record is
/// completed with its status. If the request future is dropped first the
/// record is written as cancelled. On login paths a 2xx response counts as a
/// successful login and a 401 as a failed one.
pub async fn admission_middleware(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let pipeline = state.pipeline();
    let key = client_key(&request, state.config().trust_forwarded);
    let admission_request = admission_request(&request, key);

    let (verdict, ticket) = pipeline.evaluate(&admission_request).into_parts();
    if !verdict.allow {
        let mut response = deny_response(&verdict);
        let origin = request.headers().get(header::ORIGIN);
        if let Some(allow) = allowed_origin(state.config(), origin) {
            let headers = response.headers_mut();
            if allow != "*" {
                headers.insert(header::VARY, HeaderValue::from_static("origin"));
            }
            headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, allow);
        }
        return response;
    }

    let response = next.run(request).await;
    let status = response.status();

    if let Some(ticket) = ticket {
        ticket.complete(status.as_u16());
    }

    if pipeline.config().is_login_path(&admission_request.path) {
        let key = &admission_request.key;
        if status.is_success() {
            pipeline.report_login_outcome(key, true);
        } else if status == StatusCode::UNAUTHORIZED {
            pipeline.report_login_outcome(key, false);
        } else {
            debug!(key = %key, status = status.as_u16(), "Login response is not a credential outcome");
        }
    }

    response
}
