//! Route configuration.

use std::sync::Arc;

use axum::middleware;
use axum::routing::{Router, delete, get};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::config::ServerConfig;
use crate::handlers::{
    create_ban, delete_ban, get_stats, get_status, health_check, list_access_logs, list_bans,
    require_admin,
};
use crate::middleware::admission_middleware;
use crate::state::AppState;

/// Create the router with only the built-in routes.
pub fn create_router(state: Arc<AppState>) -> Router {
    create_router_with(state, Router::new())
}

/// Create the router, merging `app` under the admission gate.
///
/// Every request, including unmatched ones and CORS preflights, passes
/// through the admission middleware first. The `/admin` routes are mounted
/// only when a bearer token is configured.
pub fn create_router_with(state: Arc<AppState>, app: Router) -> Router {
    let cors = build_cors_layer(state.config());

    let mut router = Router::new()
        .route("/health", get(health_check))
        .route("/status", get(get_status));

    if state.config().admin_token.is_some() {
        let admin_routes = Router::new()
            .route("/bans", get(list_bans).post(create_ban))
            .route("/bans/{ip}", delete(delete_ban))
            .route("/stats", get(get_stats))
            .route("/access-logs", get(list_access_logs))
            .route_layer(middleware::from_fn_with_state(state.clone(), require_admin));
        router = router.nest("/admin", admin_routes);
    } else {
        warn!("No admin token configured, admin API disabled");
    }

    router
        .with_state(state.clone())
        .merge(app)
        .layer(cors)
        .layer(middleware::from_fn_with_state(state, admission_middleware))
        .layer(TraceLayer::new_for_http())
}

/// Build the CORS layer based on configuration.
fn build_cors_layer(config: &ServerConfig) -> CorsLayer {
    if config.cors_origins.is_empty() {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<_> = config
            .cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();

        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    }
}
