//! HTTP server lifecycle.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{ServerError, ServerResult};
use crate::routes::create_router_with;
use crate::state::AppState;

/// HTTP front for the admission gate.
///
/// Serves the built-in routes plus any embedded application router, all
/// behind the admission middleware.
#[derive(Debug, Clone)]
pub struct TunehubServer {
    state: Arc<AppState>,
    app: Router,
}

impl TunehubServer {
    /// Create a server with only the built-in routes.
    #[must_use]
    pub fn new(state: Arc<AppState>) -> Self {
        Self::with_app(state, Router::new())
    }

    /// Create a server that also serves `app` behind the gate.
    #[must_use]
    pub fn with_app(state: Arc<AppState>, app: Router) -> Self {
        Self { state, app }
    }

    /// Get the shared state.
    #[must_use]
    pub fn state(&self) -> Arc<AppState> {
        self.state.clone()
    }

    /// Create the router without starting the server.
    pub fn router(&self) -> Router {
        create_router_with(self.state.clone(), self.app.clone())
    }

    /// Start the server and run until a fatal error.
    pub async fn serve(&self, addr: SocketAddr) -> ServerResult<()> {
        self.serve_with_shutdown(addr, std::future::pending()).await
    }

    /// Start the server with graceful shutdown support.
    ///
    /// The server shuts down when `shutdown` completes.
    pub async fn serve_with_shutdown<F>(&self, addr: SocketAddr, shutdown: F) -> ServerResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::BindFailed(addr, e))?;

        info!(addr = %addr, "TuneHub gate listening");

        let sweeper = spawn_sweeper(self.state.clone(), self.state.config().sweep_interval);
        let service = self.router().into_make_service_with_connect_info::<SocketAddr>();

        let result = axum::serve(listener, service)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| ServerError::Internal(e.to_string()));

        sweeper.abort();
        info!("TuneHub gate shut down");
        result
    }
}

/// Periodically drop idle admission state. Expiry is checked on every read,
/// so this only bounds memory.
fn spawn_sweeper(state: Arc<AppState>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let removed = state.pipeline().sweep();
            debug!(removed = removed, "Admission state swept");
        }
    })
}

/// Resolves on Ctrl+C.
pub async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use tunehub_admission::AdmissionConfig;

    fn make_test_server() -> TunehubServer {
        let state = AppState::in_memory(ServerConfig::default(), AdmissionConfig::default()).unwrap();
        TunehubServer::new(Arc::new(state))
    }

    #[test]
    fn test_server_clone_shares_state() {
        let server = make_test_server();
        let cloned = server.clone();

        assert!(Arc::ptr_eq(&server.state(), &cloned.state()));
    }

    #[tokio::test]
    async fn test_router_creation() {
        let server = make_test_server();
        let _router = server.router();
    }

    #[tokio::test]
    async fn test_serve_with_shutdown() {
        let server = make_test_server();
        let addr = SocketAddr::from(([127, 0, 0, 1], 0));

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

        let server_handle = tokio::spawn(async move {
            server
                .serve_with_shutdown(addr, async move {
                    let _ = shutdown_rx.await;
                })
                .await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        let _ = shutdown_tx.send(());

        let result = tokio::time::timeout(Duration::from_secs(1), server_handle).await;
        assert!(matches!(result, Ok(Ok(Ok(())))));
    }

    #[tokio::test]
    async fn test_serve_bind_failure() {
        let server = make_test_server();

        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = taken.local_addr().unwrap();

        let result = server.serve(addr).await;
        assert!(matches!(result, Err(ServerError::BindFailed(a, _)) if a == addr));
    }
}
