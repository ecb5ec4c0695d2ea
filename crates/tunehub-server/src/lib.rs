//! # tunehub-server
//!
//! HTTP front for the TuneHub admission gate, built on axum.
//!
//! Every request passes through [`admission_middleware`](middleware::admission_middleware)
//! before it reaches a handler. Denied requests get a `403` JSON body;
//! admitted ones are logged with the handler's status once it responds.
//! Embedders add their own routes with [`TunehubServer::with_app`].
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tunehub_admission::AdmissionConfig;
//! use tunehub_server::{AppState, ServerConfig, TunehubServer};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = ServerConfig::default().with_admin_token("change-me");
//!     let state = AppState::in_memory(config, AdmissionConfig::default()).unwrap();
//!     let server = TunehubServer::new(Arc::new(state));
//!     // server.serve("0.0.0.0:8080".parse().unwrap()).await.unwrap();
//! }
//! ```
//!
//! ## API Endpoints
//!
//! | Endpoint | Method | Description |
//! |----------|--------|-------------|
//! | `/health` | GET | Liveness probe |
//! | `/status` | GET | Version and active thresholds |
//! | `/admin/bans` | GET | Live bans, newest first |
//! | `/admin/bans` | POST | Ban `{ip, reason, duration_hours}` |
//! | `/admin/bans/{ip}` | DELETE | Lift a ban |
//! | `/admin/stats` | GET | Request totals and gate state |
//! | `/admin/access-logs` | GET | Recent access-log records (`?limit=`) |

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod routes;
pub mod server;
pub mod state;

// Re-export main types
pub use config::{LogFormat, ServerArgs, ServerConfig};
pub use error::{ServerError, ServerResult};
pub use routes::{create_router, create_router_with};
pub use server::{TunehubServer, shutdown_signal};
pub use state::AppState;
