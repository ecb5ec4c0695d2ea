//! Shared state for the HTTP front.

use std::sync::Arc;
use std::time::Instant;

use tracing::info;
use tunehub_admission::{
    AccessLogger, AdmissionConfig, AdmissionPipeline, InMemoryAccessLog, InMemoryReputationStore,
    JsonFileReputationStore, JsonLinesAccessLog, ReputationStore, TracingAccessLogger,
};

use crate::config::{ServerArgs, ServerConfig};
use crate::error::ServerResult;

/// State shared by the middleware and every handler.
#[derive(Debug)]
pub struct AppState {
    config: ServerConfig,
    pipeline: AdmissionPipeline,
    /// In-memory view of the access log for the admin surface.
    access_log: Arc<InMemoryAccessLog>,
    started_at: Instant,
}

impl AppState {
    /// Create state around an existing pipeline.
    ///
    /// `access_log` must be the logger the pipeline writes to, or the admin
    /// statistics will not reflect its decisions.
    pub fn new(
        config: ServerConfig,
        pipeline: AdmissionPipeline,
        access_log: Arc<InMemoryAccessLog>,
    ) -> Self {
        Self {
            config,
            pipeline,
            access_log,
            started_at: Instant::now(),
        }
    }

    /// Build state with in-memory stores and the given thresholds.
    pub fn in_memory(config: ServerConfig, admission: AdmissionConfig) -> ServerResult<Self> {
        let access_log = Arc::new(
            InMemoryAccessLog::default().with_sink(Box::new(TracingAccessLogger)),
        );
        let pipeline = AdmissionPipeline::new(
            admission,
            Arc::new(InMemoryReputationStore::new()),
            access_log.clone(),
        )?;
        Ok(Self::new(config, pipeline, access_log))
    }

    /// Build state from command-line arguments, opening any file-backed stores.
    pub fn from_args(args: &ServerArgs) -> ServerResult<Self> {
        let admission = match &args.admission_config {
            Some(path) => {
                info!(path = %path.display(), "Loading admission config");
                AdmissionConfig::from_json_file(path)?
            }
            None => AdmissionConfig::default(),
        };

        let reputation: Arc<dyn ReputationStore> = match &args.bans_path {
            Some(path) => Arc::new(JsonFileReputationStore::open(path)?),
            None => Arc::new(InMemoryReputationStore::new()),
        };

        let sink: Box<dyn AccessLogger> = match &args.access_log {
            Some(path) => Box::new(JsonLinesAccessLog::open(path)?),
            None => Box::new(TracingAccessLogger),
        };
        let access_log = Arc::new(InMemoryAccessLog::default().with_sink(sink));

        let pipeline = AdmissionPipeline::new(admission, reputation, access_log.clone())?;
        Ok(Self::new(args.server_config(), pipeline, access_log))
    }

    /// Get the configuration.
    #[must_use]
    pub const fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Get the admission pipeline.
    #[must_use]
    pub const fn pipeline(&self) -> &AdmissionPipeline {
        &self.pipeline
    }

    /// Get the access-log view.
    #[must_use]
    pub fn access_log(&self) -> &InMemoryAccessLog {
        &self.access_log
    }

    /// Server uptime in seconds.
    #[must_use]
    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_in_memory_state() {
        let state = AppState::in_memory(ServerConfig::default(), AdmissionConfig::default()).unwrap();

        assert!(state.access_log().is_empty());
        assert_eq!(state.pipeline().active_rate_limit_buckets(), 0);
        assert!(state.uptime_secs() < 5);
    }

    #[test]
    fn test_from_args_opens_file_stores() {
        let dir = tempfile::tempdir().unwrap();
        let bans = dir.path().join("bans.json");
        let log = dir.path().join("access.jsonl");

        let args = ServerArgs::try_parse_from([
            "tunehub-server",
            "--bans-path",
            bans.to_str().unwrap(),
            "--access-log",
            log.to_str().unwrap(),
        ])
        .unwrap();

        let state = AppState::from_args(&args).unwrap();
        state
            .pipeline()
            .ban(&"10.1.1.1".into(), "abuse", None)
            .unwrap();

        assert!(bans.exists());
        assert!(log.exists());
    }

    #[test]
    fn test_from_args_rejects_invalid_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("admission.json");
        std::fs::write(&path, r#"{"rate_limit": {"max_requests": 0}}"#).unwrap();

        let args = ServerArgs::try_parse_from([
            "tunehub-server",
            "--admission-config",
            path.to_str().unwrap(),
        ])
        .unwrap();

        assert!(AppState::from_args(&args).is_err());
    }
}
