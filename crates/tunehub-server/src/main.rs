//! TuneHub admission gate binary.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use tunehub_server::{AppState, LogFormat, ServerArgs, TunehubServer, shutdown_signal};

#[tokio::main]
async fn main() -> ExitCode {
    let args = ServerArgs::parse();
    init_tracing(args.log_format);

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %format!("{e:#}"), "TuneHub gate failed");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn run(args: ServerArgs) -> anyhow::Result<()> {
    let state = AppState::from_args(&args).context("failed to initialise admission state")?;

    info!(
        bind = %args.bind,
        bans = ?args.bans_path,
        access_log = ?args.access_log,
        admin_api = state.config().admin_token.is_some(),
        trust_forwarded = args.trust_forwarded,
        "Starting TuneHub gate"
    );

    let server = TunehubServer::new(Arc::new(state));
    server
        .serve_with_shutdown(args.bind, shutdown_signal())
        .await
        .context("server error")?;
    Ok(())
}
