//! drone-downstream - trigger downstream Drone builds
//!
//! Resolves the target build of every configured repository, restarts,
//! forks or promotes it, and optionally blocks until it finishes.
//!
//! ## Exit codes
//!
//! - `0`: every repository reached `Done`
//! - `1`: at least one repository failed, timed out or was canceled
//! - `2`: invalid configuration; nothing was triggered

mod config;

use std::path::Path;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use downstream_core::{init_tracing, RunSummary, Runner};
use downstream_drone::{DroneClient, DroneConfig};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};

use crate::config::Cli;

/// Environment file Drone writes for plugin steps.
const DRONE_ENV_FILE: &str = "/run/drone/env";

#[tokio::main]
async fn main() -> ExitCode {
    load_env_files();

    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    init_tracing(cli.json, level);

    match run(cli).await {
        Ok(summary) if summary.is_success() => ExitCode::SUCCESS,
        Ok(summary) => {
            report_failure(&summary);
            ExitCode::from(1)
        }
        Err(err) => {
            error!("validation failed: {:#}", err);
            ExitCode::from(2)
        }
    }
}

async fn run(cli: Cli) -> Result<RunSummary> {
    let settings = cli.settings(|key| std::env::var(key).ok());
    settings.validate()?;

    let params = settings
        .params
        .resolve()
        .context("unable to parse params")?;

    let client = DroneClient::new(DroneConfig::new(&settings.server, &settings.token))
        .context("Failed to create Drone client")?;
    info!(
        "triggering {} repositories on {}",
        settings.repositories.len(),
        client.server()
    );

    let cancel = CancellationToken::new();
    cancel_on_signal(cancel.clone());

    Ok(Runner::new(&client, &settings, &params, cancel).run().await)
}

fn report_failure(summary: &RunSummary) {
    if let Some(first) = summary.first_failure() {
        error!(
            "{} of {} repositories failed; first failure: {}: {}",
            summary.failed_count(),
            summary.reports.len(),
            first.entry,
            first.outcome
        );
    }
    if !summary.skipped.is_empty() {
        warn!("not triggered: {}", summary.skipped.join(", "));
    }
}

/// Load `/run/drone/env` (overriding) and a local `.env` (not overriding).
fn load_env_files() {
    let drone_env = Path::new(DRONE_ENV_FILE);
    if drone_env.exists() {
        dotenvy::from_path_override(drone_env).ok();
    }
    dotenvy::dotenv().ok();
}

/// Cancel `token` on the first SIGINT/SIGTERM; exit on the second.
fn cancel_on_signal(token: CancellationToken) {
    tokio::spawn(async move {
        shutdown_signal().await;
        warn!("interrupt received; canceling the downstream build being waited on");
        token.cancel();

        shutdown_signal().await;
        warn!("second interrupt received; exiting");
        std::process::exit(130);
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!("unable to listen for ctrl-c: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
