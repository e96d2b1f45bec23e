// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! `warden start` - run the agent host until interrupted

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};

use warden_core::application::host::{HostContext, HostOptions};
use warden_core::application::lifecycle::{StartReport, StorageCheckInitializer};
use warden_core::domain::agent::StartOptions;
use warden_core::domain::host_config::HostConfig;
use warden_core::infrastructure::memory_probe::SysinfoMemoryProbe;
use warden_core::infrastructure::postgres::PostgresConnector;
use warden_core::presentation::realtime::{serve, RealtimeState};

use crate::characters::resolve_characters;

pub const SERVER_TASK: &str = "realtime-server";

#[derive(Args, Debug, Clone)]
pub struct StartArgs {
    /// Realtime server port (overrides spec.server.port)
    #[arg(long, value_parser = clap::value_parser!(u16).range(1..))]
    pub port: Option<u16>,

    /// Character files to load (repeat or comma-separate)
    #[arg(long = "character", value_name = "PATH", value_delimiter = ',', num_args = 1..)]
    pub characters: Vec<PathBuf>,
}

/// Load configuration, apply CLI overrides and validate.
pub fn load_config(config_path: Option<PathBuf>, port: Option<u16>) -> Result<HostConfig> {
    let mut config =
        HostConfig::load_or_default(config_path).context("Failed to load configuration")?;
    if let Some(port) = port {
        config.spec.server.port = port;
    }
    config
        .validate()
        .context("Configuration validation failed")?;
    Ok(config)
}

/// Open the pool against the configured database and fail fast when it
/// cannot answer a round trip.
pub async fn build_host(config: HostConfig) -> Result<HostContext> {
    let url = config
        .database_url()
        .context("No database URL configured. Set WARDEN_DATABASE_URL or spec.database.url")?
        .to_string();
    let connector = PostgresConnector::new(&url, &config.spec.database.pool)
        .context("Invalid database connection settings")?;

    let host = HostContext::build(
        config,
        Arc::new(connector),
        Arc::new(StorageCheckInitializer),
        Arc::new(SysinfoMemoryProbe::new()),
    )
    .await?;

    if !host.health_check().await {
        host.shutdown().await;
        anyhow::bail!("Database health check failed");
    }
    info!("Database connection healthy");
    Ok(host)
}

pub async fn run(args: StartArgs, config_path: Option<PathBuf>) -> Result<()> {
    let config = load_config(config_path, args.port)?;
    let options = HostOptions::new(config.spec.server.port, resolve_characters(&args.characters)?)?;
    crate::install_metrics_exporter(&config)?;

    let bind = (config.spec.server.bind_address.clone(), options.port);
    let host = build_host(config).await?;

    let report = host
        .orchestrator()
        .start_agents(options.characters, &StartOptions::default())
        .await;
    print_start_report(&report);

    host.start_memory_sampling();
    host.start_maintenance();

    let listener = match TcpListener::bind((bind.0.as_str(), bind.1)).await {
        Ok(listener) => listener,
        Err(e) => {
            host.shutdown().await;
            return Err(e).with_context(|| format!("Failed to bind {}:{}", bind.0, bind.1));
        }
    };
    host.tasks().spawn(SERVER_TASK, |token| {
        let state = RealtimeState::from_host(&host, token.clone());
        async move {
            if let Err(e) = serve(listener, state, token).await {
                error!("Realtime server failed: {:#}", e);
            }
        }
    });

    println!(
        "{}",
        format!("✓ Warden host listening on {}:{}", bind.0, bind.1).green()
    );

    shutdown_signal().await;

    let stop = host.shutdown().await;
    for failure in &stop.failures {
        warn!("{}", failure);
    }
    println!(
        "{}",
        format!("✓ Stopped {} agent(s)", stop.stopped.len()).green()
    );
    Ok(())
}

fn print_start_report(report: &StartReport) {
    for outcome in &report.outcomes {
        match &outcome.result {
            Ok(summary) => println!("  {} {} ({})", "✓".green(), outcome.name.bold(), summary.agent_id),
            Err(e) if e.is_benign() => println!("  {} {}: {}", "•".yellow(), outcome.name, e),
            Err(e) => println!("  {} {}: {}", "✗".red(), outcome.name, e),
        }
    }
    let failed = report.failures().count();
    if failed > 0 {
        warn!("{} of {} agent(s) failed to start", failed, report.outcomes.len());
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}
