// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! `warden leak-check` - standalone memory growth check
//!
//! Starts the host, samples resident memory, churns realtime connections
//! through the registry, then prints the leak report. The process exit code
//! is the verdict: 0 stable, 1 leak detected.

use anyhow::Result;
use clap::Args;
use colored::Colorize;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

use warden_core::application::host::HostContext;
use warden_core::domain::agent::{AgentId, Character, StartOptions};
use warden_core::domain::memory::LeakVerdict;
use warden_core::domain::realtime::TransportConnection;
use warden_core::presentation::realtime::WsConnection;

use super::start::{build_host, load_config};

#[derive(Args, Debug, Clone)]
pub struct LeakCheckArgs {
    /// How long to keep sampling after the connection cycles, in seconds
    #[arg(long, default_value_t = 60)]
    pub duration: u64,

    /// Sampling interval in milliseconds
    #[arg(long, default_value_t = 2000, value_parser = clap::value_parser!(u64).range(1..))]
    pub interval: u64,

    /// Number of connect / message / disconnect cycles
    #[arg(long, default_value_t = 10)]
    pub cycles: u32,

    /// Growth threshold in bytes per second (default from configuration)
    #[arg(long)]
    pub threshold: Option<f64>,
}

/// Connect, associate with an agent, and disconnect `cycles` times.
/// Returns the number of registry entries left behind.
pub async fn exercise_connections(host: &HostContext, cycles: u32, pause: Duration) -> Result<usize> {
    let registry = host.registry();
    for cycle in 0..cycles {
        let socket = WsConnection::new();
        registry.attach(&socket);
        let agent_id = AgentId::resolve(&format!("test-agent-{cycle}"));
        registry.associate(socket.id(), agent_id)?;
        registry.list_connections_for_agent(agent_id).await?;
        socket.fire_close();
        tokio::time::sleep(pause).await;
    }
    Ok(registry.len().await?)
}

pub async fn run(args: LeakCheckArgs, config_path: Option<PathBuf>) -> Result<LeakVerdict> {
    let mut config = load_config(config_path, None)?;
    if let Some(threshold) = args.threshold {
        config.spec.memory.leak_threshold_bytes_per_sec = threshold;
    }
    let host = build_host(config).await?;

    host.orchestrator()
        .start_agents(vec![Character::default_agent()], &StartOptions::default())
        .await;
    host.start_memory_sampling_every(Duration::from_millis(args.interval));

    println!("Running {} connection cycles...", args.cycles);
    let leftover = exercise_connections(&host, args.cycles, Duration::from_millis(100)).await?;
    if leftover > 0 {
        println!(
            "{}",
            format!("⚠ {} registry entries survived disconnect", leftover).yellow()
        );
    }

    println!("Sampling memory for {}s...", args.duration);
    tokio::time::sleep(Duration::from_secs(args.duration)).await;
    host.sampler().sample_now()?;

    let verdict = host.watchdog().check();
    println!();
    println!("{}", host.watchdog().render());
    info!(?verdict, "Leak check finished");

    host.shutdown().await;
    Ok(verdict)
}
