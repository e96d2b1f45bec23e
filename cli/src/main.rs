// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # Warden Agent Host CLI
//!
//! The `warden` binary hosts agents defined by character files and keeps
//! their database leases, realtime sockets and timers accounted for.
//!
//! ## Commands
//!
//! - `warden start [--port N] [--character a.json,b.json]` - Run the host
//! - `warden leak-check` - Churn connections, sample memory, exit 0/1
//! - `warden config show|validate|generate` - Configuration management

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use tracing::info;

use warden_cli::commands::{self, ConfigCommand, LeakCheckArgs, StartArgs};
use warden_cli::resolve_log_level;
use warden_core::domain::host_config::HostConfig;
use warden_core::infrastructure::heap::CountingAllocator;

#[global_allocator]
static ALLOC: CountingAllocator = CountingAllocator;

/// Warden Agent Host - long-running, leak-checked agent hosting
#[derive(Parser)]
#[command(name = "warden")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file (overrides discovery)
    #[arg(
        short,
        long,
        global = true,
        env = "WARDEN_CONFIG_PATH",
        value_name = "FILE"
    )]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); defaults to
    /// spec.observability.logging.level, then info
    #[arg(long, global = true, env = "WARDEN_LOG_LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the agent host
    #[command(name = "start")]
    Start(StartArgs),

    /// Run a standalone memory leak check
    #[command(name = "leak-check")]
    LeakCheck(LeakCheckArgs),

    /// Configuration management
    #[command(name = "config")]
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // .env must be loaded before clap reads env-backed arguments
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    // Initialize logging
    let file_config = match cli.log_level {
        Some(_) => None,
        None => HostConfig::load_or_default(cli.config.clone()).ok(),
    };
    init_logging(&resolve_log_level(
        cli.log_level.as_deref(),
        file_config.as_ref(),
    ))?;

    match cli.command {
        Some(Commands::Start(args)) => commands::start::run(args, cli.config).await,
        Some(Commands::LeakCheck(args)) => {
            let verdict = commands::leak_check::run(args, cli.config).await?;
            info!("Exiting with code {}", verdict.exit_code());
            std::process::exit(verdict.exit_code());
        }
        Some(Commands::Config { command }) => {
            commands::config::handle_command(command, cli.config).await
        }
        None => {
            // No command provided - show help
            eprintln!("{}", "No command specified. Use --help for usage.".yellow());
            std::process::exit(1);
        }
    }
}

/// Initialize tracing subscriber for logging
fn init_logging(level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .context("Failed to create log filter")?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_zero_is_rejected() {
        assert!(Cli::try_parse_from(["warden", "start", "--port", "0"]).is_err());
        assert!(Cli::try_parse_from(["warden", "start", "--port", "65536"]).is_err());
    }

    #[test]
    fn test_character_list_is_comma_split() {
        let cli = Cli::try_parse_from([
            "warden",
            "start",
            "--port",
            "3001",
            "--character",
            "a.json,b.json",
            "--character",
            "c.json",
        ])
        .unwrap();
        match cli.command {
            Some(Commands::Start(args)) => {
                assert_eq!(args.port, Some(3001));
                assert_eq!(
                    args.characters,
                    vec![
                        PathBuf::from("a.json"),
                        PathBuf::from("b.json"),
                        PathBuf::from("c.json")
                    ]
                );
            }
            _ => panic!("expected start command"),
        }
    }

    #[test]
    fn test_leak_check_defaults() {
        let cli = Cli::try_parse_from(["warden", "leak-check"]).unwrap();
        match cli.command {
            Some(Commands::LeakCheck(args)) => {
                assert_eq!(args.interval, 2000);
                assert_eq!(args.cycles, 10);
            }
            _ => panic!("expected leak-check command"),
        }
    }
}
