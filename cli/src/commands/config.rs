// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Configuration management commands
//!
//! Commands: show, validate, generate

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::path::PathBuf;

use warden_core::domain::host_config::HostConfig;

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Show current configuration
    Show {
        /// Show config file paths checked
        #[arg(long)]
        paths: bool,
    },

    /// Validate configuration file
    Validate {
        /// Path to config file (default: discover)
        #[arg(value_name = "FILE")]
        file: Option<PathBuf>,
    },

    /// Generate a configuration file with every default spelled out
    Generate {
        /// Output path (default: ./warden-config.yaml)
        #[arg(short, long, default_value = "./warden-config.yaml")]
        output: PathBuf,
    },
}

pub async fn handle_command(
    command: ConfigCommand,
    config_override: Option<PathBuf>,
) -> Result<()> {
    match command {
        ConfigCommand::Show { paths } => show(config_override, paths),
        ConfigCommand::Validate { file } => validate(file.or(config_override)),
        ConfigCommand::Generate { output } => generate(output),
    }
}

fn show(config_override: Option<PathBuf>, show_paths: bool) -> Result<()> {
    let config = HostConfig::load_or_default(config_override.clone())
        .context("Failed to load configuration")?;

    if show_paths {
        println!("{}", "Configuration discovery paths:".bold());
        if let Some(path) = &config_override {
            println!("  1. --config flag: {}", path.display());
        } else {
            println!("  1. --config flag: {}", "(not set)".dimmed());
        }
        println!(
            "  2. WARDEN_CONFIG_PATH: {}",
            std::env::var("WARDEN_CONFIG_PATH")
                .unwrap_or_else(|_| "(not set)".to_string())
                .dimmed()
        );
        println!("  3. ./warden-config.yaml");
        println!("  4. ~/.warden/config.yaml");
        println!("  5. /etc/warden/config.yaml");
        println!();
    }

    let spec = &config.spec;
    println!("{}", "Current configuration:".bold());
    println!();

    println!("{}", "Host:".bold());
    println!("  Name: {}", config.metadata.name);
    println!("  Listen: {}:{}", spec.server.bind_address, spec.server.port);
    if let Some(dir) = &spec.data_dir {
        println!("  Data dir: {}", dir.display());
    }
    println!();

    println!("{}", "Database:".bold());
    println!(
        "  URL: {}",
        if spec.database.url.is_some() {
            "(set)".to_string()
        } else {
            "(not set)".dimmed().to_string()
        }
    );
    let pool = &spec.database.pool;
    println!("  Pool: min {} / max {}", pool.min, pool.max);
    println!("  Idle timeout: {}ms", pool.idle_timeout_millis);
    println!("  Acquire timeout: {}ms", pool.acquire_timeout_millis);
    println!("  Query timeout: {}ms", pool.query_timeout_millis);
    println!("  Application name: {}", pool.application_name);
    println!();

    println!("{}", "Memory:".bold());
    println!("  Sample interval: {}ms", spec.memory.sample_interval_ms);
    println!("  Window: {} samples", spec.memory.window);
    println!(
        "  Leak threshold: {} B/s",
        spec.memory.leak_threshold_bytes_per_sec
    );
    println!("  Debug logging: {}", spec.memory.debug);
    println!();

    Ok(())
}

fn validate(config_path: Option<PathBuf>) -> Result<()> {
    println!("Validating configuration...");

    let config = HostConfig::load_or_default(config_path)
        .context("Failed to load configuration")?;

    config
        .validate()
        .context("Configuration validation failed")?;

    println!("{}", "✓ Configuration is valid".green());

    Ok(())
}

fn generate(output: PathBuf) -> Result<()> {
    HostConfig::default()
        .to_yaml_file(&output)
        .with_context(|| format!("Failed to write config to {:?}", output))?;

    println!(
        "{}",
        format!("✓ Configuration generated: {}", output.display()).green()
    );

    Ok(())
}
