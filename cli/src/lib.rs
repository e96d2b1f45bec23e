// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Warden CLI library - exposes testable components
//!
//! # Architecture
//!
//! - **Layer:** Interface / Presentation Layer
//! - **Purpose:** Command handlers, character loading and process-level wiring

pub mod characters;
pub mod commands;

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

use warden_core::domain::host_config::HostConfig;

/// Log filter used when `RUST_LOG` is unset: `--log-level` (or
/// `WARDEN_LOG_LEVEL`) first, then the config file, then `info`.
pub fn resolve_log_level(flag: Option<&str>, config: Option<&HostConfig>) -> String {
    flag.or_else(|| config.and_then(HostConfig::log_level))
        .unwrap_or("info")
        .to_string()
}

/// Install the Prometheus scrape endpoint when metrics are enabled.
pub fn install_metrics_exporter(config: &HostConfig) -> Result<()> {
    let Some(metrics) = config
        .spec
        .observability
        .as_ref()
        .and_then(|o| o.metrics.as_ref())
    else {
        return Ok(());
    };
    if !metrics.enabled {
        return Ok(());
    }

    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], metrics.port))
        .install()
        .context("Failed to install Prometheus exporter")?;
    info!("Prometheus metrics exposed on :{}/metrics", metrics.port);
    Ok(())
}
