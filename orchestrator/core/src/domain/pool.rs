// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Connection Pool Contracts
//!
//! Sizing/timeout configuration, lease identity, pool statistics and the
//! narrow driver traits the pool is generic over. The concrete pool lives in
//! `crate::infrastructure::pool`; the PostgreSQL driver in
//! `crate::infrastructure::postgres`.
//!
//! Defaults favour aggressive reclamation over keep-alive throughput: the host
//! runs many short agent sessions, not a high-QPS service.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LeaseId(pub Uuid);

impl LeaseId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for LeaseId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LeaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Bounded retry with exponential backoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Zero is treated as one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_backoff_millis")]
    pub backoff_millis: u64,

    #[serde(default = "default_max_backoff_millis")]
    pub max_backoff_millis: u64,
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            backoff_millis: 0,
            max_backoff_millis: 0,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay to wait after the given failed attempt (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let millis = self.backoff_millis.saturating_mul(1u64 << exp);
        Duration::from_millis(millis.min(self.max_backoff_millis))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_millis: default_backoff_millis(),
            max_backoff_millis: default_max_backoff_millis(),
        }
    }
}

/// Pool sizing and timeout configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_max")]
    pub max: u32,

    /// Connections opened eagerly at startup. Expired idle connections are
    /// reaped even if that drops the pool below `min`.
    #[serde(default)]
    pub min: u32,

    #[serde(default = "default_idle_timeout_millis")]
    pub idle_timeout_millis: u64,

    /// How long `acquire()` waits for a free slot before `PoolExhausted`.
    #[serde(default = "default_acquire_timeout_millis")]
    pub acquire_timeout_millis: u64,

    /// Budget for establishing a single new connection.
    #[serde(default = "default_connection_timeout_millis")]
    pub connection_timeout_millis: u64,

    /// Server-side `statement_timeout` sent on connect.
    #[serde(default = "default_statement_timeout_millis")]
    pub statement_timeout_millis: u64,

    /// Client-side bound on one operation; on expiry the connection is discarded.
    #[serde(default = "default_query_timeout_millis")]
    pub query_timeout_millis: u64,

    #[serde(default = "default_application_name")]
    pub application_name: String,

    /// How long `close()` waits for outstanding leases.
    #[serde(default = "default_close_grace_millis")]
    pub close_grace_millis: u64,

    #[serde(default)]
    pub connect_retry: RetryPolicy,
}

impl PoolConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_millis)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_millis)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_millis)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_millis)
    }

    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_millis)
    }

    /// Reaper cadence: half the idle timeout, never faster than 250ms.
    pub fn reap_interval(&self) -> Duration {
        Duration::from_millis((self.idle_timeout_millis / 2).max(250))
    }

    pub fn validate(&self) -> Result<(), PoolError> {
        if self.max == 0 {
            return Err(PoolError::Config("max must be at least 1".to_string()));
        }
        if self.min > self.max {
            return Err(PoolError::Config(format!(
                "min ({}) cannot exceed max ({})",
                self.min, self.max
            )));
        }
        if self.acquire_timeout_millis == 0 {
            return Err(PoolError::Config("acquire_timeout_millis must be positive".to_string()));
        }
        Ok(())
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max: default_max(),
            min: 0,
            idle_timeout_millis: default_idle_timeout_millis(),
            acquire_timeout_millis: default_acquire_timeout_millis(),
            connection_timeout_millis: default_connection_timeout_millis(),
            statement_timeout_millis: default_statement_timeout_millis(),
            query_timeout_millis: default_query_timeout_millis(),
            application_name: default_application_name(),
            close_grace_millis: default_close_grace_millis(),
            connect_retry: RetryPolicy::default(),
        }
    }
}

/// Point-in-time pool counters, read under a single lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub idle: usize,
    pub active: usize,
    pub max: usize,
    pub waiting: usize,
    pub total_opened: u64,
    pub total_closed: u64,
}

impl PoolStats {
    /// `idle + active == opened - closed`
    pub fn is_conserved(&self) -> bool {
        (self.idle + self.active) as u64 == self.total_opened.saturating_sub(self.total_closed)
            && self.total_opened >= self.total_closed
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("no connection became available within {waited:?}")]
    Exhausted { waited: Duration },

    #[error("connection pool is closed")]
    Closed,

    #[error("failed to establish connection: {0}")]
    Connect(String),

    #[error("operation exceeded query timeout of {0:?}")]
    QueryTimeout(Duration),

    #[error("query failed: {0}")]
    Query(String),

    #[error("invalid pool configuration: {0}")]
    Config(String),
}

impl PoolError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, PoolError::Exhausted { .. } | PoolError::Connect(_))
    }
}

/// A live connection produced by a [`ConnectionFactory`].
#[async_trait]
pub trait DatabaseConnection: Send {
    /// Run one statement, returning affected rows.
    async fn execute(&mut self, sql: &str) -> Result<u64, PoolError>;

    async fn ping(&mut self) -> Result<(), PoolError> {
        self.execute("SELECT 1").await.map(|_| ())
    }

    async fn close(self: Box<Self>);
}

#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn DatabaseConnection>, PoolError>;
}

fn default_max() -> u32 {
    3
}

fn default_idle_timeout_millis() -> u64 {
    5_000
}

fn default_acquire_timeout_millis() -> u64 {
    2_000
}

fn default_connection_timeout_millis() -> u64 {
    2_000
}

fn default_statement_timeout_millis() -> u64 {
    30_000
}

fn default_query_timeout_millis() -> u64 {
    30_000
}

fn default_application_name() -> String {
    "warden-agent".to_string()
}

fn default_close_grace_millis() -> u64 {
    5_000
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_millis() -> u64 {
    100
}

fn default_max_backoff_millis() -> u64 {
    2_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_backoff_is_exponential_and_capped() {
        let policy = RetryPolicy {
            max_attempts: 5,
            backoff_millis: 100,
            max_backoff_millis: 350,
        };
        assert_eq!(policy.delay_after(1), Duration::from_millis(100));
        assert_eq!(policy.delay_after(2), Duration::from_millis(200));
        assert_eq!(policy.delay_after(3), Duration::from_millis(350));
        assert_eq!(RetryPolicy { max_attempts: 0, ..policy }.attempts(), 1);
    }

    #[test]
    fn test_default_config_is_memory_lean() {
        let config = PoolConfig::default();
        assert_eq!(config.max, 3);
        assert_eq!(config.min, 0);
        assert_eq!(config.idle_timeout(), Duration::from_secs(5));
        assert_eq!(config.application_name, "warden-agent");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_min_above_max() {
        let config = PoolConfig {
            min: 4,
            max: 2,
            ..PoolConfig::default()
        };
        assert!(matches!(config.validate(), Err(PoolError::Config(_))));
    }
}
