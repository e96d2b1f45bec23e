// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Host Context
//!
//! Process-wide wiring of the resource core: event bus, connection pool,
//! realtime registry, agent orchestrator, memory sampler and leak watchdog,
//! plus every background task they need.
//!
//! Nothing here outlives [`HostContext::shutdown`]: agents are stopped, the
//! sampler timer is halted, the pool is drained and closed, and all named
//! tasks (registry owner, maintenance tick, realtime server) are cancelled
//! and joined.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use tracing::{debug, info};

use crate::application::leak_watchdog::LeakWatchdog;
use crate::application::lifecycle::{AgentInitializer, AgentOrchestrator, StopReport};
use crate::application::memory_sampler::MemorySampler;
use crate::application::registry::RealtimeRegistry;
use crate::domain::agent::Character;
use crate::domain::host_config::HostConfig;
use crate::domain::memory::MemoryProbe;
use crate::domain::pool::ConnectionFactory;
use crate::infrastructure::event_bus::EventBus;
use crate::infrastructure::pool::ConnectionPool;
use crate::infrastructure::tasks::BackgroundTasks;

pub const REGISTRY_TASK: &str = "connection-registry";
pub const MAINTENANCE_TASK: &str = "maintenance-tick";

/// Startup input for a host run.
#[derive(Debug, Clone)]
pub struct HostOptions {
    pub port: u16,
    pub characters: Vec<Character>,
}

impl HostOptions {
    pub fn new(port: u16, characters: Vec<Character>) -> anyhow::Result<Self> {
        if port == 0 {
            anyhow::bail!("port must be between 1 and 65535");
        }
        Ok(Self { port, characters })
    }
}

pub struct HostContext {
    config: HostConfig,
    event_bus: EventBus,
    pool: ConnectionPool,
    registry: RealtimeRegistry,
    orchestrator: Arc<AgentOrchestrator>,
    sampler: Arc<MemorySampler>,
    watchdog: Arc<LeakWatchdog>,
    tasks: BackgroundTasks,
    started: Instant,
}

impl HostContext {
    /// Open the pool and start the registry owner task.
    pub async fn build(
        config: HostConfig,
        factory: Arc<dyn ConnectionFactory>,
        initializer: Arc<dyn AgentInitializer>,
        probe: Arc<dyn MemoryProbe>,
    ) -> anyhow::Result<Self> {
        let event_bus = EventBus::with_default_capacity();
        let tasks = BackgroundTasks::new();

        let pool = ConnectionPool::connect(
            config.spec.database.pool.clone(),
            factory,
            event_bus.clone(),
        )
        .await
        .context("Failed to create connection pool")?;

        let (registry, actor) = RealtimeRegistry::new(event_bus.clone());
        tasks.spawn(REGISTRY_TASK, |token| actor.run(token));

        let orchestrator = Arc::new(AgentOrchestrator::new(
            pool.clone(),
            registry.clone(),
            initializer,
            event_bus.clone(),
        ));

        let memory = &config.spec.memory;
        let sampler = Arc::new(MemorySampler::new(probe, memory.window, event_bus.clone()));
        let watchdog = Arc::new(LeakWatchdog::new(
            sampler.clone(),
            memory.leak_threshold_bytes_per_sec,
            event_bus.clone(),
        ));

        if let Some(dir) = &config.spec.data_dir {
            info!(data_dir = %dir.display(), "Embedded store directory configured");
        }

        Ok(Self {
            config,
            event_bus,
            pool,
            registry,
            orchestrator,
            sampler,
            watchdog,
            tasks,
            started: Instant::now(),
        })
    }

    /// Round-trip the database once. Callers treat `false` as fatal.
    pub async fn health_check(&self) -> bool {
        self.pool.test_connection().await
    }

    pub fn start_memory_sampling(&self) {
        self.start_memory_sampling_every(Duration::from_millis(
            self.config.spec.memory.sample_interval_ms,
        ));
    }

    pub fn start_memory_sampling_every(&self, interval: Duration) {
        self.sampler.start(interval);
    }

    /// Spawn the periodic maintenance tick: reap idle connections, evaluate
    /// memory growth, and log RSS when memory debugging is on.
    pub fn start_maintenance(&self) {
        let period = Duration::from_secs(self.config.spec.memory.maintenance_interval_secs);
        let pool = self.pool.clone();
        let sampler = self.sampler.clone();
        let watchdog = self.watchdog.clone();
        let debug_memory = self.config.spec.memory.debug;

        self.tasks.spawn_periodic(MAINTENANCE_TASK, period, move || {
            let pool = pool.clone();
            let sampler = sampler.clone();
            let watchdog = watchdog.clone();
            async move {
                let reaped = pool.reap_idle().await;
                if debug_memory {
                    match sampler.sample_now() {
                        Ok(snapshot) => debug!(
                            rss_mb = snapshot.resident_mib().round(),
                            heap_used_mb = snapshot.heap_used_mib().map(f64::round),
                            reaped,
                            "Maintenance tick"
                        ),
                        Err(e) => debug!(error = %e, "Maintenance tick could not read memory"),
                    }
                }
                watchdog.check();
            }
        });
    }

    /// Tear everything down in dependency order.
    pub async fn shutdown(&self) -> StopReport {
        info!("Shutting down host");
        let report = self.orchestrator.stop_all().await;
        self.sampler.stop();
        self.pool.close().await;
        self.tasks.shutdown().await;
        info!(
            agents_stopped = report.stopped.len(),
            failures = report.failures.len(),
            "Host shut down"
        );
        report
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn registry(&self) -> &RealtimeRegistry {
        &self.registry
    }

    pub fn orchestrator(&self) -> &Arc<AgentOrchestrator> {
        &self.orchestrator
    }

    pub fn sampler(&self) -> &Arc<MemorySampler> {
        &self.sampler
    }

    pub fn watchdog(&self) -> &Arc<LeakWatchdog> {
        &self.watchdog
    }

    pub fn tasks(&self) -> &BackgroundTasks {
        &self.tasks
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::lifecycle::StorageCheckInitializer;
    use crate::application::memory_sampler::testing::SteppingProbe;
    use crate::domain::agent::StartOptions;
    use crate::infrastructure::pool::testing::FakeConnector;

    async fn host() -> HostContext {
        HostContext::build(
            HostConfig::default(),
            Arc::new(FakeConnector::new()),
            Arc::new(StorageCheckInitializer),
            Arc::new(SteppingProbe::new(1024, 0)),
        )
        .await
        .unwrap()
    }

    #[test]
    fn test_port_zero_is_rejected() {
        assert!(HostOptions::new(0, vec![]).is_err());
        assert_eq!(HostOptions::new(3000, vec![]).unwrap().port, 3000);
    }

    #[tokio::test]
    async fn test_shutdown_releases_everything() {
        let host = host().await;
        assert!(host.health_check().await);
        host.start_memory_sampling_every(Duration::from_millis(10));
        host.start_maintenance();
        assert!(host.tasks().names().contains(&MAINTENANCE_TASK.to_string()));

        let report = host
            .orchestrator()
            .start_agents(vec![Character::new("atlas")], &StartOptions::default())
            .await;
        assert_eq!(report.started_count(), 1);

        let stop = host.shutdown().await;
        assert_eq!(stop.stopped.len(), 1);
        assert!(stop.failures.is_empty());
        assert!(!host.sampler().is_running());
        assert!(host.tasks().is_empty());
        assert!(host.pool().is_closed());
        assert_eq!(host.pool().stats().active, 0);
        assert!(host.registry().len().await.is_err());
    }
}
