// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Agent Lifecycle Orchestrator
//!
//! Brings agents online from [`Character`] definitions and takes them down
//! again, owning every live [`AgentRuntimeHandle`].
//!
//! - At most one handle exists per [`AgentId`]; a second start reports
//!   [`LifecycleError::AlreadyRunning`].
//! - Each running agent holds one pool lease for its whole lifetime.
//! - Starts are processed in input order and never abort siblings; the
//!   caller gets a per-character [`StartReport`].
//! - Stopping releases realtime associations, then the lease, then removes
//!   the handle. A stopped agent is absent, not retained.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::application::registry::RealtimeRegistry;
use crate::domain::agent::{
    AgentId, AgentStatus, AgentSummary, Character, LifecycleError, StartOptions,
};
use crate::domain::events::AgentLifecycleEvent;
use crate::domain::pool::{PoolError, RetryPolicy};
use crate::infrastructure::event_bus::EventBus;
use crate::infrastructure::pool::{ConnectionPool, PooledConnection};

/// Agent-specific bring-up and tear-down run by the orchestrator.
#[async_trait]
pub trait AgentInitializer: Send + Sync {
    /// Prepare the agent using its storage lease. An error fails the start.
    async fn initialize(
        &self,
        character: &Character,
        storage: &mut PooledConnection,
    ) -> anyhow::Result<()>;

    async fn shutdown(&self, _agent_id: AgentId) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Verifies the agent's storage lease answers a round trip.
pub struct StorageCheckInitializer;

#[async_trait]
impl AgentInitializer for StorageCheckInitializer {
    async fn initialize(
        &self,
        character: &Character,
        storage: &mut PooledConnection,
    ) -> anyhow::Result<()> {
        storage.ping().await?;
        debug!(
            agent = %character.name,
            plugins = character.plugins.len(),
            "Agent storage reachable"
        );
        Ok(())
    }
}

/// Live instance of a started agent.
pub struct AgentRuntimeHandle {
    agent_id: AgentId,
    name: String,
    status: AgentStatus,
    lease: Option<PooledConnection>,
    started_at: Option<DateTime<Utc>>,
}

impl AgentRuntimeHandle {
    fn starting(agent_id: AgentId, name: String) -> Self {
        Self {
            agent_id,
            name,
            status: AgentStatus::Starting,
            lease: None,
            started_at: None,
        }
    }

    pub fn summary(&self) -> AgentSummary {
        AgentSummary {
            agent_id: self.agent_id,
            name: self.name.clone(),
            status: self.status,
            lease_id: self.lease.as_ref().map(|l| l.lease_id()),
            started_at: self.started_at,
        }
    }
}

#[derive(Debug)]
pub struct AgentStartOutcome {
    pub name: String,
    pub agent_id: AgentId,
    pub result: Result<AgentSummary, LifecycleError>,
}

/// Per-character results of one `start_agents` call, in input order.
#[derive(Debug, Default)]
pub struct StartReport {
    pub outcomes: Vec<AgentStartOutcome>,
}

impl StartReport {
    pub fn running(&self) -> impl Iterator<Item = &AgentSummary> {
        self.outcomes.iter().filter_map(|o| o.result.as_ref().ok())
    }

    /// Real failures. `AlreadyRunning` is excluded.
    pub fn failures(&self) -> impl Iterator<Item = &AgentStartOutcome> {
        self.outcomes
            .iter()
            .filter(|o| matches!(&o.result, Err(e) if !e.is_benign()))
    }

    pub fn already_running(&self) -> impl Iterator<Item = &AgentStartOutcome> {
        self.outcomes
            .iter()
            .filter(|o| matches!(&o.result, Err(e) if e.is_benign()))
    }

    pub fn started_count(&self) -> usize {
        self.running().count()
    }
}

#[derive(Debug, Default)]
pub struct StopReport {
    pub stopped: Vec<AgentSummary>,
    pub failures: Vec<LifecycleError>,
}

/// Removes a `Starting` placeholder if the start does not complete.
struct StartingGuard<'a> {
    agents: &'a Mutex<HashMap<AgentId, AgentRuntimeHandle>>,
    agent_id: AgentId,
    armed: bool,
}

impl StartingGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for StartingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut agents = self.agents.lock();
            if matches!(agents.get(&self.agent_id), Some(h) if h.status == AgentStatus::Starting) {
                agents.remove(&self.agent_id);
            }
        }
    }
}

pub struct AgentOrchestrator {
    pool: ConnectionPool,
    registry: RealtimeRegistry,
    initializer: Arc<dyn AgentInitializer>,
    event_bus: EventBus,
    agents: Mutex<HashMap<AgentId, AgentRuntimeHandle>>,
}

impl AgentOrchestrator {
    pub fn new(
        pool: ConnectionPool,
        registry: RealtimeRegistry,
        initializer: Arc<dyn AgentInitializer>,
        event_bus: EventBus,
    ) -> Self {
        Self {
            pool,
            registry,
            initializer,
            event_bus,
            agents: Mutex::new(HashMap::new()),
        }
    }

    /// Start each character in order. Failures are collected, never raised.
    pub async fn start_agents(
        &self,
        characters: Vec<Character>,
        options: &StartOptions,
    ) -> StartReport {
        let mut report = StartReport::default();
        for character in characters {
            let name = character.name.clone();
            let agent_id = character.agent_id();
            let result = self.start_one(character, options).await;
            match &result {
                Ok(_) => info!(%agent_id, agent = %name, "Agent started"),
                Err(e) if e.is_benign() => info!(%agent_id, agent = %name, "Agent already running, skipping"),
                Err(e) => error!(%agent_id, agent = %name, error = %e, "Failed to start agent"),
            }
            report.outcomes.push(AgentStartOutcome {
                name,
                agent_id,
                result,
            });
        }
        self.record_running();
        report
    }

    async fn start_one(
        &self,
        character: Character,
        options: &StartOptions,
    ) -> Result<AgentSummary, LifecycleError> {
        let agent_id = character.agent_id();
        let name = character.name.clone();

        {
            let mut agents = self.agents.lock();
            if agents.contains_key(&agent_id) {
                return Err(LifecycleError::AlreadyRunning(agent_id));
            }
            agents.insert(agent_id, AgentRuntimeHandle::starting(agent_id, name.clone()));
        }
        let guard = StartingGuard {
            agents: &self.agents,
            agent_id,
            armed: true,
        };

        self.event_bus
            .publish_agent_event(AgentLifecycleEvent::AgentStarting {
                agent_id,
                name: name.clone(),
                starting_at: Utc::now(),
            });

        let fail = |reason: String, attempts: u32| {
            self.event_bus
                .publish_agent_event(AgentLifecycleEvent::AgentStartFailed {
                    agent_id,
                    name: name.clone(),
                    reason: reason.clone(),
                    attempts,
                    failed_at: Utc::now(),
                });
            LifecycleError::InitializationFailure {
                name: name.clone(),
                reason,
            }
        };

        if let Err(e) = character.validate() {
            return Err(fail(format!("invalid character: {e}"), 0));
        }

        let (mut lease, attempts) = match self.acquire_with_retry(&options.retry).await {
            Ok(acquired) => acquired,
            Err((e, attempts)) => return Err(fail(format!("storage unavailable: {e}"), attempts)),
        };

        if let Err(e) = self.initializer.initialize(&character, &mut lease).await {
            lease.release().await;
            return Err(fail(format!("{e:#}"), attempts));
        }

        let lease_id = lease.lease_id();
        let started_at = Utc::now();
        let summary = {
            let mut agents = self.agents.lock();
            let Some(handle) = agents.get_mut(&agent_id) else {
                // Placeholder vanished; nothing else removes Starting handles.
                return Err(fail("agent handle lost during start".to_string(), attempts));
            };
            handle.status = AgentStatus::Running;
            handle.lease = Some(lease);
            handle.started_at = Some(started_at);
            handle.summary()
        };
        guard.disarm();

        self.event_bus
            .publish_agent_event(AgentLifecycleEvent::AgentStarted {
                agent_id,
                name,
                lease_id,
                started_at,
            });
        Ok(summary)
    }

    async fn acquire_with_retry(
        &self,
        policy: &RetryPolicy,
    ) -> Result<(PooledConnection, u32), (PoolError, u32)> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.pool.acquire().await {
                Ok(lease) => return Ok((lease, attempt)),
                Err(e) if e.is_retryable() && attempt < policy.attempts() => {
                    let delay = policy.delay_after(attempt);
                    warn!(attempt, ?delay, error = %e, "Storage lease unavailable, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err((e, attempt)),
            }
        }
    }

    /// Stop a running agent. Absent, starting or stopping agents fail with
    /// [`LifecycleError::NotRunning`].
    pub async fn stop_agent(&self, agent_id: AgentId) -> Result<AgentSummary, LifecycleError> {
        {
            let mut agents = self.agents.lock();
            match agents.get_mut(&agent_id) {
                Some(handle) if handle.status == AgentStatus::Running => {
                    handle.status = AgentStatus::Stopping;
                }
                _ => return Err(LifecycleError::NotRunning(agent_id)),
            }
        }
        info!(%agent_id, "Stopping agent");

        let connections_released = match self.registry.on_agent_stopped(agent_id).await {
            Ok(released) => released.len(),
            Err(e) => {
                warn!(%agent_id, error = %e, "Could not release realtime connections");
                0
            }
        };

        if let Err(e) = self.initializer.shutdown(agent_id).await {
            warn!(%agent_id, error = %e, "Agent shutdown hook failed");
        }

        let handle = self.agents.lock().remove(&agent_id);
        let Some(mut handle) = handle else {
            return Err(LifecycleError::NotRunning(agent_id));
        };
        if let Some(lease) = handle.lease.take() {
            lease.release().await;
        }
        handle.status = AgentStatus::Stopped;

        self.event_bus
            .publish_agent_event(AgentLifecycleEvent::AgentStopped {
                agent_id,
                connections_released,
                stopped_at: Utc::now(),
            });
        self.record_running();
        info!(%agent_id, connections_released, "Agent stopped");
        Ok(handle.summary())
    }

    /// Stop every running agent. Individual failures are collected.
    pub async fn stop_all(&self) -> StopReport {
        let ids: Vec<AgentId> = self
            .agents
            .lock()
            .values()
            .filter(|h| h.status == AgentStatus::Running)
            .map(|h| h.agent_id)
            .collect();

        let mut report = StopReport::default();
        for agent_id in ids {
            match self.stop_agent(agent_id).await {
                Ok(summary) => report.stopped.push(summary),
                Err(e) => {
                    warn!(%agent_id, error = %e, "Failed to stop agent");
                    report.failures.push(e);
                }
            }
        }
        report
    }

    pub fn list_agents(&self) -> Vec<AgentSummary> {
        let mut agents: Vec<AgentSummary> =
            self.agents.lock().values().map(|h| h.summary()).collect();
        agents.sort_by(|a, b| a.name.cmp(&b.name));
        agents
    }

    pub fn get_agent(&self, agent_id: AgentId) -> Option<AgentSummary> {
        self.agents.lock().get(&agent_id).map(|h| h.summary())
    }

    pub fn is_running(&self, agent_id: AgentId) -> bool {
        matches!(self.agents.lock().get(&agent_id), Some(h) if h.status == AgentStatus::Running)
    }

    pub fn running_count(&self) -> usize {
        self.agents
            .lock()
            .values()
            .filter(|h| h.status == AgentStatus::Running)
            .count()
    }

    fn record_running(&self) {
        metrics::gauge!("warden_agents_running").set(self.running_count() as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::registry::RealtimeRegistry;
    use crate::domain::realtime::ConnectionId;
    use crate::infrastructure::pool::testing::fake_pool;
    use tokio_util::sync::CancellationToken;

    struct RejectingInitializer;

    #[async_trait]
    impl AgentInitializer for RejectingInitializer {
        async fn initialize(
            &self,
            character: &Character,
            _storage: &mut PooledConnection,
        ) -> anyhow::Result<()> {
            anyhow::bail!("plugin '{}' not installed", character.plugins.join(","))
        }
    }

    /// Holds every start inside `initialize` until the test lets go.
    struct GatedInitializer {
        gate: tokio::sync::Semaphore,
    }

    #[async_trait]
    impl AgentInitializer for GatedInitializer {
        async fn initialize(
            &self,
            _character: &Character,
            _storage: &mut PooledConnection,
        ) -> anyhow::Result<()> {
            let _pass = self.gate.acquire().await?;
            Ok(())
        }
    }

    fn orchestrator(
        max: u32,
        initializer: Arc<dyn AgentInitializer>,
    ) -> (AgentOrchestrator, ConnectionPool, RealtimeRegistry) {
        let (pool, _) = fake_pool(max);
        let bus = EventBus::new(64);
        let (registry, actor) = RealtimeRegistry::new(bus.clone());
        tokio::spawn(actor.run(CancellationToken::new()));
        let orchestrator =
            AgentOrchestrator::new(pool.clone(), registry.clone(), initializer, bus);
        (orchestrator, pool, registry)
    }

    #[tokio::test]
    async fn test_second_start_reports_already_running() {
        let (orchestrator, pool, _) = orchestrator(3, Arc::new(StorageCheckInitializer));
        let atlas = Character::new("atlas");

        let first = orchestrator
            .start_agents(vec![atlas.clone()], &StartOptions::default())
            .await;
        assert_eq!(first.started_count(), 1);

        let second = orchestrator
            .start_agents(vec![atlas.clone()], &StartOptions::default())
            .await;
        assert_eq!(second.already_running().count(), 1);
        assert_eq!(second.failures().count(), 0);
        assert_eq!(orchestrator.running_count(), 1);
        assert_eq!(pool.stats().active, 1);
    }

    #[tokio::test]
    async fn test_concurrent_starts_yield_one_running_handle() {
        let initializer = Arc::new(GatedInitializer {
            gate: tokio::sync::Semaphore::new(0),
        });
        let (orchestrator, pool, _) = orchestrator(3, initializer.clone());
        let options = StartOptions::default();

        let first = orchestrator.start_agents(vec![Character::new("atlas")], &options);
        let second = orchestrator.start_agents(vec![Character::new("atlas")], &options);
        let release = async {
            tokio::task::yield_now().await;
            initializer.gate.add_permits(2);
        };
        let (first, second, ()) = tokio::join!(first, second, release);

        let outcomes: Vec<_> = first.outcomes.iter().chain(second.outcomes.iter()).collect();
        assert_eq!(outcomes.iter().filter(|o| o.result.is_ok()).count(), 1);
        assert_eq!(
            outcomes
                .iter()
                .filter(|o| matches!(o.result, Err(LifecycleError::AlreadyRunning(_))))
                .count(),
            1
        );
        assert_eq!(orchestrator.running_count(), 1);
        assert_eq!(pool.stats().active, 1);
    }

    #[tokio::test]
    async fn test_duplicate_in_one_batch_starts_once() {
        let (orchestrator, _, _) = orchestrator(3, Arc::new(StorageCheckInitializer));
        let report = orchestrator
            .start_agents(
                vec![Character::new("atlas"), Character::new("atlas")],
                &StartOptions::default(),
            )
            .await;
        assert!(report.outcomes[0].result.is_ok());
        assert!(matches!(
            report.outcomes[1].result,
            Err(LifecycleError::AlreadyRunning(_))
        ));
    }

    #[tokio::test]
    async fn test_stop_unknown_agent_fails_not_running() {
        let (orchestrator, _, _) = orchestrator(1, Arc::new(StorageCheckInitializer));
        let id = AgentId::from_name("ghost");
        assert_eq!(
            orchestrator.stop_agent(id).await,
            Err(LifecycleError::NotRunning(id))
        );
    }

    #[tokio::test]
    async fn test_stop_releases_lease_and_connections() {
        let (orchestrator, pool, registry) = orchestrator(2, Arc::new(StorageCheckInitializer));
        let atlas = Character::new("atlas");
        let id = atlas.agent_id();
        orchestrator
            .start_agents(vec![atlas], &StartOptions::default())
            .await;

        let conn = ConnectionId::new();
        registry.associate(conn, id).unwrap();

        let summary = orchestrator.stop_agent(id).await.unwrap();
        assert_eq!(summary.status, AgentStatus::Stopped);
        assert!(orchestrator.get_agent(id).is_none());
        assert_eq!(pool.stats().active, 0);
        assert_eq!(registry.agent_of(conn).await.unwrap(), None);
        assert_eq!(
            orchestrator.stop_agent(id).await,
            Err(LifecycleError::NotRunning(id))
        );
    }

    #[tokio::test]
    async fn test_initializer_failure_returns_lease() {
        let (orchestrator, pool, _) = orchestrator(1, Arc::new(RejectingInitializer));
        let report = orchestrator
            .start_agents(
                vec![Character::new("atlas").with_plugin("@warden/plugin-sql")],
                &StartOptions::default(),
            )
            .await;
        let failure = report.failures().next().unwrap();
        match &failure.result {
            Err(LifecycleError::InitializationFailure { reason, .. }) => {
                assert!(reason.contains("plugin-sql"));
            }
            other => panic!("unexpected result {:?}", other),
        }
        assert_eq!(pool.stats().active, 0);
        assert!(orchestrator.list_agents().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_pool_fails_start_after_retries() {
        let (orchestrator, pool, _) = orchestrator(1, Arc::new(StorageCheckInitializer));
        let held = pool.acquire().await.unwrap();
        let options = StartOptions {
            retry: RetryPolicy {
                max_attempts: 2,
                backoff_millis: 10,
                max_backoff_millis: 10,
            },
        };
        let report = orchestrator
            .start_agents(vec![Character::new("atlas")], &options)
            .await;
        assert_eq!(report.failures().count(), 1);
        assert!(orchestrator.list_agents().is_empty());
        drop(held);
    }
}
