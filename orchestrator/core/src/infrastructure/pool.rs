// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Bounded Connection Pool
//!
//! Owns at most `max` live connections produced by a [`ConnectionFactory`].
//! Leases are handed out as [`PooledConnection`] guards: dropping a guard
//! returns the connection on every exit path, `release()` does the same
//! explicitly and awaits any close.
//!
//! Counters live under one lock so every [`PoolStats`] observation satisfies
//! `idle + active == total_opened - total_closed`.
//!
//! - Slots are a [`Semaphore`] with `max` permits; a lease holds one permit.
//! - Waiters time out with [`PoolError::Exhausted`] after `acquire_timeout`.
//! - `close()` closes the semaphore so pending waiters fail fast with
//!   [`PoolError::Closed`], waits for leases (bounded by `close_grace`), then
//!   closes idle connections and stops the idle reaper.
//! - A connection whose operation exceeded `query_timeout` is discarded on
//!   release, never returned to the idle set.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::events::PoolEvent;
use crate::domain::pool::{
    ConnectionFactory, DatabaseConnection, LeaseId, PoolConfig, PoolError, PoolStats,
};
use crate::infrastructure::event_bus::EventBus;

struct IdleConnection {
    conn: Box<dyn DatabaseConnection>,
    idle_deadline: Instant,
}

#[derive(Default)]
struct PoolState {
    idle: VecDeque<IdleConnection>,
    active: usize,
    waiting: usize,
    total_opened: u64,
    total_closed: u64,
}

impl PoolState {
    fn stats(&self, max: usize) -> PoolStats {
        PoolStats {
            idle: self.idle.len(),
            active: self.active,
            max,
            waiting: self.waiting,
            total_opened: self.total_opened,
            total_closed: self.total_closed,
        }
    }

    /// Remove idle connections whose deadline has passed.
    fn take_expired(&mut self, now: Instant) -> Vec<Box<dyn DatabaseConnection>> {
        let mut expired = Vec::new();
        let mut kept = VecDeque::with_capacity(self.idle.len());
        for entry in self.idle.drain(..) {
            if entry.idle_deadline <= now {
                expired.push(entry.conn);
            } else {
                kept.push_back(entry);
            }
        }
        self.idle = kept;
        self.total_closed += expired.len() as u64;
        expired
    }
}

struct PoolInner {
    config: PoolConfig,
    factory: Arc<dyn ConnectionFactory>,
    permits: Arc<Semaphore>,
    state: Mutex<PoolState>,
    closing: AtomicBool,
    drained: Notify,
    shutdown: CancellationToken,
    reaper: Mutex<Option<JoinHandle<()>>>,
    event_bus: EventBus,
}

impl PoolInner {
    fn max(&self) -> usize {
        self.config.max as usize
    }

    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Return a leased connection. Yields it back when it must be closed
    /// instead (poisoned, pool closing, or pool over capacity).
    fn check_in(
        &self,
        conn: Box<dyn DatabaseConnection>,
        poisoned: bool,
    ) -> Option<Box<dyn DatabaseConnection>> {
        let mut state = self.state.lock();
        state.active = state.active.saturating_sub(1);

        let discard =
            poisoned || self.is_closing() || state.idle.len() + state.active >= self.max();
        let result = if discard {
            state.total_closed += 1;
            Some(conn)
        } else {
            state.idle.push_back(IdleConnection {
                conn,
                idle_deadline: Instant::now() + self.config.idle_timeout(),
            });
            None
        };

        record_gauges(&state);
        if state.active == 0 && self.is_closing() {
            self.drained.notify_one();
        }
        result
    }

    /// Pop the most recently returned idle connection that is still fresh.
    fn take_idle(
        &self,
    ) -> (
        Option<Box<dyn DatabaseConnection>>,
        Vec<Box<dyn DatabaseConnection>>,
    ) {
        let mut state = self.state.lock();
        let expired = state.take_expired(Instant::now());
        let conn = state.idle.pop_back().map(|entry| entry.conn);
        if conn.is_some() {
            state.active += 1;
        }
        record_gauges(&state);
        (conn, expired)
    }

    async fn open_connection(&self) -> Result<Box<dyn DatabaseConnection>, PoolError> {
        let policy = &self.config.connect_retry;
        let mut attempt = 0;
        loop {
            attempt += 1;
            if self.is_closing() {
                return Err(PoolError::Closed);
            }

            let result = match tokio::time::timeout(
                self.config.connection_timeout(),
                self.factory.connect(),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(PoolError::Connect(format!(
                    "timed out after {:?}",
                    self.config.connection_timeout()
                ))),
            };

            match result {
                Ok(conn) => return Ok(conn),
                Err(e) if e.is_retryable() && attempt < policy.attempts() => {
                    let delay = policy.delay_after(attempt);
                    warn!(attempt, ?delay, error = %e, "Connection attempt failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Count a freshly opened connection as leased.
    fn record_opened(&self) -> u64 {
        let mut state = self.state.lock();
        state.total_opened += 1;
        state.active += 1;
        record_gauges(&state);
        state.total_opened
    }

    fn reap_idle(&self) -> Vec<Box<dyn DatabaseConnection>> {
        let mut state = self.state.lock();
        let expired = state.take_expired(Instant::now());
        record_gauges(&state);
        expired
    }
}

fn record_gauges(state: &PoolState) {
    metrics::gauge!("warden_pool_idle_connections").set(state.idle.len() as f64);
    metrics::gauge!("warden_pool_active_leases").set(state.active as f64);
}

async fn close_all(conns: Vec<Box<dyn DatabaseConnection>>) {
    for conn in conns {
        conn.close().await;
    }
}

/// Decrements the waiter count even if the acquiring future is dropped.
struct WaiterGuard<'a> {
    inner: &'a PoolInner,
}

impl<'a> WaiterGuard<'a> {
    fn new(inner: &'a PoolInner) -> Self {
        inner.state.lock().waiting += 1;
        Self { inner }
    }
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        state.waiting = state.waiting.saturating_sub(1);
    }
}

#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Create a pool without opening anything or starting the reaper.
    pub fn new(
        config: PoolConfig,
        factory: Arc<dyn ConnectionFactory>,
        event_bus: EventBus,
    ) -> Result<Self, PoolError> {
        config.validate()?;
        let permits = Arc::new(Semaphore::new(config.max as usize));
        Ok(Self {
            inner: Arc::new(PoolInner {
                config,
                factory,
                permits,
                state: Mutex::new(PoolState::default()),
                closing: AtomicBool::new(false),
                drained: Notify::new(),
                shutdown: CancellationToken::new(),
                reaper: Mutex::new(None),
                event_bus,
            }),
        })
    }

    /// Create the pool, open `min` connections and start the idle reaper.
    pub async fn connect(
        config: PoolConfig,
        factory: Arc<dyn ConnectionFactory>,
        event_bus: EventBus,
    ) -> Result<Self, PoolError> {
        let pool = Self::new(config, factory, event_bus)?;
        pool.warm_up().await?;
        pool.start_reaper();
        info!(
            max = pool.inner.config.max,
            min = pool.inner.config.min,
            idle_timeout_ms = pool.inner.config.idle_timeout_millis,
            "Connection pool ready"
        );
        Ok(pool)
    }

    async fn warm_up(&self) -> Result<(), PoolError> {
        for _ in 0..self.inner.config.min {
            let conn = self.inner.open_connection().await?;
            let (total_opened, rejected) = self.inner.park_fresh(conn);
            if let Some(conn) = rejected {
                conn.close().await;
            }
            self.inner.event_bus.publish_pool_event(PoolEvent::ConnectionOpened {
                total_opened,
                opened_at: Utc::now(),
            });
        }
        Ok(())
    }

    /// Spawn the idle reaper. Replaces a previously started reaper.
    pub fn start_reaper(&self) {
        let inner = self.inner.clone();
        let period = inner.config.reap_interval();
        let token = inner.shutdown.clone();
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval_at(Instant::now() + period, period);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = tick.tick() => {
                        let expired = inner.reap_idle();
                        if !expired.is_empty() {
                            let count = expired.len();
                            close_all(expired).await;
                            debug!(count, "Reaped idle connections");
                            inner.event_bus.publish_pool_event(PoolEvent::IdleConnectionsReaped {
                                count,
                                reaped_at: Utc::now(),
                            });
                        }
                    }
                }
            }
            debug!("Idle reaper stopped");
        });
        if let Some(previous) = self.inner.reaper.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Lease a connection, waiting up to `acquire_timeout` for a free slot.
    pub async fn acquire(&self) -> Result<PooledConnection, PoolError> {
        let inner = &self.inner;
        if inner.is_closing() {
            return Err(PoolError::Closed);
        }

        let waited = inner.config.acquire_timeout();
        let permit = {
            let _waiter = WaiterGuard::new(inner);
            tokio::time::timeout(waited, inner.permits.clone().acquire_owned()).await
        };
        let permit = match permit {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(PoolError::Closed),
            Err(_) => {
                metrics::counter!("warden_pool_acquire_timeouts_total").increment(1);
                warn!(waited_ms = waited.as_millis() as u64, "Connection pool exhausted");
                inner.event_bus.publish_pool_event(PoolEvent::AcquireTimedOut {
                    waited_ms: waited.as_millis() as u64,
                    timed_out_at: Utc::now(),
                });
                return Err(PoolError::Exhausted { waited });
            }
        };
        if inner.is_closing() {
            return Err(PoolError::Closed);
        }

        // A popped connection is counted as active, so it must be inside a
        // lease guard before this future can suspend again.
        let (idle, expired) = inner.take_idle();
        if !expired.is_empty() {
            tokio::spawn(close_all(expired));
        }

        let lease = match idle {
            Some(conn) => self.lease(conn, permit),
            None => {
                let conn = inner.open_connection().await?;
                let total_opened = inner.record_opened();
                let lease = self.lease(conn, permit);
                inner.event_bus.publish_pool_event(PoolEvent::ConnectionOpened {
                    total_opened,
                    opened_at: Utc::now(),
                });
                lease
            }
        };
        debug!(lease_id = %lease.lease_id, "Connection leased");
        Ok(lease)
    }

    fn lease(
        &self,
        conn: Box<dyn DatabaseConnection>,
        permit: OwnedSemaphorePermit,
    ) -> PooledConnection {
        PooledConnection {
            lease_id: LeaseId::new(),
            acquired_at: Utc::now(),
            conn: Some(conn),
            permit: Some(permit),
            poisoned: false,
            pool: self.inner.clone(),
        }
    }

    /// Return a lease explicitly, awaiting the close when it is discarded.
    pub async fn release(&self, conn: PooledConnection) {
        conn.release().await;
    }

    /// Acquire, run `SELECT 1`, release. Does not change pool sizing.
    pub async fn test_connection(&self) -> bool {
        let mut lease = match self.acquire().await {
            Ok(lease) => lease,
            Err(e) => {
                tracing::error!(error = %e, "Failed to connect to the database");
                return false;
            }
        };
        let result = lease.ping().await;
        lease.release().await;
        match result {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(error = %e, "Database health check query failed");
                false
            }
        }
    }

    /// Close idle connections past their deadline. Returns how many closed.
    pub async fn reap_idle(&self) -> usize {
        let expired = self.inner.reap_idle();
        let count = expired.len();
        close_all(expired).await;
        count
    }

    /// Stop accepting acquires, fail pending waiters, wait for outstanding
    /// leases up to the grace period, then close idle connections.
    pub async fn close(&self) {
        let inner = &self.inner;
        if inner.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        inner.permits.close();
        inner.shutdown.cancel();

        let reaper = inner.reaper.lock().take();
        if let Some(handle) = reaper {
            let _ = handle.await;
        }

        let grace = inner.config.close_grace();
        let drained = tokio::time::timeout(grace, async {
            loop {
                if inner.state.lock().active == 0 {
                    break;
                }
                inner.drained.notified().await;
            }
        })
        .await;

        let leases_outstanding = inner.state.lock().active;
        if drained.is_err() {
            warn!(
                leases_outstanding,
                grace_ms = grace.as_millis() as u64,
                "Pool close grace period elapsed with leases outstanding"
            );
        }

        let idle: Vec<Box<dyn DatabaseConnection>> = {
            let mut state = inner.state.lock();
            let idle: Vec<_> = state.idle.drain(..).map(|entry| entry.conn).collect();
            state.total_closed += idle.len() as u64;
            record_gauges(&state);
            idle
        };
        close_all(idle).await;

        inner.event_bus.publish_pool_event(PoolEvent::PoolClosed {
            leases_outstanding,
            closed_at: Utc::now(),
        });
        info!(leases_outstanding, "Connection pool closed");
    }

    pub fn stats(&self) -> PoolStats {
        self.inner.state.lock().stats(self.inner.max())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closing()
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }
}

impl PoolInner {
    /// Count a freshly opened, never-leased connection and park it idle.
    fn park_fresh(
        &self,
        conn: Box<dyn DatabaseConnection>,
    ) -> (u64, Option<Box<dyn DatabaseConnection>>) {
        let mut state = self.state.lock();
        state.total_opened += 1;
        if self.is_closing() || state.idle.len() + state.active >= self.max() {
            state.total_closed += 1;
            return (state.total_opened, Some(conn));
        }
        state.idle.push_back(IdleConnection {
            conn,
            idle_deadline: Instant::now() + self.config.idle_timeout(),
        });
        record_gauges(&state);
        (state.total_opened, None)
    }
}

/// An exclusive lease on one pooled connection.
pub struct PooledConnection {
    lease_id: LeaseId,
    acquired_at: DateTime<Utc>,
    conn: Option<Box<dyn DatabaseConnection>>,
    permit: Option<OwnedSemaphorePermit>,
    poisoned: bool,
    pool: Arc<PoolInner>,
}

impl PooledConnection {
    pub fn lease_id(&self) -> LeaseId {
        self.lease_id
    }

    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }

    /// True once the connection is no longer trusted for reuse.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Run one statement bounded by the pool's query timeout. A timeout or
    /// connection-level failure marks the lease for discard on release.
    pub async fn execute(&mut self, sql: &str) -> Result<u64, PoolError> {
        let timeout = self.pool.config.query_timeout();
        let conn = self.conn.as_mut().ok_or(PoolError::Closed)?;
        match tokio::time::timeout(timeout, conn.execute(sql)).await {
            Ok(Ok(rows)) => Ok(rows),
            Ok(Err(e)) => {
                if matches!(e, PoolError::Connect(_)) {
                    self.poisoned = true;
                }
                Err(e)
            }
            Err(_) => {
                self.poisoned = true;
                warn!(lease_id = %self.lease_id, ?timeout, "Query timed out, connection will be discarded");
                Err(PoolError::QueryTimeout(timeout))
            }
        }
    }

    pub async fn ping(&mut self) -> Result<(), PoolError> {
        self.execute("SELECT 1").await.map(|_| ())
    }

    /// Return the connection to the pool, awaiting the close if it is discarded.
    pub async fn release(mut self) {
        if let Some(conn) = self.finish() {
            conn.close().await;
        }
    }

    /// Check the connection in and free the slot. Returns the connection if
    /// it has to be closed by the caller.
    fn finish(&mut self) -> Option<Box<dyn DatabaseConnection>> {
        let conn = self.conn.take()?;
        let discard = self.pool.check_in(conn, self.poisoned);
        if discard.is_some() {
            let reason = if self.poisoned { "poisoned" } else { "pool draining or full" };
            debug!(lease_id = %self.lease_id, reason, "Discarding connection on release");
            self.pool.event_bus.publish_pool_event(PoolEvent::ConnectionDiscarded {
                lease_id: self.lease_id,
                reason: reason.to_string(),
                discarded_at: Utc::now(),
            });
        }
        // Slot frees only after the counters are updated.
        drop(self.permit.take());
        discard
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.finish() {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(conn.close());
                }
                Err(_) => drop(conn),
            }
        }
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("lease_id", &self.lease_id)
            .field("acquired_at", &self.acquired_at)
            .field("poisoned", &self.poisoned)
            .finish()
    }
}
