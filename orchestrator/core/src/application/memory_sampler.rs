// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Periodic process-memory sampler.
//!
//! At most one sampling timer runs per sampler: `start` while running
//! restarts the cadence. Only the newest `capacity` snapshots are kept.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::domain::events::MemoryEvent;
use crate::domain::memory::{MemoryProbe, MemorySnapshot, SnapshotWindow};
use crate::infrastructure::event_bus::EventBus;

struct SamplerRun {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

struct SamplerShared {
    probe: Arc<dyn MemoryProbe>,
    window: Mutex<SnapshotWindow>,
    event_bus: EventBus,
}

impl SamplerShared {
    fn sample(&self) -> anyhow::Result<MemorySnapshot> {
        let reading = self.probe.read()?;
        let snapshot = MemorySnapshot::new(Utc::now(), reading);
        self.window.lock().push(snapshot);
        metrics::gauge!("warden_process_resident_bytes").set(snapshot.resident_bytes as f64);
        self.event_bus
            .publish_memory_event(MemoryEvent::Sampled { snapshot });
        Ok(snapshot)
    }
}

pub struct MemorySampler {
    shared: Arc<SamplerShared>,
    running: Mutex<Option<SamplerRun>>,
}

impl MemorySampler {
    pub fn new(probe: Arc<dyn MemoryProbe>, capacity: usize, event_bus: EventBus) -> Self {
        Self {
            shared: Arc::new(SamplerShared {
                probe,
                window: Mutex::new(SnapshotWindow::new(capacity)),
                event_bus,
            }),
            running: Mutex::new(None),
        }
    }

    /// Begin sampling every `interval`, first sample immediately. Restarts
    /// the cadence if already running.
    pub fn start(&self, interval: Duration) {
        let interval = interval.max(Duration::from_millis(1));
        let token = CancellationToken::new();
        let shared = self.shared.clone();
        let task_token = token.clone();
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = task_token.cancelled() => break,
                    _ = tick.tick() => {
                        if let Err(e) = shared.sample() {
                            warn!(error = %e, "Memory sample failed");
                        }
                    }
                }
            }
            debug!("Memory sampler stopped");
        });

        let previous = self.running.lock().replace(SamplerRun { token, handle });
        if let Some(previous) = previous {
            previous.token.cancel();
            previous.handle.abort();
            debug!("Memory sampler restarted");
        } else {
            debug!(interval_ms = interval.as_millis() as u64, "Memory sampler started");
        }
    }

    /// Halt sampling. Returns false if the sampler was not running.
    pub fn stop(&self) -> bool {
        match self.running.lock().take() {
            Some(run) => {
                run.token.cancel();
                run.handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .is_some_and(|run| !run.handle.is_finished())
    }

    /// Take one sample outside the timer.
    pub fn sample_now(&self) -> anyhow::Result<MemorySnapshot> {
        self.shared.sample()
    }

    /// Copy of the retained window, oldest first.
    pub fn window(&self) -> SnapshotWindow {
        self.shared.window.lock().clone()
    }

    pub fn snapshots(&self) -> Vec<MemorySnapshot> {
        self.shared.window.lock().iter().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.shared.window.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn latest(&self) -> Option<MemorySnapshot> {
        self.shared.window.lock().last().copied()
    }

    pub fn growth_rate(&self) -> f64 {
        self.shared.window.lock().growth_rate()
    }

    pub fn clear(&self) {
        self.shared.window.lock().clear();
    }
}

impl Drop for MemorySampler {
    fn drop(&mut self) {
        self.stop();
    }
}
