// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Named background tasks with explicit teardown.
//!
//! Every periodic timer in the host (maintenance tick, realtime server,
//! registry owner task) is spawned through [`BackgroundTasks`]. Each task gets
//! a child [`CancellationToken`]; `shutdown()` cancels all of them and waits
//! for them to finish. Spawning a task under a name that is already in use
//! replaces the previous task instead of running two.

use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const SHUTDOWN_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

struct NamedTask {
    name: String,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct BackgroundTasks {
    root: CancellationToken,
    tasks: Mutex<Vec<NamedTask>>,
}

impl BackgroundTasks {
    pub fn new() -> Self {
        Self {
            root: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Spawn `f` under `name`. A running task with the same name is cancelled.
    pub fn spawn<F, Fut>(&self, name: impl Into<String>, f: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        if self.root.is_cancelled() {
            warn!(task = %name, "Refusing to spawn task after shutdown");
            return;
        }

        let token = self.root.child_token();
        let handle = tokio::spawn(f(token.clone()));

        let mut tasks = self.tasks.lock();
        tasks.retain(|t| !t.handle.is_finished());
        if let Some(pos) = tasks.iter().position(|t| t.name == name) {
            let previous = tasks.swap_remove(pos);
            previous.token.cancel();
            debug!(task = %name, "Replaced running background task");
        }
        tasks.push(NamedTask { name, token, handle });
    }

    /// Run `tick` every `period` until cancelled. The first tick fires after
    /// one full period.
    pub fn spawn_periodic<F, Fut>(&self, name: impl Into<String>, period: Duration, mut tick: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let task_name = name.clone();
        self.spawn(name, move |token| async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = interval.tick() => tick().await,
                }
            }
            debug!(task = %task_name, "Periodic task stopped");
        });
    }

    /// Cancel a single task by name. Returns false if no such task runs.
    pub fn cancel(&self, name: &str) -> bool {
        let mut tasks = self.tasks.lock();
        match tasks.iter().position(|t| t.name == name) {
            Some(pos) => {
                tasks.swap_remove(pos).token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn names(&self) -> Vec<String> {
        self.tasks
            .lock()
            .iter()
            .filter(|t| !t.handle.is_finished())
            .map(|t| t.name.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().iter().filter(|t| !t.handle.is_finished()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cancel every task and wait for each to finish. Tasks that ignore
    /// cancellation past the join timeout are aborted.
    pub async fn shutdown(&self) {
        self.root.cancel();
        let tasks: Vec<NamedTask> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let abort = task.handle.abort_handle();
            match tokio::time::timeout(SHUTDOWN_JOIN_TIMEOUT, task.handle).await {
                Ok(_) => debug!(task = %task.name, "Background task finished"),
                Err(_) => {
                    warn!(task = %task.name, "Background task ignored cancellation, aborting");
                    abort.abort();
                }
            }
        }
        info!("All background tasks stopped");
    }
}

impl Default for BackgroundTasks {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for BackgroundTasks {
    fn drop(&mut self) {
        self.root.cancel();
    }
}
