// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Growth-rate verdicts over the sampler's window. Diagnostic only: nothing
//! here frees memory.

use std::sync::Arc;

use chrono::Utc;
use tracing::warn;

use crate::application::memory_sampler::MemorySampler;
use crate::domain::events::MemoryEvent;
use crate::domain::memory::{LeakReport, LeakVerdict, DEFAULT_LEAK_THRESHOLD_BYTES_PER_SEC};
use crate::infrastructure::event_bus::EventBus;

pub struct LeakWatchdog {
    sampler: Arc<MemorySampler>,
    threshold_bytes_per_sec: f64,
    event_bus: EventBus,
}

impl LeakWatchdog {
    pub fn new(sampler: Arc<MemorySampler>, threshold_bytes_per_sec: f64, event_bus: EventBus) -> Self {
        Self {
            sampler,
            threshold_bytes_per_sec,
            event_bus,
        }
    }

    pub fn with_default_threshold(sampler: Arc<MemorySampler>, event_bus: EventBus) -> Self {
        Self::new(sampler, DEFAULT_LEAK_THRESHOLD_BYTES_PER_SEC, event_bus)
    }

    pub fn threshold(&self) -> f64 {
        self.threshold_bytes_per_sec
    }

    pub fn growth_rate(&self) -> f64 {
        self.sampler.growth_rate()
    }

    pub fn verdict(&self) -> LeakVerdict {
        LeakVerdict::from_growth(self.growth_rate(), self.threshold_bytes_per_sec)
    }

    pub fn report(&self) -> Option<LeakReport> {
        LeakReport::from_window(&self.sampler.window(), self.threshold_bytes_per_sec)
    }

    /// Plain-text report for operators and CI logs.
    pub fn render(&self) -> String {
        match self.report() {
            Some(report) => report.to_string(),
            None => "No memory snapshots taken".to_string(),
        }
    }

    /// Evaluate the window and publish a threshold event on a leak verdict.
    pub fn check(&self) -> LeakVerdict {
        let growth = self.growth_rate();
        let verdict = LeakVerdict::from_growth(growth, self.threshold_bytes_per_sec);
        if verdict.is_leak() {
            warn!(
                growth_rate_bytes_per_sec = growth,
                threshold_bytes_per_sec = self.threshold_bytes_per_sec,
                "Resident memory growth above threshold"
            );
            self.event_bus
                .publish_memory_event(MemoryEvent::GrowthThresholdExceeded {
                    growth_rate_bytes_per_sec: growth,
                    threshold_bytes_per_sec: self.threshold_bytes_per_sec,
                    detected_at: Utc::now(),
                });
        }
        verdict
    }
}
