// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Memory Snapshots & Leak Verdicts
//!
//! Pure value types behind the memory sampler and leak watchdog. A
//! [`SnapshotWindow`] is a fixed-capacity, oldest-evicted buffer so the monitor
//! cannot itself grow without bound. Growth rate is the resident delta between
//! the oldest and newest retained snapshot divided by the elapsed time.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Sustained growth above this many bytes/second is reported as a leak.
pub const DEFAULT_LEAK_THRESHOLD_BYTES_PER_SEC: f64 = 1024.0;

pub const DEFAULT_WINDOW_CAPACITY: usize = 100;

const MIB: f64 = 1024.0 * 1024.0;

/// Allocator-level counters: bytes currently allocated and the high-water
/// mark since start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeapUsage {
    pub used_bytes: u64,
    pub peak_bytes: u64,
}

/// Raw process counters as read by a [`MemoryProbe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryReading {
    pub resident_bytes: u64,
    pub virtual_bytes: u64,
    /// `None` unless the counting allocator is installed.
    pub heap: Option<HeapUsage>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemorySnapshot {
    pub timestamp: DateTime<Utc>,
    pub resident_bytes: u64,
    pub virtual_bytes: u64,
    #[serde(default)]
    pub heap: Option<HeapUsage>,
}

impl MemorySnapshot {
    pub fn new(timestamp: DateTime<Utc>, reading: MemoryReading) -> Self {
        Self {
            timestamp,
            resident_bytes: reading.resident_bytes,
            virtual_bytes: reading.virtual_bytes,
            heap: reading.heap,
        }
    }

    pub fn resident_mib(&self) -> f64 {
        self.resident_bytes as f64 / MIB
    }

    pub fn heap_used_mib(&self) -> Option<f64> {
        self.heap.map(|heap| heap.used_bytes as f64 / MIB)
    }
}

/// Source of process memory counters.
pub trait MemoryProbe: Send + Sync {
    fn read(&self) -> anyhow::Result<MemoryReading>;
}

#[derive(Debug, Clone)]
pub struct SnapshotWindow {
    capacity: usize,
    samples: VecDeque<MemorySnapshot>,
}

impl SnapshotWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(2);
        Self {
            capacity,
            samples: VecDeque::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, snapshot: MemorySnapshot) {
        while self.samples.len() >= self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(snapshot);
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn first(&self) -> Option<&MemorySnapshot> {
        self.samples.front()
    }

    pub fn last(&self) -> Option<&MemorySnapshot> {
        self.samples.back()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MemorySnapshot> {
        self.samples.iter()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    pub fn elapsed(&self) -> Duration {
        match (self.first(), self.last()) {
            (Some(first), Some(last)) => (last.timestamp - first.timestamp)
                .to_std()
                .unwrap_or(Duration::ZERO),
            _ => Duration::ZERO,
        }
    }

    /// Bytes/second between first and last snapshot. Zero with fewer than two
    /// snapshots or no elapsed time. Negative when memory shrank.
    pub fn growth_rate(&self) -> f64 {
        if self.samples.len() < 2 {
            return 0.0;
        }
        let (Some(first), Some(last)) = (self.first(), self.last()) else {
            return 0.0;
        };
        let elapsed_secs = (last.timestamp - first.timestamp).num_milliseconds() as f64 / 1000.0;
        if elapsed_secs <= 0.0 {
            return 0.0;
        }
        (last.resident_bytes as f64 - first.resident_bytes as f64) / elapsed_secs
    }
}

impl Default for SnapshotWindow {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_CAPACITY)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeakVerdict {
    Stable,
    LeakDetected,
}

impl LeakVerdict {
    pub fn from_growth(bytes_per_sec: f64, threshold: f64) -> Self {
        if bytes_per_sec > threshold {
            LeakVerdict::LeakDetected
        } else {
            LeakVerdict::Stable
        }
    }

    pub fn is_leak(&self) -> bool {
        matches!(self, LeakVerdict::LeakDetected)
    }

    /// Process exit code for standalone checks.
    pub fn exit_code(&self) -> i32 {
        match self {
            LeakVerdict::Stable => 0,
            LeakVerdict::LeakDetected => 1,
        }
    }
}

impl fmt::Display for LeakVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LeakVerdict::Stable => f.write_str("Memory usage stable"),
            LeakVerdict::LeakDetected => f.write_str("MEMORY LEAK DETECTED"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeakReport {
    pub initial_resident_bytes: u64,
    pub final_resident_bytes: u64,
    pub growth_rate_bytes_per_sec: f64,
    pub elapsed: Duration,
    pub threshold_bytes_per_sec: f64,
    pub verdict: LeakVerdict,
}

impl LeakReport {
    /// `None` when the window holds no snapshots.
    pub fn from_window(window: &SnapshotWindow, threshold_bytes_per_sec: f64) -> Option<Self> {
        let first = window.first()?;
        let last = window.last()?;
        let growth = window.growth_rate();
        Some(Self {
            initial_resident_bytes: first.resident_bytes,
            final_resident_bytes: last.resident_bytes,
            growth_rate_bytes_per_sec: growth,
            elapsed: window.elapsed(),
            threshold_bytes_per_sec,
            verdict: LeakVerdict::from_growth(growth, threshold_bytes_per_sec),
        })
    }
}

impl fmt::Display for LeakReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Memory Report:")?;
        writeln!(f, "- Initial RSS: {}MB", (self.initial_resident_bytes as f64 / MIB).round())?;
        writeln!(f, "- Final RSS: {}MB", (self.final_resident_bytes as f64 / MIB).round())?;
        writeln!(f, "- Growth Rate: {} KB/s", (self.growth_rate_bytes_per_sec / 1024.0).round())?;
        writeln!(f, "- Total Time: {}s", self.elapsed.as_secs_f64().round())?;
        write!(f, "- Status: {}", self.verdict)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn snapshot_at(secs: i64, resident_bytes: u64) -> MemorySnapshot {
        MemorySnapshot {
            timestamp: Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
            resident_bytes,
            virtual_bytes: resident_bytes * 2,
            heap: None,
        }
    }

    #[test]
    fn test_growth_rate_zero_below_two_samples() {
        let mut window = SnapshotWindow::new(10);
        assert_eq!(window.growth_rate(), 0.0);
        window.push(snapshot_at(0, 100));
        assert_eq!(window.growth_rate(), 0.0);
    }

    #[test]
    fn test_ten_megabytes_over_ten_seconds_is_a_leak() {
        let mut window = SnapshotWindow::new(10);
        window.push(snapshot_at(0, 100 * 1024 * 1024));
        window.push(snapshot_at(10, 110 * 1024 * 1024));

        let rate = window.growth_rate();
        assert!((rate - 1_048_576.0).abs() < 1.0, "rate was {rate}");

        let report = LeakReport::from_window(&window, DEFAULT_LEAK_THRESHOLD_BYTES_PER_SEC).unwrap();
        assert_eq!(report.verdict, LeakVerdict::LeakDetected);
        assert_eq!(report.verdict.exit_code(), 1);
    }

    #[test]
    fn test_small_growth_over_a_minute_is_stable() {
        let mut window = SnapshotWindow::new(10);
        let start = 100 * 1024 * 1024;
        window.push(snapshot_at(0, start));
        window.push(snapshot_at(60, start + 10_486));

        let report = LeakReport::from_window(&window, DEFAULT_LEAK_THRESHOLD_BYTES_PER_SEC).unwrap();
        assert!(report.growth_rate_bytes_per_sec < DEFAULT_LEAK_THRESHOLD_BYTES_PER_SEC);
        assert_eq!(report.verdict, LeakVerdict::Stable);
        assert_eq!(report.verdict.exit_code(), 0);
    }

    #[test]
    fn test_snapshot_carries_heap_counters() {
        let reading = MemoryReading {
            resident_bytes: 64 * 1024 * 1024,
            virtual_bytes: 512 * 1024 * 1024,
            heap: Some(HeapUsage {
                used_bytes: 3 * 1024 * 1024,
                peak_bytes: 5 * 1024 * 1024,
            }),
        };
        let snapshot = MemorySnapshot::new(Utc::now(), reading);
        assert_eq!(snapshot.heap_used_mib(), Some(3.0));
        assert_eq!(snapshot_at(0, 1).heap_used_mib(), None);
    }

    #[test]
    fn test_window_evicts_oldest() {
        let mut window = SnapshotWindow::new(3);
        for i in 0..10 {
            window.push(snapshot_at(i, i as u64));
        }
        assert_eq!(window.len(), 3);
        assert_eq!(window.first().unwrap().resident_bytes, 7);
        assert_eq!(window.last().unwrap().resident_bytes, 9);
    }

    #[test]
    fn test_report_renders_five_fields() {
        let mut window = SnapshotWindow::new(4);
        window.push(snapshot_at(0, 100 * 1024 * 1024));
        window.push(snapshot_at(10, 110 * 1024 * 1024));
        let text = LeakReport::from_window(&window, 1024.0).unwrap().to_string();

        assert!(text.contains("Initial RSS: 100MB"));
        assert!(text.contains("Final RSS: 110MB"));
        assert!(text.contains("Growth Rate: 1024 KB/s"));
        assert!(text.contains("Total Time: 10s"));
        assert!(text.contains("Status: MEMORY LEAK DETECTED"));
    }

    #[test]
    fn test_empty_window_has_no_report() {
        assert!(LeakReport::from_window(&SnapshotWindow::new(5), 1024.0).is_none());
    }
}
