// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use common::FixedProbe;
use warden_core::application::leak_watchdog::LeakWatchdog;
use warden_core::application::memory_sampler::MemorySampler;
use warden_core::domain::memory::{LeakReport, LeakVerdict, MemorySnapshot, SnapshotWindow};
use warden_core::infrastructure::event_bus::EventBus;

const MB: u64 = 1024 * 1024;

fn at(secs: i64, resident_bytes: u64) -> MemorySnapshot {
    MemorySnapshot {
        timestamp: Utc.timestamp_opt(1_750_000_000 + secs, 0).unwrap(),
        resident_bytes,
        virtual_bytes: 0,
        heap: None,
    }
}

#[tokio::test(start_paused = true)]
async fn sampler_never_retains_more_than_window() {
    let probe = Arc::new(FixedProbe::new(64 * MB));
    let sampler = MemorySampler::new(probe.clone(), 8, EventBus::new(4));
    sampler.start(Duration::from_millis(50));

    for _ in 0..5 {
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(sampler.len() <= 8);
    }
    assert_eq!(sampler.len(), 8);
    assert!(probe.reads.load(Ordering::SeqCst) > 8);
    sampler.stop();
}

#[test]
fn synthetic_growth_rates_match_expected_verdicts() {
    let mut leaking = SnapshotWindow::new(100);
    leaking.push(at(0, 100 * MB));
    leaking.push(at(10, 110 * MB));
    let report = LeakReport::from_window(&leaking, 1024.0).unwrap();
    assert!((report.growth_rate_bytes_per_sec - 1_048_576.0).abs() < 1.0);
    assert_eq!(report.verdict, LeakVerdict::LeakDetected);

    let mut stable = SnapshotWindow::new(100);
    stable.push(at(0, 100 * MB));
    stable.push(at(60, 100 * MB + MB / 100));
    let report = LeakReport::from_window(&stable, 1024.0).unwrap();
    assert!(report.growth_rate_bytes_per_sec < 1024.0);
    assert_eq!(report.verdict, LeakVerdict::Stable);
    assert_eq!(report.verdict.exit_code(), 0);
}

#[test]
fn watchdog_report_has_five_fields() {
    let probe = Arc::new(FixedProbe::new(50 * MB));
    let sampler = Arc::new(MemorySampler::new(probe, 10, EventBus::new(4)));
    sampler.sample_now().unwrap();
    sampler.sample_now().unwrap();

    let watchdog = LeakWatchdog::with_default_threshold(sampler, EventBus::new(4));
    let rendered = watchdog.render();
    let lines: Vec<&str> = rendered.lines().collect();
    assert_eq!(lines[0], "Memory Report:");
    assert_eq!(lines.len(), 6);
    assert_eq!(lines[1], "- Initial RSS: 50MB");
    assert_eq!(lines[2], "- Final RSS: 50MB");
    assert!(lines[5].contains("Memory usage stable"));
}
