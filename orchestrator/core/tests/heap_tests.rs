// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use warden_core::domain::memory::MemoryProbe;
use warden_core::infrastructure::heap::{heap_usage, CountingAllocator};
use warden_core::infrastructure::memory_probe::SysinfoMemoryProbe;

#[global_allocator]
static ALLOC: CountingAllocator = CountingAllocator;

const BLOCK: usize = 8 * 1024 * 1024;

// Single test in this binary so no other test allocates concurrently.
#[test]
fn counting_allocator_tracks_live_and_peak_bytes() {
    let before = heap_usage().expect("counting allocator installed");

    let block = std::hint::black_box(vec![1u8; BLOCK]);
    let during = heap_usage().unwrap();
    assert!(during.used_bytes >= before.used_bytes + BLOCK as u64);
    assert!(during.peak_bytes >= during.used_bytes);

    drop(block);
    let after = heap_usage().unwrap();
    assert!(after.used_bytes + (BLOCK as u64) <= during.used_bytes);
    assert!(after.peak_bytes >= during.used_bytes);

    let reading = SysinfoMemoryProbe::new().read().unwrap();
    let heap = reading.heap.expect("memory reading includes heap counters");
    assert!(heap.used_bytes > 0);
}
