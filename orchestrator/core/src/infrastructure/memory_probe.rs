// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Process memory probe backed by `sysinfo`.

use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

use crate::domain::memory::{MemoryProbe, MemoryReading};
use crate::infrastructure::heap::heap_usage;

/// Reads resident and virtual size of the current process, plus heap
/// counters when the counting allocator is installed.
///
/// Only the memory of our own pid is refreshed on each read.
pub struct SysinfoMemoryProbe {
    pid: Pid,
    system: Mutex<System>,
}

impl SysinfoMemoryProbe {
    pub fn new() -> Self {
        Self::for_pid(Pid::from_u32(std::process::id()))
    }

    pub fn for_pid(pid: Pid) -> Self {
        Self {
            pid,
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SysinfoMemoryProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for SysinfoMemoryProbe {
    fn read(&self) -> Result<MemoryReading> {
        let mut system = self.system.lock();
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[self.pid]),
            true,
            ProcessRefreshKind::nothing().with_memory(),
        );
        let process = system
            .process(self.pid)
            .ok_or_else(|| anyhow!("process {} not found", self.pid))?;
        Ok(MemoryReading {
            resident_bytes: process.memory(),
            virtual_bytes: process.virtual_memory(),
            heap: heap_usage(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reads_own_process() {
        let probe = SysinfoMemoryProbe::new();
        let reading = probe.read().unwrap();
        assert!(reading.resident_bytes > 0);
    }
}
