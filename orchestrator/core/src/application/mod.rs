// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod host;
pub mod leak_watchdog;
pub mod lifecycle;
pub mod memory_sampler;
pub mod registry;

// Re-export services for convenience
pub use host::{HostContext, HostOptions};
pub use leak_watchdog::LeakWatchdog;
pub use lifecycle::{AgentInitializer, AgentOrchestrator, StartReport, StopReport, StorageCheckInitializer};
pub use memory_sampler::MemorySampler;
pub use registry::{RealtimeRegistry, RegistryActor, RegistryError};
