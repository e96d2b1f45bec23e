// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod event_bus;
pub mod heap;
pub mod memory_probe;
pub mod pool;
pub mod postgres;
pub mod tasks;

pub use event_bus::{DomainEvent, EventBus, EventBusError};
pub use pool::{ConnectionPool, PooledConnection};
