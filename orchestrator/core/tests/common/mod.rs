// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use warden_core::domain::memory::{MemoryProbe, MemoryReading};
use warden_core::domain::pool::{
    ConnectionFactory, DatabaseConnection, PoolConfig, PoolError, RetryPolicy,
};

#[derive(Default)]
pub struct MockDriver {
    pub opened: AtomicUsize,
    pub closed: AtomicUsize,
    pub refuse: AtomicBool,
}

/// In-memory connection factory. Every query succeeds unless `refuse` is set,
/// in which case new connections fail to open.
#[derive(Clone, Default)]
pub struct MockConnector {
    pub driver: Arc<MockDriver>,
}

impl MockConnector {
    pub fn opened(&self) -> usize {
        self.driver.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.driver.closed.load(Ordering::SeqCst)
    }
}

struct MockConnection {
    driver: Arc<MockDriver>,
}

#[async_trait]
impl DatabaseConnection for MockConnection {
    async fn execute(&mut self, _sql: &str) -> Result<u64, PoolError> {
        Ok(0)
    }

    async fn close(self: Box<Self>) {
        self.driver.closed.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ConnectionFactory for MockConnector {
    async fn connect(&self) -> Result<Box<dyn DatabaseConnection>, PoolError> {
        if self.driver.refuse.load(Ordering::SeqCst) {
            return Err(PoolError::Connect("connection refused".to_string()));
        }
        self.driver.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockConnection {
            driver: self.driver.clone(),
        }))
    }
}

pub fn pool_config(max: u32, acquire_timeout_millis: u64) -> PoolConfig {
    PoolConfig {
        max,
        acquire_timeout_millis,
        connect_retry: RetryPolicy::none(),
        ..PoolConfig::default()
    }
}

/// Probe reporting a fixed resident size.
pub struct FixedProbe {
    pub resident: AtomicU64,
    pub reads: AtomicUsize,
}

impl FixedProbe {
    pub fn new(resident: u64) -> Self {
        Self {
            resident: AtomicU64::new(resident),
            reads: AtomicUsize::new(0),
        }
    }
}

impl MemoryProbe for FixedProbe {
    fn read(&self) -> anyhow::Result<MemoryReading> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let resident = self.resident.load(Ordering::SeqCst);
        Ok(MemoryReading {
            resident_bytes: resident,
            virtual_bytes: resident * 2,
            heap: None,
        })
    }
}
