// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Warden Core
//!
//! Resource lifecycle core of the Warden agent host: a bounded database
//! connection pool, the realtime connection registry, the agent lifecycle
//! orchestrator and the memory sampler / leak watchdog.
//!
//! # Architecture
//!
//! - **Layer:** Core System
//! - **Purpose:** Guarantee that every pooled connection, socket association
//!   and timer owned on behalf of an agent is released exactly once.

pub mod application;
pub mod domain;
pub mod infrastructure;
pub mod presentation;

pub use domain::*;
