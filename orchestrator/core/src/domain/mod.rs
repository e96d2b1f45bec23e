// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Domain Layer
//!
//! Value types, error taxonomies and driver traits of the resource core.
//! Nothing in here spawns tasks or touches the network.

pub mod agent;
pub mod events;
pub mod host_config;
pub mod memory;
pub mod pool;
pub mod realtime;
