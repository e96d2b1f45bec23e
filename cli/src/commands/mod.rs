// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Command implementations for the Warden CLI

pub mod config;
pub mod leak_check;
pub mod start;

pub use self::config::ConfigCommand;
pub use self::leak_check::LeakCheckArgs;
pub use self::start::StartArgs;
