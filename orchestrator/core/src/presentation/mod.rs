// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Presentation Layer (`warden-core`)
//!
//! Network surface that translates realtime client traffic into registry and
//! orchestrator calls. No resource ownership lives here.
//!
//! | Module | Transport | Description |
//! |--------|-----------|-------------|
//! | [`realtime`] | WebSocket + HTTP (Axum) | `/ws` client frames, `/health`, `/agents` |

pub mod realtime;
