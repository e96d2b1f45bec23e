// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::agent::AgentId;
use crate::domain::memory::MemorySnapshot;
use crate::domain::pool::LeaseId;
use crate::domain::realtime::{ConnectionId, RemovalReason};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AgentLifecycleEvent {
    AgentStarting {
        agent_id: AgentId,
        name: String,
        starting_at: DateTime<Utc>,
    },
    AgentStarted {
        agent_id: AgentId,
        name: String,
        lease_id: LeaseId,
        started_at: DateTime<Utc>,
    },
    AgentStartFailed {
        agent_id: AgentId,
        name: String,
        reason: String,
        attempts: u32,
        failed_at: DateTime<Utc>,
    },
    AgentStopped {
        agent_id: AgentId,
        connections_released: usize,
        stopped_at: DateTime<Utc>,
    },
}

impl AgentLifecycleEvent {
    pub fn agent_id(&self) -> AgentId {
        match self {
            AgentLifecycleEvent::AgentStarting { agent_id, .. }
            | AgentLifecycleEvent::AgentStarted { agent_id, .. }
            | AgentLifecycleEvent::AgentStartFailed { agent_id, .. }
            | AgentLifecycleEvent::AgentStopped { agent_id, .. } => *agent_id,
        }
    }
}

/// Registry association changes. Presence indicators listen to these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ConnectionEvent {
    ConnectionAssociated {
        connection_id: ConnectionId,
        agent_id: AgentId,
        previous_agent_id: Option<AgentId>,
        associated_at: DateTime<Utc>,
    },
    ConnectionRemoved {
        connection_id: ConnectionId,
        agent_id: AgentId,
        reason: RemovalReason,
        removed_at: DateTime<Utc>,
    },
}

impl ConnectionEvent {
    pub fn agent_id(&self) -> AgentId {
        match self {
            ConnectionEvent::ConnectionAssociated { agent_id, .. }
            | ConnectionEvent::ConnectionRemoved { agent_id, .. } => *agent_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PoolEvent {
    ConnectionOpened {
        total_opened: u64,
        opened_at: DateTime<Utc>,
    },
    IdleConnectionsReaped {
        count: usize,
        reaped_at: DateTime<Utc>,
    },
    ConnectionDiscarded {
        lease_id: LeaseId,
        reason: String,
        discarded_at: DateTime<Utc>,
    },
    AcquireTimedOut {
        waited_ms: u64,
        timed_out_at: DateTime<Utc>,
    },
    PoolClosed {
        leases_outstanding: usize,
        closed_at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MemoryEvent {
    Sampled {
        snapshot: MemorySnapshot,
    },
    GrowthThresholdExceeded {
        growth_rate_bytes_per_sec: f64,
        threshold_bytes_per_sec: f64,
        detected_at: DateTime<Utc>,
    },
}
