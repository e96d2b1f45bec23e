// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Event Bus Implementation - Pub/Sub for Domain Events
//
// Provides in-memory event streaming using tokio broadcast channels.
// Presence indicators, the health endpoint and the leak checker subscribe here.
// The channel is bounded: slow receivers lag and lose old events rather than
// growing the buffer.

use crate::domain::agent::AgentId;
use crate::domain::events::{AgentLifecycleEvent, ConnectionEvent, MemoryEvent, PoolEvent};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Unified domain event type for the event bus
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    AgentLifecycle(AgentLifecycleEvent),
    Connection(ConnectionEvent),
    Pool(PoolEvent),
    Memory(MemoryEvent),
}

/// Event bus for publishing and subscribing to domain events
#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<DomainEvent>>,
}

impl EventBus {
    /// Create a new event bus with specified channel capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Create event bus with default capacity (1000)
    pub fn with_default_capacity() -> Self {
        Self::new(1000)
    }

    pub fn publish_agent_event(&self, event: AgentLifecycleEvent) {
        self.publish(DomainEvent::AgentLifecycle(event));
    }

    pub fn publish_connection_event(&self, event: ConnectionEvent) {
        self.publish(DomainEvent::Connection(event));
    }

    pub fn publish_pool_event(&self, event: PoolEvent) {
        self.publish(DomainEvent::Pool(event));
    }

    pub fn publish_memory_event(&self, event: MemoryEvent) {
        self.publish(DomainEvent::Memory(event));
    }

    fn publish(&self, event: DomainEvent) {
        // send() only fails when nobody is subscribed
        if self.sender.send(event).is_err() {
            debug!("No subscribers listening to event");
        }
    }

    /// Subscribe to all domain events
    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
        }
    }

    /// Subscribe to lifecycle and connection events of a single agent
    pub fn subscribe_agent(&self, agent_id: AgentId) -> AgentEventReceiver {
        AgentEventReceiver {
            receiver: self.sender.subscribe(),
            agent_id,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// Receiver for all domain events
pub struct EventReceiver {
    receiver: broadcast::Receiver<DomainEvent>,
}

impl EventReceiver {
    /// Receive the next event (waits until one is available)
    pub async fn recv(&mut self) -> Result<DomainEvent, EventBusError> {
        self.receiver.recv().await.map_err(map_recv_error)
    }

    /// Try to receive an event without waiting
    pub fn try_recv(&mut self) -> Result<DomainEvent, EventBusError> {
        self.receiver.try_recv().map_err(|e| match e {
            broadcast::error::TryRecvError::Empty => EventBusError::Empty,
            broadcast::error::TryRecvError::Closed => EventBusError::Closed,
            broadcast::error::TryRecvError::Lagged(n) => {
                warn!("Event receiver lagged by {} events", n);
                EventBusError::Lagged(n)
            }
        })
    }
}

/// Receiver filtered to one agent
pub struct AgentEventReceiver {
    receiver: broadcast::Receiver<DomainEvent>,
    agent_id: AgentId,
}

impl AgentEventReceiver {
    pub async fn recv(&mut self) -> Result<DomainEvent, EventBusError> {
        loop {
            let event = self.receiver.recv().await.map_err(map_recv_error)?;
            let matches = match &event {
                DomainEvent::AgentLifecycle(e) => e.agent_id() == self.agent_id,
                DomainEvent::Connection(e) => e.agent_id() == self.agent_id,
                _ => false,
            };
            if matches {
                return Ok(event);
            }
        }
    }
}

fn map_recv_error(e: broadcast::error::RecvError) -> EventBusError {
    match e {
        broadcast::error::RecvError::Closed => EventBusError::Closed,
        broadcast::error::RecvError::Lagged(n) => {
            warn!("Event receiver lagged by {} events", n);
            EventBusError::Lagged(n)
        }
    }
}

/// Errors that can occur when receiving events
#[derive(Debug, thiserror::Error)]
pub enum EventBusError {
    #[error("Event bus is closed")]
    Closed,

    #[error("No events available")]
    Empty,

    #[error("Receiver lagged by {0} events (events were dropped)")]
    Lagged(u64),
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::realtime::{ConnectionId, RemovalReason};
    use chrono::Utc;

    #[tokio::test]
    async fn test_event_bus_publish_subscribe() {
        let event_bus = EventBus::new(10);
        let mut receiver = event_bus.subscribe();

        let agent_id = AgentId::new();
        event_bus.publish_agent_event(AgentLifecycleEvent::AgentStopped {
            agent_id,
            connections_released: 2,
            stopped_at: Utc::now(),
        });

        match receiver.recv().await.unwrap() {
            DomainEvent::AgentLifecycle(AgentLifecycleEvent::AgentStopped {
                agent_id: id,
                connections_released,
                ..
            }) => {
                assert_eq!(id, agent_id);
                assert_eq!(connections_released, 2);
            }
            other => panic!("Wrong event type received: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_agent_event_filtering() {
        let event_bus = EventBus::new(10);
        let agent_id = AgentId::new();
        let mut receiver = event_bus.subscribe_agent(agent_id);

        event_bus.publish_connection_event(ConnectionEvent::ConnectionRemoved {
            connection_id: ConnectionId::new(),
            agent_id: AgentId::new(),
            reason: RemovalReason::Closed,
            removed_at: Utc::now(),
        });
        let connection_id = ConnectionId::new();
        event_bus.publish_connection_event(ConnectionEvent::ConnectionRemoved {
            connection_id,
            agent_id,
            reason: RemovalReason::AgentStopped,
            removed_at: Utc::now(),
        });

        match receiver.recv().await.unwrap() {
            DomainEvent::Connection(ConnectionEvent::ConnectionRemoved {
                connection_id: id, ..
            }) => assert_eq!(id, connection_id),
            other => panic!("Wrong event type received: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_harmless() {
        let event_bus = EventBus::new(2);
        assert_eq!(event_bus.subscriber_count(), 0);
        event_bus.publish_pool_event(PoolEvent::IdleConnectionsReaped {
            count: 1,
            reaped_at: Utc::now(),
        });

        let mut receiver = event_bus.subscribe();
        assert!(matches!(receiver.try_recv(), Err(EventBusError::Empty)));
    }
}
