// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Realtime Connection Registry
//!
//! Tracks which agent each open realtime connection is currently talking to.
//!
//! The maps are owned by a single task ([`RegistryActor`]); every mutation and
//! query travels over one channel, so structural changes are serialized
//! without a lock. [`RealtimeRegistry`] is the cloneable handle callers use.
//!
//! Entries are removed only in response to a terminal transport event, an
//! explicit detach, or the agent stopping. There is no time-based sweep.

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::domain::agent::AgentId;
use crate::domain::events::ConnectionEvent;
use crate::domain::realtime::{ConnectionClosed, ConnectionId, RemovalReason, TransportConnection};
use crate::infrastructure::event_bus::EventBus;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("connection registry is not running")]
    Unavailable,
}

enum RegistryCommand {
    Associate {
        connection_id: ConnectionId,
        agent_id: AgentId,
    },
    Dissociate {
        connection_id: ConnectionId,
        reason: RemovalReason,
    },
    Closed(ConnectionClosed),
    ListForAgent {
        agent_id: AgentId,
        reply: oneshot::Sender<HashSet<ConnectionId>>,
    },
    AgentOf {
        connection_id: ConnectionId,
        reply: oneshot::Sender<Option<AgentId>>,
    },
    AgentStopped {
        agent_id: AgentId,
        reply: oneshot::Sender<Vec<ConnectionId>>,
    },
    Len {
        reply: oneshot::Sender<usize>,
    },
}

/// Handle to the registry's owner task.
#[derive(Clone)]
pub struct RealtimeRegistry {
    commands: mpsc::UnboundedSender<RegistryCommand>,
}

impl RealtimeRegistry {
    /// Create the handle and the actor that must be spawned to serve it.
    pub fn new(event_bus: EventBus) -> (Self, RegistryActor) {
        let (tx, rx) = mpsc::unbounded_channel();
        let actor = RegistryActor {
            commands: rx,
            by_connection: HashMap::new(),
            by_agent: HashMap::new(),
            event_bus,
        };
        (Self { commands: tx }, actor)
    }

    fn send(&self, command: RegistryCommand) -> Result<(), RegistryError> {
        self.commands
            .send(command)
            .map_err(|_| RegistryError::Unavailable)
    }

    async fn ask<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> RegistryCommand,
    ) -> Result<T, RegistryError> {
        let (reply, rx) = oneshot::channel();
        self.send(make(reply))?;
        rx.await.map_err(|_| RegistryError::Unavailable)
    }

    /// Upsert the connection's association, replacing any previous agent.
    pub fn associate(
        &self,
        connection_id: ConnectionId,
        agent_id: AgentId,
    ) -> Result<(), RegistryError> {
        self.send(RegistryCommand::Associate {
            connection_id,
            agent_id,
        })
    }

    /// Drop the connection's association. Absent entries are a no-op.
    pub fn dissociate(&self, connection_id: ConnectionId) -> Result<(), RegistryError> {
        self.send(RegistryCommand::Dissociate {
            connection_id,
            reason: RemovalReason::Detached,
        })
    }

    /// Deliver a terminal transport event.
    pub fn connection_closed(&self, event: ConnectionClosed) -> Result<(), RegistryError> {
        self.send(RegistryCommand::Closed(event))
    }

    /// Route the transport's close notification into the registry.
    pub fn attach(&self, connection: &dyn TransportConnection) {
        let commands = self.commands.clone();
        connection.on_close(Box::new(move |connection_id| {
            let _ = commands.send(RegistryCommand::Closed(ConnectionClosed { connection_id }));
        }));
    }

    pub async fn list_connections_for_agent(
        &self,
        agent_id: AgentId,
    ) -> Result<HashSet<ConnectionId>, RegistryError> {
        self.ask(|reply| RegistryCommand::ListForAgent { agent_id, reply })
            .await
    }

    pub async fn agent_of(
        &self,
        connection_id: ConnectionId,
    ) -> Result<Option<AgentId>, RegistryError> {
        self.ask(|reply| RegistryCommand::AgentOf {
            connection_id,
            reply,
        })
        .await
    }

    /// Dissociate every connection mapped to `agent_id`. Transports are left
    /// open. Returns the connections that were removed.
    pub async fn on_agent_stopped(
        &self,
        agent_id: AgentId,
    ) -> Result<Vec<ConnectionId>, RegistryError> {
        self.ask(|reply| RegistryCommand::AgentStopped { agent_id, reply })
            .await
    }

    pub async fn len(&self) -> Result<usize, RegistryError> {
        self.ask(|reply| RegistryCommand::Len { reply }).await
    }
}

/// Single owner of the registry maps.
pub struct RegistryActor {
    commands: mpsc::UnboundedReceiver<RegistryCommand>,
    by_connection: HashMap<ConnectionId, AgentId>,
    by_agent: HashMap<AgentId, HashSet<ConnectionId>>,
    event_bus: EventBus,
}

impl RegistryActor {
    /// Serve commands until cancelled or every handle is dropped.
    pub async fn run(mut self, token: CancellationToken) {
        debug!("Connection registry started");
        loop {
            let command = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                command = self.commands.recv() => match command {
                    Some(command) => command,
                    None => break,
                },
            };
            self.handle(command);
        }
        info!(remaining = self.by_connection.len(), "Connection registry stopped");
    }

    fn handle(&mut self, command: RegistryCommand) {
        match command {
            RegistryCommand::Associate {
                connection_id,
                agent_id,
            } => self.associate(connection_id, agent_id),
            RegistryCommand::Dissociate {
                connection_id,
                reason,
            } => {
                self.remove(connection_id, reason);
            }
            RegistryCommand::Closed(ConnectionClosed { connection_id }) => {
                self.remove(connection_id, RemovalReason::Closed);
            }
            RegistryCommand::ListForAgent { agent_id, reply } => {
                let set = self.by_agent.get(&agent_id).cloned().unwrap_or_default();
                let _ = reply.send(set);
            }
            RegistryCommand::AgentOf {
                connection_id,
                reply,
            } => {
                let _ = reply.send(self.by_connection.get(&connection_id).copied());
            }
            RegistryCommand::AgentStopped { agent_id, reply } => {
                let connections: Vec<ConnectionId> = self
                    .by_agent
                    .get(&agent_id)
                    .map(|set| set.iter().copied().collect())
                    .unwrap_or_default();
                for connection_id in &connections {
                    self.remove(*connection_id, RemovalReason::AgentStopped);
                }
                if !connections.is_empty() {
                    info!(%agent_id, count = connections.len(), "Released agent connections");
                }
                let _ = reply.send(connections);
            }
            RegistryCommand::Len { reply } => {
                let _ = reply.send(self.by_connection.len());
            }
        }
        metrics::gauge!("warden_registry_connections").set(self.by_connection.len() as f64);
    }

    fn associate(&mut self, connection_id: ConnectionId, agent_id: AgentId) {
        let previous = self.by_connection.insert(connection_id, agent_id);
        if previous == Some(agent_id) {
            return;
        }
        if let Some(previous) = previous {
            self.unlink(previous, connection_id);
        }
        self.by_agent.entry(agent_id).or_default().insert(connection_id);

        debug!(%connection_id, %agent_id, "Connection associated");
        self.event_bus
            .publish_connection_event(ConnectionEvent::ConnectionAssociated {
                connection_id,
                agent_id,
                previous_agent_id: previous,
                associated_at: Utc::now(),
            });
    }

    fn remove(&mut self, connection_id: ConnectionId, reason: RemovalReason) -> bool {
        let Some(agent_id) = self.by_connection.remove(&connection_id) else {
            return false;
        };
        self.unlink(agent_id, connection_id);

        debug!(%connection_id, %agent_id, ?reason, "Connection removed");
        self.event_bus
            .publish_connection_event(ConnectionEvent::ConnectionRemoved {
                connection_id,
                agent_id,
                reason,
                removed_at: Utc::now(),
            });
        true
    }

    fn unlink(&mut self, agent_id: AgentId, connection_id: ConnectionId) {
        if let Some(set) = self.by_agent.get_mut(&agent_id) {
            set.remove(&connection_id);
            if set.is_empty() {
                self.by_agent.remove(&agent_id);
            }
        }
    }
}
