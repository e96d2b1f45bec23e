// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Realtime transport vocabulary.
//!
//! The registry only ever sees a transport through [`TransportConnection`]:
//! an id, a way to close it, and a close notification. It never owns the
//! socket.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Payload of an inbound `send_message` frame. `sender_id` selects the agent
/// the connection is (re)associated with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessagePayload {
    pub channel_id: String,
    pub sender_id: String,
    pub message: String,
    #[serde(default)]
    pub server_id: String,
}

/// Frames a client may send over the realtime transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientFrame {
    SendMessage(SendMessagePayload),
    /// Explicitly drop the connection's current association.
    Detach,
}

/// Frames the host pushes to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Message {
        agent_id: String,
        channel_id: String,
        message: String,
    },
    Error {
        message: String,
    },
}

/// Terminal transport event delivered to the registry's owner task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionClosed {
    pub connection_id: ConnectionId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemovalReason {
    /// Transport closed or errored.
    Closed,
    /// Client asked to detach.
    Detached,
    /// The agent the connection pointed at was stopped.
    AgentStopped,
}

pub type CloseHandler = Box<dyn FnOnce(ConnectionId) + Send + 'static>;

/// Narrow capability view of a transport connection.
pub trait TransportConnection: Send + Sync {
    fn id(&self) -> ConnectionId;

    /// Ask the transport to close. Idempotent.
    fn close(&self);

    /// Register a handler run exactly once when the connection terminates.
    /// Registering after termination runs the handler immediately.
    fn on_close(&self, handler: CloseHandler);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_message_frame_parses() {
        let raw = r#"{"type":"send_message","payload":{"channelId":"c-1","senderId":"agent-7","message":"hi","serverId":"0"}}"#;
        let frame: ClientFrame = serde_json::from_str(raw).unwrap();
        match frame {
            ClientFrame::SendMessage(payload) => {
                assert_eq!(payload.channel_id, "c-1");
                assert_eq!(payload.sender_id, "agent-7");
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn test_detach_frame_parses_without_payload() {
        let frame: ClientFrame = serde_json::from_str(r#"{"type":"detach"}"#).unwrap();
        assert_eq!(frame, ClientFrame::Detach);
    }
}
