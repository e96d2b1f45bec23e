// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Realtime Server
//!
//! Axum router exposing the host to realtime clients.
//!
//! | Route | Method | Description |
//! |-------|--------|-------------|
//! | `/ws` | GET (upgrade) | JSON frame WebSocket; `send_message` associates the socket with an agent |
//! | `/health` | GET | Uptime, running agents, registry size, pool counters |
//! | `/agents` | GET | Live agent summaries |
//!
//! Each socket is wrapped in a [`WsConnection`] and handed to the registry
//! only through the [`TransportConnection`] capability. The read loop is the
//! sole issuer of registry mutations for its connection and always delivers
//! the close event when it exits, whatever the reason.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::application::host::HostContext;
use crate::application::lifecycle::AgentOrchestrator;
use crate::application::registry::RealtimeRegistry;
use crate::domain::agent::AgentId;
use crate::domain::realtime::{
    ClientFrame, CloseHandler, ConnectionId, SendMessagePayload, ServerFrame, TransportConnection,
};
use crate::infrastructure::pool::ConnectionPool;

const OUTBOUND_BUFFER: usize = 64;

/// Capability view of one WebSocket.
pub struct WsConnection {
    id: ConnectionId,
    closing: CancellationToken,
    /// `None` once the close handlers have run.
    handlers: Mutex<Option<Vec<CloseHandler>>>,
}

impl WsConnection {
    pub fn new() -> Self {
        Self {
            id: ConnectionId::new(),
            closing: CancellationToken::new(),
            handlers: Mutex::new(Some(Vec::new())),
        }
    }

    /// Resolves once `close()` has been requested.
    pub async fn close_requested(&self) {
        self.closing.cancelled().await
    }

    /// Run the close handlers. Only the first call has any effect.
    pub fn fire_close(&self) {
        let handlers = self.handlers.lock().take();
        for handler in handlers.into_iter().flatten() {
            handler(self.id);
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.handlers.lock().is_none()
    }
}

impl Default for WsConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportConnection for WsConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn close(&self) {
        self.closing.cancel();
    }

    fn on_close(&self, handler: CloseHandler) {
        {
            let mut handlers = self.handlers.lock();
            if let Some(pending) = handlers.as_mut() {
                pending.push(handler);
                return;
            }
        }
        handler(self.id);
    }
}

/// Outbound queues of every open socket.
#[derive(Default)]
pub struct OutboundHub {
    senders: Mutex<HashMap<ConnectionId, mpsc::Sender<ServerFrame>>>,
}

impl OutboundHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, connection_id: ConnectionId, sender: mpsc::Sender<ServerFrame>) {
        self.senders.lock().insert(connection_id, sender);
    }

    pub fn unregister(&self, connection_id: ConnectionId) {
        self.senders.lock().remove(&connection_id);
    }

    pub fn len(&self) -> usize {
        self.senders.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Queue a frame for one connection. Full or closed queues drop it.
    pub fn send_to(&self, connection_id: ConnectionId, frame: ServerFrame) -> bool {
        let sender = self.senders.lock().get(&connection_id).cloned();
        match sender {
            Some(sender) => sender.try_send(frame).is_ok(),
            None => false,
        }
    }

    /// Fan a frame out to every connection associated with `agent_id`.
    /// Returns how many queues accepted it.
    pub async fn broadcast_to_agent(
        &self,
        registry: &RealtimeRegistry,
        agent_id: AgentId,
        frame: ServerFrame,
    ) -> usize {
        let connections = match registry.list_connections_for_agent(agent_id).await {
            Ok(connections) => connections,
            Err(e) => {
                warn!(%agent_id, error = %e, "Cannot broadcast, registry unavailable");
                return 0;
            }
        };
        connections
            .into_iter()
            .filter(|id| self.send_to(*id, frame.clone()))
            .count()
    }
}

#[derive(Clone)]
pub struct RealtimeState {
    pub orchestrator: Arc<AgentOrchestrator>,
    pub registry: RealtimeRegistry,
    pub pool: ConnectionPool,
    pub hub: Arc<OutboundHub>,
    pub started: Instant,
    pub shutdown: CancellationToken,
}

impl RealtimeState {
    pub fn from_host(host: &HostContext, shutdown: CancellationToken) -> Self {
        Self {
            orchestrator: host.orchestrator().clone(),
            registry: host.registry().clone(),
            pool: host.pool().clone(),
            hub: Arc::new(OutboundHub::new()),
            started: Instant::now(),
            shutdown,
        }
    }
}

pub fn router(state: RealtimeState) -> Router {
    Router::new()
        .route("/ws", get(ws_upgrade))
        .route("/health", get(health))
        .route("/agents", get(list_agents))
        .with_state(state)
}

/// Serve until `token` is cancelled, then drain open sockets.
pub async fn serve(
    listener: TcpListener,
    state: RealtimeState,
    token: CancellationToken,
) -> anyhow::Result<()> {
    let addr = listener.local_addr()?;
    info!("Realtime server listening on {}", addr);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await?;
    info!("Realtime server stopped");
    Ok(())
}

async fn health(State(state): State<RealtimeState>) -> impl IntoResponse {
    let registry_connections = state.registry.len().await.ok();
    Json(json!({
        "status": "ok",
        "uptime_secs": state.started.elapsed().as_secs(),
        "agents_running": state.orchestrator.running_count(),
        "registry_connections": registry_connections,
        "open_sockets": state.hub.len(),
        "pool": state.pool.stats(),
    }))
}

async fn list_agents(State(state): State<RealtimeState>) -> impl IntoResponse {
    Json(state.orchestrator.list_agents())
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<RealtimeState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: RealtimeState) {
    let conn = Arc::new(WsConnection::new());
    let connection_id = conn.id();
    state.registry.attach(conn.as_ref());

    let (tx, mut rx) = mpsc::channel::<ServerFrame>(OUTBOUND_BUFFER);
    state.hub.register(connection_id, tx);
    debug!(%connection_id, "Realtime client connected");

    let (mut sink, mut stream) = socket.split();
    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let text = match serde_json::to_string(&frame) {
                Ok(text) => text,
                Err(e) => {
                    warn!(error = %e, "Failed to encode outbound frame");
                    continue;
                }
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    loop {
        tokio::select! {
            biased;
            _ = state.shutdown.cancelled() => break,
            _ = conn.close_requested() => break,
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    handle_frame(&state, connection_id, text.as_str()).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(%connection_id, error = %e, "Realtime socket error");
                    break;
                }
            },
        }
    }

    state.hub.unregister(connection_id);
    conn.fire_close();
    let _ = writer.await;
    debug!(%connection_id, "Realtime client disconnected");
}

async fn handle_frame(state: &RealtimeState, connection_id: ConnectionId, text: &str) {
    let frame = match serde_json::from_str::<ClientFrame>(text) {
        Ok(frame) => frame,
        Err(e) => {
            state.hub.send_to(
                connection_id,
                ServerFrame::Error {
                    message: format!("invalid frame: {e}"),
                },
            );
            return;
        }
    };

    match frame {
        ClientFrame::SendMessage(payload) => on_send_message(state, connection_id, payload).await,
        ClientFrame::Detach => {
            if let Err(e) = state.registry.dissociate(connection_id) {
                warn!(%connection_id, error = %e, "Detach failed");
            }
        }
    }
}

async fn on_send_message(state: &RealtimeState, connection_id: ConnectionId, payload: SendMessagePayload) {
    let agent_id = AgentId::resolve(&payload.sender_id);
    if let Err(e) = state.registry.associate(connection_id, agent_id) {
        warn!(%connection_id, error = %e, "Could not associate connection");
        return;
    }
    let delivered = state
        .hub
        .broadcast_to_agent(
            &state.registry,
            agent_id,
            ServerFrame::Message {
                agent_id: agent_id.to_string(),
                channel_id: payload.channel_id,
                message: payload.message,
            },
        )
        .await;
    debug!(%connection_id, %agent_id, delivered, "Message fanned out");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::event_bus::EventBus;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_close_handlers_run_once() {
        let conn = WsConnection::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        conn.on_close(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        conn.fire_close();
        conn.fire_close();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(conn.is_terminated());

        let late = calls.clone();
        conn.on_close(Box::new(move |_| {
            late.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_agent_connection() {
        let (registry, actor) = RealtimeRegistry::new(EventBus::new(16));
        let token = CancellationToken::new();
        tokio::spawn(actor.run(token.clone()));
        let hub = OutboundHub::new();
        let agent = AgentId::from_name("atlas");

        let mut receivers = Vec::new();
        for _ in 0..3 {
            let id = ConnectionId::new();
            let (tx, rx) = mpsc::channel(4);
            hub.register(id, tx);
            registry.associate(id, agent).unwrap();
            receivers.push(rx);
        }
        let stranger = ConnectionId::new();
        let (tx, mut stranger_rx) = mpsc::channel(4);
        hub.register(stranger, tx);

        let frame = ServerFrame::Message {
            agent_id: agent.to_string(),
            channel_id: "c-1".into(),
            message: "hello".into(),
        };
        assert_eq!(hub.broadcast_to_agent(&registry, agent, frame.clone()).await, 3);
        for rx in receivers.iter_mut() {
            assert_eq!(rx.recv().await.unwrap(), frame);
        }
        assert!(stranger_rx.try_recv().is_err());
        token.cancel();
    }
}
