//! Per-connection state and the WebSocket read/write loops.
//!
//! Frames from one connection are handled strictly in arrival order: the
//! reader loop runs each handler to completion before pulling the next
//! frame. A writer task drains the connection's outbound queue — the same
//! queue the registry's session handle feeds — so live deliveries and
//! handshake replies share one ordered path to the socket.

use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info};

use tether_core::ids::{AccountId, ConnectionId, SessionId};
use tether_core::protocol::Frame;
use tether_sync::registry::{SessionHandle, WsOutbound};
use tether_sync::HeartbeatThrottle;

use crate::server::AppState;

const SOCKET_PING_INTERVAL: Duration = Duration::from_secs(30);

/// Where a connection stands in the AUTH → ID handshake.
enum Phase {
    AwaitingAuth,
    Authenticated {
        account: AccountId,
    },
    Bound {
        account: AccountId,
        session: SessionId,
    },
}

/// State owned by one WebSocket connection.
pub struct ConnectionState {
    pub id: ConnectionId,
    phase: Phase,
    throttle: HeartbeatThrottle,
    tx: mpsc::Sender<WsOutbound>,
}

impl ConnectionState {
    pub fn new(tx: mpsc::Sender<WsOutbound>, liveness_interval: Duration) -> Self {
        Self {
            id: ConnectionId::new(),
            phase: Phase::AwaitingAuth,
            throttle: HeartbeatThrottle::new(liveness_interval),
            tx,
        }
    }

    /// Serialize a frame onto this connection's outbound queue.
    pub fn send_frame(&self, frame: &Frame) -> bool {
        match serde_json::to_string(frame) {
            Ok(text) => self.tx.try_send(WsOutbound::Text(text)).is_ok(),
            Err(_) => false,
        }
    }

    pub fn authenticate(&mut self, account: AccountId) {
        self.phase = Phase::Authenticated { account };
    }

    /// Bind the authenticated connection to its session identity.
    pub fn bind(&mut self, session: SessionId) {
        if let Phase::Authenticated { account } | Phase::Bound { account, .. } =
            std::mem::replace(&mut self.phase, Phase::AwaitingAuth)
        {
            self.phase = Phase::Bound { account, session };
        }
    }

    pub fn account(&self) -> Option<&AccountId> {
        match &self.phase {
            Phase::AwaitingAuth => None,
            Phase::Authenticated { account } | Phase::Bound { account, .. } => Some(account),
        }
    }

    /// The (account, session) pair once the handshake completed.
    pub fn bound(&self) -> Option<(&AccountId, &SessionId)> {
        match &self.phase {
            Phase::Bound { account, session } => Some((account, session)),
            _ => None,
        }
    }

    pub fn is_bound(&self) -> bool {
        matches!(self.phase, Phase::Bound { .. })
    }

    /// Registry handle feeding this connection's outbound queue.
    pub fn session_handle(&self) -> SessionHandle {
        SessionHandle::new(self.id.clone(), self.tx.clone())
    }

    /// Whether a durable liveness write is due for this connection.
    pub fn liveness_write_due(&self) -> bool {
        self.throttle.should_persist()
    }
}

/// Run one WebSocket connection to completion.
pub async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::channel::<WsOutbound>(state.config.max_send_queue);
    let mut conn = ConnectionState::new(
        tx,
        Duration::from_secs(state.config.liveness_write_interval_secs),
    );
    info!(connection_id = %conn.id, "websocket connected");

    // Writer: forward queued frames, ping periodically, close on request.
    let writer_cid = conn.id.clone();
    let writer = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(SOCKET_PING_INTERVAL);
        ping_interval.tick().await; // consume the immediate first tick

        loop {
            tokio::select! {
                out = rx.recv() => match out {
                    Some(WsOutbound::Text(text)) => {
                        if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    Some(WsOutbound::Close) => {
                        debug!(connection_id = %writer_cid, "close requested");
                        let _ = ws_tx.send(WsMessage::Close(None)).await;
                        break;
                    }
                    None => break,
                },
                _ = ping_interval.tick() => {
                    if ws_tx.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Reader: frames handled in arrival order; the handshake must finish
    // within a bounded window or the connection is dropped.
    let handshake_deadline = tokio::time::Instant::now()
        + Duration::from_secs(state.config.handshake_timeout_secs);
    loop {
        let next = if conn.is_bound() {
            ws_rx.next().await
        } else {
            match tokio::time::timeout_at(handshake_deadline, ws_rx.next()).await {
                Ok(next) => next,
                Err(_) => {
                    info!(connection_id = %conn.id, "handshake timed out, dropping connection");
                    break;
                }
            }
        };

        let Some(Ok(msg)) = next else { break };
        match msg {
            WsMessage::Text(text) => {
                crate::handlers::handle_frame(&mut conn, &text, &state.engine);
            }
            WsMessage::Close(_) => break,
            // axum answers pings itself; pongs only prove the socket lives
            WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Binary(_) => {}
        }
    }

    if let Some((_, session)) = conn.bound() {
        state.engine.registry.remove(session, &conn.id);
    }
    info!(connection_id = %conn.id, "websocket disconnected");

    drop(conn);
    let _ = writer.await;
}
