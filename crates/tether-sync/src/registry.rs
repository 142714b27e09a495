//! Single-live-connection-per-session registry.
//!
//! The registry is a liveness cache, never the source of truth for
//! delivery state: anything that matters durably lives in the pending
//! queue. One handle per session; a re-registration replaces the previous
//! handle (last writer wins), whose outbound queue then closes and takes
//! the stale writer task down with it.

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::warn;

use tether_core::ids::{ConnectionId, SessionId};

/// What a connection's writer task drains from its queue.
#[derive(Debug, Clone, PartialEq)]
pub enum WsOutbound {
    Text(String),
    /// Ask the writer to close the socket.
    Close,
}

/// Live-socket handle for one session. Cheap to clone; all clones feed
/// the same outbound queue.
#[derive(Clone)]
pub struct SessionHandle {
    connection_id: ConnectionId,
    tx: mpsc::Sender<WsOutbound>,
}

impl SessionHandle {
    pub fn new(connection_id: ConnectionId, tx: mpsc::Sender<WsOutbound>) -> Self {
        Self { connection_id, tx }
    }

    pub fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    /// Put a frame on the connection's outbound queue. `false` means the
    /// queue is full or the connection is gone — the caller must fall back
    /// to durable persistence.
    pub fn send(&self, text: String) -> bool {
        match self.tx.try_send(WsOutbound::Text(text)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(connection_id = %self.connection_id, "outbound queue full, dropping send");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    fn request_close(&self) {
        let _ = self.tx.try_send(WsOutbound::Close);
    }
}

/// Registry of the live connection per session.
pub struct ConnectionRegistry {
    connections: DashMap<SessionId, SessionHandle>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
        }
    }

    /// Bind a session to its live connection, unconditionally replacing any
    /// prior handle. Dual connections are not supported.
    pub fn register(&self, session_id: SessionId, handle: SessionHandle) {
        if let Some(previous) = self.connections.insert(session_id, handle) {
            previous.request_close();
        }
    }

    /// The live handle for a session, if any.
    pub fn lookup(&self, session_id: &SessionId) -> Option<SessionHandle> {
        self.connections.get(session_id).map(|h| h.clone())
    }

    /// Drop a session's registration on connection close. Only removes the
    /// entry while it still belongs to the closing connection, so a
    /// replaced connection's late close cannot evict its successor.
    pub fn remove(&self, session_id: &SessionId, connection_id: &ConnectionId) {
        let _ = self
            .connections
            .remove_if(session_id, |_, handle| {
                handle.connection_id() == connection_id
            });
    }

    /// Close a session's live connection if one exists. No-op otherwise.
    pub fn force_close(&self, session_id: &SessionId) {
        if let Some((_, handle)) = self.connections.remove(session_id) {
            handle.request_close();
        }
    }

    /// Number of live connections.
    pub fn count(&self) -> usize {
        self.connections.len()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
