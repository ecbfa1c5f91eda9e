//! Process-local registry of live bidirectional connections.
//!
//! Maintains O(1) delivery from a connection id to its outbound sink plus
//! secondary indexes by session and project token. Dispatch never blocks on
//! a slow consumer: a full sink drops the connection with reason
//! `backpressure` instead.

use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;
use tracing::{debug, warn};
use ts_rs::TS;

use crate::error::CloseReason;
use crate::web::protocol::ServerFrame;

/// Outbound frames buffered per connection before backpressure kicks in.
pub const OUTBOUND_BUFFER: usize = 64;

/// Process-local identifier for a live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, TS)]
#[ts(export)]
pub struct ConnectionId(pub u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl ConnectionId {
    /// The reply channel this connection's results are routed over.
    pub fn reply_channel(&self) -> String {
        format!("conn:{}", self.0)
    }
}

struct ConnectionHandle {
    sink: mpsc::Sender<ServerFrame>,
    session_token: String,
    project_token: String,
    #[allow(dead_code)]
    created_at: Instant,
    /// Set before the sink is dropped so the writer task can tell the
    /// client why it is being closed.
    close_reason: Arc<std::sync::OnceLock<CloseReason>>,
}

/// Emitted when a connection leaves the registry for any reason.
#[derive(Debug, Clone)]
pub struct ClosedConnection {
    pub id: ConnectionId,
    pub session_token: String,
    pub project_token: String,
    pub reason: CloseReason,
}

/// Outcome of a `deliver` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliverOutcome {
    Delivered,
    /// No connection with that id; the frame was dropped.
    Unknown,
    /// The sink was full or gone; the connection has been dropped.
    Dropped,
}

pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, ConnectionHandle>,
    by_session: DashMap<String, Vec<ConnectionId>>,
    by_project: DashMap<String, Vec<ConnectionId>>,
    next_id: AtomicU64,
    closed_tx: mpsc::UnboundedSender<ClosedConnection>,
}

impl ConnectionRegistry {
    /// Create a registry and the closed-connection event stream the
    /// orchestrator consumes to orphan-seal pending requests.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ClosedConnection>) {
        let (closed_tx, closed_rx) = mpsc::unbounded_channel();
        (
            Self {
                connections: DashMap::new(),
                by_session: DashMap::new(),
                by_project: DashMap::new(),
                next_id: AtomicU64::new(1),
                closed_tx,
            },
            closed_rx,
        )
    }

    /// Register a connection, returning its id and the receiving half of
    /// its outbound sink plus the slot its close reason will be written to.
    pub fn register(
        &self,
        session_token: &str,
        project_token: &str,
    ) -> (
        ConnectionId,
        mpsc::Receiver<ServerFrame>,
        Arc<std::sync::OnceLock<CloseReason>>,
    ) {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (sink, stream) = mpsc::channel(OUTBOUND_BUFFER);
        let close_reason = Arc::new(std::sync::OnceLock::new());

        self.connections.insert(
            id,
            ConnectionHandle {
                sink,
                session_token: session_token.to_owned(),
                project_token: project_token.to_owned(),
                created_at: Instant::now(),
                close_reason: close_reason.clone(),
            },
        );
        self.by_session
            .entry(session_token.to_owned())
            .or_default()
            .push(id);
        self.by_project
            .entry(project_token.to_owned())
            .or_default()
            .push(id);

        debug!(connection_id = %id, "connection registered");
        (id, stream, close_reason)
    }

    /// Remove a connection from all indexes and drop its sink.
    pub fn close(&self, id: ConnectionId, reason: CloseReason) {
        let Some((_, handle)) = self.connections.remove(&id) else {
            return;
        };
        let _ = handle.close_reason.set(reason);

        self.unindex(&self.by_session, &handle.session_token, id);
        self.unindex(&self.by_project, &handle.project_token, id);

        let _ = self.closed_tx.send(ClosedConnection {
            id,
            session_token: handle.session_token,
            project_token: handle.project_token,
            reason,
        });
        debug!(connection_id = %id, reason = %reason, "connection closed");
        // Dropping `handle` drops the sink sender; the writer task observes
        // the closed channel and completes the WebSocket close handshake.
    }

    fn unindex(&self, index: &DashMap<String, Vec<ConnectionId>>, key: &str, id: ConnectionId) {
        if let Some(mut ids) = index.get_mut(key) {
            ids.retain(|c| *c != id);
            if ids.is_empty() {
                drop(ids);
                index.remove_if(key, |_, ids| ids.is_empty());
            }
        }
    }

    /// Enqueue a frame on a connection's outbound sink without blocking.
    pub fn deliver(&self, id: ConnectionId, frame: ServerFrame) -> DeliverOutcome {
        let result = {
            let Some(handle) = self.connections.get(&id) else {
                return DeliverOutcome::Unknown;
            };
            handle.sink.try_send(frame)
        };
        match result {
            Ok(()) => DeliverOutcome::Delivered,
            Err(TrySendError::Full(_)) => {
                warn!(connection_id = %id, "outbound sink full, dropping connection");
                self.close(id, CloseReason::Backpressure);
                DeliverOutcome::Dropped
            }
            Err(TrySendError::Closed(_)) => {
                self.close(id, CloseReason::Internal);
                DeliverOutcome::Dropped
            }
        }
    }

    /// Deliver to every connection bound to a project, optionally excluding
    /// one (the originator of a context update).
    pub fn broadcast(
        &self,
        project_token: &str,
        frame: &ServerFrame,
        except: Option<ConnectionId>,
    ) -> usize {
        let targets = self
            .by_project
            .get(project_token)
            .map(|ids| ids.clone())
            .unwrap_or_default();
        let mut delivered = 0;
        for id in targets {
            if Some(id) == except {
                continue;
            }
            if self.deliver(id, frame.clone()) == DeliverOutcome::Delivered {
                delivered += 1;
            }
        }
        delivered
    }

    pub fn connections_of_session(&self, session_token: &str) -> Vec<ConnectionId> {
        self.by_session
            .get(session_token)
            .map(|ids| ids.clone())
            .unwrap_or_default()
    }

    pub fn connections_of_project(&self, project_token: &str) -> Vec<ConnectionId> {
        self.by_project
            .get(project_token)
            .map(|ids| ids.clone())
            .unwrap_or_default()
    }

    /// Close every connection bound to a session.
    pub fn close_session(&self, session_token: &str, reason: CloseReason) {
        for id in self.connections_of_session(session_token) {
            self.close(id, reason);
        }
    }

    /// Close every connection bound to a project.
    pub fn close_project(&self, project_token: &str, reason: CloseReason) {
        for id in self.connections_of_project(project_token) {
            self.close(id, reason);
        }
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
