use std::collections::{HashMap, HashSet};
use std::fmt;

use axum::extract::ws::Message;
use easel_core::dto::ws::ServerFrame;
use thiserror::Error;
use tokio::sync::{RwLock, mpsc};
use uuid::Uuid;

/// Channel sender half for pushing messages to a WebSocket connection.
pub type WsSender = mpsc::UnboundedSender<Message>;

/// Identifier assigned to a connection when it is registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BroadcastError {
    #[error("no subscribers for job {0}")]
    NoSubscribers(Uuid),
}

#[derive(Default)]
struct Registry {
    connections: HashMap<ConnectionId, WsSender>,
    /// Connection -> the one job it watches
    subscriptions: HashMap<ConnectionId, Uuid>,
    /// Job -> every connection watching it
    subscribers: HashMap<Uuid, HashSet<ConnectionId>>,
}

impl Registry {
    fn unsubscribe(&mut self, conn_id: ConnectionId) -> Option<Uuid> {
        let job_id = self.subscriptions.remove(&conn_id)?;
        if let Some(conns) = self.subscribers.get_mut(&job_id) {
            conns.remove(&conn_id);
            if conns.is_empty() {
                self.subscribers.remove(&job_id);
            }
        }
        Some(job_id)
    }
}

/// Tracks live observer connections and the job each one is subscribed to.
///
/// All three maps sit behind one `RwLock`. Registration and subscription
/// changes take the write lock; broadcasts only read. Designed to be wrapped
/// in `Arc` and shared across the application.
#[derive(Default)]
pub struct ConnectionManager {
    registry: RwLock<Registry>,
}

impl ConnectionManager {
    /// Create a new, empty connection manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new connection.
    ///
    /// Returns the connection id and the receiver half of its message channel
    /// so the caller can forward messages to the WebSocket sink.
    pub async fn add(&self) -> (ConnectionId, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn_id = ConnectionId::new();
        self.registry.write().await.connections.insert(conn_id, tx);
        (conn_id, rx)
    }

    /// Unsubscribe and drop a connection. Unknown ids are a no-op.
    pub async fn remove(&self, conn_id: ConnectionId) {
        let mut registry = self.registry.write().await;
        registry.unsubscribe(conn_id);
        registry.connections.remove(&conn_id);
    }

    /// Point a connection at `job_id`, replacing any earlier subscription.
    ///
    /// Returns `false` if the connection is not registered.
    pub async fn subscribe(&self, conn_id: ConnectionId, job_id: Uuid) -> bool {
        let mut registry = self.registry.write().await;
        if !registry.connections.contains_key(&conn_id) {
            return false;
        }

        if let Some(previous) = registry.unsubscribe(conn_id) {
            tracing::debug!(conn_id = %conn_id, job_id = %previous, "Replacing subscription");
        }
        registry.subscriptions.insert(conn_id, job_id);
        registry.subscribers.entry(job_id).or_default().insert(conn_id);
        true
    }

    /// Drop the connection's subscription, returning the job it watched.
    pub async fn unsubscribe(&self, conn_id: ConnectionId) -> Option<Uuid> {
        self.registry.write().await.unsubscribe(conn_id)
    }

    /// Send a frame to a single connection.
    pub async fn send_to(&self, conn_id: ConnectionId, frame: &ServerFrame) -> bool {
        let registry = self.registry.read().await;
        match registry.connections.get(&conn_id) {
            Some(sender) => sender.send(text_message(frame)).is_ok(),
            None => false,
        }
    }

    /// Send a frame to every connection subscribed to `job_id`.
    ///
    /// Returns how many connections accepted the message. A closed channel is
    /// logged and skipped; its receive loop cleans it up.
    pub async fn broadcast(
        &self,
        job_id: Uuid,
        frame: &ServerFrame,
    ) -> Result<usize, BroadcastError> {
        let registry = self.registry.read().await;
        let Some(conns) = registry.subscribers.get(&job_id) else {
            return Err(BroadcastError::NoSubscribers(job_id));
        };

        let message = text_message(frame);
        let mut delivered = 0;
        for conn_id in conns {
            let Some(sender) = registry.connections.get(conn_id) else {
                continue;
            };
            match sender.send(message.clone()) {
                Ok(()) => delivered += 1,
                Err(_) => {
                    tracing::warn!(conn_id = %conn_id, job_id = %job_id, "Broadcast send failed");
                }
            }
        }

        Ok(delivered)
    }

    /// Return the current number of live connections.
    pub async fn connection_count(&self) -> usize {
        self.registry.read().await.connections.len()
    }

    /// Return how many connections are watching `job_id`.
    pub async fn subscriber_count(&self, job_id: Uuid) -> usize {
        self.registry
            .read()
            .await
            .subscribers
            .get(&job_id)
            .map_or(0, HashSet::len)
    }

    /// Send a Close frame to every connection, then clear all maps.
    pub async fn shutdown_all(&self) {
        let mut registry = self.registry.write().await;
        let count = registry.connections.len();
        for sender in registry.connections.values() {
            let _ = sender.send(Message::Close(None));
        }
        *registry = Registry::default();
        tracing::info!(count, "Closed all WebSocket connections");
    }
}

fn text_message(frame: &ServerFrame) -> Message {
    Message::Text(frame.to_json().into())
}
