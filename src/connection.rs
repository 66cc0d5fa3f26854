//! Live client connections and the process-wide connection set.

use crate::error::Result;
use crate::state::SessionKey;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::Instant;

/// Outbound half of a client socket, supplied by the transport layer.
pub trait Transport: Send + Sync {
    /// Send a protocol-level ping frame.
    fn send_ping(&self) -> Result<()>;

    /// Send a text payload frame.
    fn send_text(&self, payload: String) -> Result<()>;
}

pub type ConnectionId = u64;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// One live client socket bound to a session of one application.
pub struct Connection {
    id: ConnectionId,
    session: SessionKey,
    transport: Arc<dyn Transport>,
    pub created_at: Instant,
}

impl Connection {
    pub fn new(transport: Arc<dyn Transport>, session: SessionKey) -> Self {
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            session,
            transport,
            created_at: Instant::now(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn session_key(&self) -> &SessionKey {
        &self.session
    }

    pub fn app_path(&self) -> &str {
        &self.session.app_path
    }

    pub fn send_ping(&self) -> Result<()> {
        self.transport.send_ping()
    }

    pub fn send_text(&self, payload: String) -> Result<()> {
        self.transport.send_text(payload)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("session", &self.session)
            .finish()
    }
}

/// All live connections in the process.
#[derive(Default)]
pub struct ConnectionSet {
    connections: RwLock<HashMap<ConnectionId, Arc<Connection>>>,
}

impl ConnectionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(&self, connection: Arc<Connection>) {
        self.connections
            .write()
            .await
            .insert(connection.id(), connection);
    }

    /// Remove a connection. Returns false if it was already gone.
    pub async fn remove(&self, connection: &Connection) -> bool {
        self.connections
            .write()
            .await
            .remove(&connection.id())
            .is_some()
    }

    /// Point-in-time copy of the set. Later adds and removes do not affect it.
    pub async fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections.read().await.values().cloned().collect()
    }

    /// Visit every connection present when the call started. `f` may add or
    /// remove connections while iteration is in progress.
    pub async fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&Arc<Connection>),
    {
        for connection in self.snapshot().await {
            f(&connection);
        }
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }

    pub async fn clear(&self) {
        self.connections.write().await.clear();
    }
}
