//! Sessions and the per-application session directory.

use crate::application::{Application, Document};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{RwLock, RwLockReadGuard};
use tokio::time::Instant;
use tracing::{debug, info};

/// Identity of a session: application path plus session id.
///
/// Connections hold this key instead of the session itself so that an
/// evicted session never leaves a dangling reference behind.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub app_path: String,
    pub session_id: String,
}

/// Server-side state for one client-chosen session id.
pub struct Session {
    pub id: String,
    pub app_path: String,
    pub created_at: Instant,
    document: RwLock<Document>,
    last_active: Mutex<Instant>,
    connections: AtomicUsize,
}

impl Session {
    fn new(app_path: &str, id: &str, document: Document) -> Self {
        let now = Instant::now();
        Self {
            id: id.to_string(),
            app_path: app_path.to_string(),
            created_at: now,
            document: RwLock::new(document),
            last_active: Mutex::new(now),
            connections: AtomicUsize::new(0),
        }
    }

    pub fn key(&self) -> SessionKey {
        SessionKey {
            app_path: self.app_path.clone(),
            session_id: self.id.clone(),
        }
    }

    pub async fn document(&self) -> RwLockReadGuard<'_, Document> {
        self.document.read().await
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn touch(&self) {
        let mut last_active = self
            .last_active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *last_active = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        let last_active = self
            .last_active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        last_active.elapsed()
    }

    /// A session is expired once it has no connections and has been idle
    /// for longer than `linger`.
    pub fn is_expired(&self, linger: Duration) -> bool {
        self.connection_count() == 0 && self.idle_for() > linger
    }

    pub(crate) fn attach(&self) {
        self.connections.fetch_add(1, Ordering::SeqCst);
        self.touch();
    }

    pub(crate) fn detach(&self) {
        let _ = self
            .connections
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        self.touch();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("app_path", &self.app_path)
            .field("connections", &self.connection_count())
            .finish()
    }
}

/// All sessions belonging to one application path.
pub struct SessionDirectory {
    app_path: String,
    application: Arc<dyn Application>,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    linger: Duration,
}

impl SessionDirectory {
    pub fn new(app_path: &str, application: Arc<dyn Application>, linger: Duration) -> Self {
        Self {
            app_path: app_path.to_string(),
            application,
            sessions: RwLock::new(HashMap::new()),
            linger,
        }
    }

    /// Return the live session for `session_id`, creating it if needed.
    ///
    /// Concurrent callers for the same id all receive the same instance.
    pub async fn get_or_create_session(&self, session_id: &str) -> Arc<Session> {
        {
            let sessions = self.sessions.read().await;
            if let Some(session) = sessions.get(session_id) {
                if !session.is_expired(self.linger) {
                    return Arc::clone(session);
                }
            }
        }

        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get(session_id) {
            if !session.is_expired(self.linger) {
                return Arc::clone(session);
            }
            if let Some(stale) = sessions.remove(session_id) {
                self.destroy(stale);
            }
        }

        let document = self.application.create_document(session_id);
        let session = Arc::new(Session::new(&self.app_path, session_id, document));
        sessions.insert(session_id.to_string(), Arc::clone(&session));
        info!(app = %self.app_path, session_id, "Created session");
        session
    }

    pub async fn get(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(session_id).cloned()
    }

    /// Count a new connection on `session`, provided it is still the live
    /// entry for its id. Eviction takes the write lock, so holding the read
    /// lock here keeps the check and the increment atomic with respect to it.
    pub async fn attach(&self, session: &Arc<Session>) -> bool {
        let sessions = self.sessions.read().await;
        match sessions.get(&session.id) {
            Some(current) if Arc::ptr_eq(current, session) => {
                session.attach();
                true
            }
            _ => false,
        }
    }

    /// Drop one connection from the live session with this id.
    pub async fn detach(&self, session_id: &str) -> bool {
        match self.sessions.read().await.get(session_id) {
            Some(session) => {
                session.detach();
                true
            }
            None => false,
        }
    }

    /// Update a session's last-active time. Returns false if it is unknown.
    pub async fn touch(&self, session_id: &str) -> bool {
        match self.sessions.read().await.get(session_id) {
            Some(session) => {
                session.touch();
                true
            }
            None => false,
        }
    }

    /// Remove every connectionless session idle for longer than `max_idle`.
    /// Returns the evicted session ids.
    pub async fn evict_idle(&self, max_idle: Duration) -> Vec<String> {
        let mut sessions = self.sessions.write().await;

        let expired: Vec<String> = sessions
            .iter()
            .filter(|(_, s)| s.is_expired(max_idle))
            .map(|(id, _)| id.clone())
            .collect();

        for id in &expired {
            if let Some(session) = sessions.remove(id) {
                info!(app = %self.app_path, session_id = %id, "Discarding unused session");
                self.destroy(session);
            }
        }
        expired
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    fn destroy(&self, session: Arc<Session>) {
        let id = session.id.clone();
        // Connections only hold the session key, so this is normally the last
        // strong reference and the document is released here.
        drop(session);
        self.application.on_session_destroyed(&id);
        debug!(app = %self.app_path, session_id = %id, "Session destroyed");
    }
}
