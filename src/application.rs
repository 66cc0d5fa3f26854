//! Application logic attached to sessions.

use serde_json::{json, Value};

/// Session document state. Opaque to the lifecycle manager.
pub type Document = Value;

/// Server-side application that produces one document per session.
pub trait Application: Send + Sync {
    /// Build the document for a newly created session.
    fn create_document(&self, session_id: &str) -> Document;

    /// Called after a session has been evicted and its document dropped.
    fn on_session_destroyed(&self, _session_id: &str) {}
}

/// Application serving a fixed titled document.
#[derive(Debug, Clone)]
pub struct StaticApplication {
    title: String,
}

impl StaticApplication {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
        }
    }
}

impl Application for StaticApplication {
    fn create_document(&self, session_id: &str) -> Document {
        json!({
            "title": self.title,
            "session_id": session_id,
            "roots": [],
        })
    }
}
