//! Request metadata, URL derivation and per-origin resource descriptors.

use axum::http::HeaderMap;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

const STATIC_PREFIX: &str = "static/";
const JS_FILES: &[&str] = &["js/docserve.min.js", "js/docserve-widgets.min.js"];
const CSS_FILES: &[&str] = &["css/docserve.min.css"];

/// The parts of an inbound request the lifecycle manager looks at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestMeta {
    pub host: String,
    /// `http` or `https`.
    pub protocol: String,
}

impl RequestMeta {
    pub fn new(host: impl Into<String>, protocol: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            protocol: protocol.into(),
        }
    }

    /// Read `Host` and `X-Forwarded-Proto` from request headers.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let host = headers
            .get(axum::http::header::HOST)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        let protocol = headers
            .get("x-forwarded-proto")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("http");
        Self::new(host, protocol)
    }

    pub fn root_url(&self) -> String {
        format!("{}://{}/", self.protocol, self.host)
    }

    pub fn websocket_url(&self, websocket_path: &str) -> String {
        let protocol = if self.protocol == "https" { "wss" } else { "ws" };
        format!("{}://{}{}", protocol, self.host, websocket_path)
    }
}

/// Static resource URLs served relative to one root URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Resources {
    pub mode: &'static str,
    pub root_url: String,
    pub js_files: Vec<String>,
    pub css_files: Vec<String>,
}

impl Resources {
    pub fn server(root_url: &str) -> Self {
        let url = |file: &&str| format!("{}{}{}", root_url, STATIC_PREFIX, file);
        Self {
            mode: "server",
            root_url: root_url.to_string(),
            js_files: JS_FILES.iter().map(url).collect(),
            css_files: CSS_FILES.iter().map(url).collect(),
        }
    }
}

/// Memoised [`Resources`] keyed by root URL.
///
/// Callers must validate the request host before inserting, which bounds
/// the key space to whitelisted hosts.
#[derive(Default)]
pub struct ResourceCache {
    entries: RwLock<HashMap<String, Arc<Resources>>>,
}

impl ResourceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get_or_insert(&self, root_url: &str) -> Arc<Resources> {
        if let Some(resources) = self.entries.read().await.get(root_url) {
            return Arc::clone(resources);
        }
        let mut entries = self.entries.write().await;
        Arc::clone(
            entries
                .entry(root_url.to_string())
                .or_insert_with(|| Arc::new(Resources::server(root_url))),
        )
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}
