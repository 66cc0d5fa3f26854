//! Docserve - document session server.
//!
//! Serves named applications over HTTP and WebSocket, keeps one session per
//! client-chosen id, runs periodic maintenance and shuts down cleanly on
//! SIGTERM or Ctrl-C.

#[cfg(not(unix))]
compile_error!("docserve only supports Unix-like targets.");

pub mod application;
pub mod config;
pub mod connection;
pub mod error;
pub mod executor;
pub mod http_server;
pub mod maintenance;
pub mod registry;
pub mod resources;
pub mod server;
pub mod state;

pub use application::{Application, Document, StaticApplication};
pub use config::ServerConfig;
pub use connection::{Connection, ConnectionSet, Transport};
pub use error::{Result, ServerError};
pub use executor::{BackgroundExecutor, TaskHandle};
pub use registry::{ApplicationContext, ApplicationRegistry};
pub use resources::RequestMeta;
pub use server::{ServerCore, ServerState};
pub use state::{Session, SessionDirectory, SessionKey};
