//! Server core: owns applications, connections, the worker pool and the
//! maintenance jobs, and drives the shutdown state machine.

use crate::application::Application;
use crate::config::ServerConfig;
use crate::connection::{Connection, ConnectionSet, Transport};
use crate::error::{Result, ServerError};
use crate::executor::{BackgroundExecutor, TaskHandle};
use crate::maintenance::{MaintenanceJob, MaintenanceScheduler};
use crate::registry::{ApplicationContext, ApplicationRegistry, PER_APP_ROUTES};
use crate::resources::{RequestMeta, ResourceCache, Resources};
use crate::state::Session;
use std::collections::HashSet;
use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

pub const STATS_JOB: &str = "stats";
pub const CLEANUP_JOB: &str = "cleanup";
pub const KEEP_ALIVE_JOB: &str = "keep_alive";

/// Lifecycle of a [`ServerCore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Constructed,
    Running,
    Stopping,
    Stopped,
}

pub struct ServerCore {
    config: ServerConfig,
    hosts: HashSet<String>,
    registry: Arc<ApplicationRegistry>,
    connections: Arc<ConnectionSet>,
    executor: Arc<BackgroundExecutor>,
    scheduler: MaintenanceScheduler,
    resources: ResourceCache,
    state: watch::Sender<ServerState>,
    signals_installed: AtomicBool,
}

impl ServerCore {
    /// Build a server for `applications`, keyed by application path.
    pub fn new(
        config: ServerConfig,
        applications: Vec<(String, Arc<dyn Application>)>,
    ) -> Result<Arc<Self>> {
        let routes = PER_APP_ROUTES.iter().map(|r| r.to_string()).collect();
        Self::with_routes(config, applications, routes)
    }

    /// Like [`ServerCore::new`] with custom per-application route templates.
    pub fn with_routes(
        config: ServerConfig,
        applications: Vec<(String, Arc<dyn Application>)>,
        route_templates: Vec<String>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let mut registry =
            ApplicationRegistry::with_routes(route_templates, config.unused_session_linger);
        for (path, application) in applications {
            registry.register(&path, application)?;
        }
        let registry = Arc::new(registry);
        let connections = Arc::new(ConnectionSet::new());
        let executor = Arc::new(BackgroundExecutor::new(config.num_workers));

        let mut jobs = vec![
            stats_job(config.stats_interval, &registry, &connections),
            cleanup_job(
                config.cleanup_interval,
                config.unused_session_linger,
                &registry,
            ),
        ];
        if let Some(interval) = config.keep_alive_interval() {
            jobs.push(keep_alive_job(interval, &connections));
        }

        let (state, _) = watch::channel(ServerState::Constructed);

        Ok(Arc::new(Self {
            hosts: config.hosts.iter().cloned().collect(),
            config,
            registry,
            connections,
            executor,
            scheduler: MaintenanceScheduler::new(jobs),
            resources: ResourceCache::new(),
            state,
            signals_installed: AtomicBool::new(false),
        }))
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn state(&self) -> ServerState {
        *self.state.borrow()
    }

    pub fn registry(&self) -> &ApplicationRegistry {
        &self.registry
    }

    pub fn connections(&self) -> &ConnectionSet {
        &self.connections
    }

    pub fn executor(&self) -> &BackgroundExecutor {
        &self.executor
    }

    pub fn scheduler(&self) -> &MaintenanceScheduler {
        &self.scheduler
    }

    pub fn resource_cache(&self) -> &ResourceCache {
        &self.resources
    }

    /// Begin maintenance and accept connections. Returns false unless this
    /// call moved the server out of `Constructed`.
    pub fn start(&self) -> bool {
        let started = self.state.send_if_modified(|state| {
            if *state == ServerState::Constructed {
                *state = ServerState::Running;
                true
            } else {
                false
            }
        });
        if !started {
            debug!(state = ?self.state(), "Ignoring start request");
            return false;
        }

        self.scheduler.start();
        info!(
            applications = self.registry.len(),
            jobs = ?self.scheduler.job_names(),
            "Server started"
        );
        true
    }

    /// Shut down: stop maintenance, refuse new connections and background
    /// work, then drop all connections and detach them from their sessions.
    /// Outstanding background jobs are not awaited. Returns false if a
    /// shutdown already happened or is underway.
    pub async fn stop(&self) -> bool {
        let began = self.state.send_if_modified(|state| match state {
            ServerState::Constructed | ServerState::Running => {
                *state = ServerState::Stopping;
                true
            }
            ServerState::Stopping | ServerState::Stopped => false,
        });
        if !began {
            debug!("Shutdown already in progress");
            return false;
        }

        info!("Shutdown: cleaning up");
        self.scheduler.stop();
        self.executor.shutdown(false).await;
        for connection in self.connections.snapshot().await {
            self.client_lost(&connection).await;
        }
        self.connections.clear().await;
        self.state.send_replace(ServerState::Stopped);
        info!("Shutdown complete");
        true
    }

    /// Resolves once the server reaches `Stopped`.
    pub fn stopped(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut rx = self.state.subscribe();
        async move {
            let _ = rx.wait_for(|state| *state == ServerState::Stopped).await;
        }
    }

    /// Route SIGTERM and Ctrl-C to [`ServerCore::stop`]. Only the first call
    /// installs handlers; repeated signals are absorbed by `stop`.
    pub fn install_signal_handlers(self: &Arc<Self>) -> Result<()> {
        if self.signals_installed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let mut sigterm = signal(SignalKind::terminate())?;
        let core = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = sigterm.recv() => println!("Received SIGTERM, shutting down"),
                    result = tokio::signal::ctrl_c() => {
                        if let Err(e) = result {
                            error!("Failed to listen for Ctrl-C: {}", e);
                            return;
                        }
                        println!("\nInterrupted, shutting down");
                    }
                }
                match core.upgrade() {
                    Some(core) => {
                        core.stop().await;
                    }
                    None => return,
                }
            }
        });
        Ok(())
    }

    pub fn check_host(&self, request: &RequestMeta) -> Result<()> {
        if self.hosts.contains(&request.host) {
            return Ok(());
        }
        error!(
            host = %request.host,
            "Request with Host: '{}' not in the host whitelist, if this is a valid host add a --host option",
            request.host
        );
        Err(ServerError::ForbiddenHost {
            host: request.host.clone(),
        })
    }

    pub fn root_url_for_request(&self, request: &RequestMeta) -> Result<String> {
        self.check_host(request)?;
        Ok(request.root_url())
    }

    pub fn websocket_url_for_request(
        &self,
        request: &RequestMeta,
        websocket_path: &str,
    ) -> Result<String> {
        self.check_host(request)?;
        Ok(request.websocket_url(websocket_path))
    }

    /// Resource descriptor for the request's origin, memoised per root URL.
    pub async fn resources(&self, request: &RequestMeta) -> Result<Arc<Resources>> {
        let root_url = self.root_url_for_request(request)?;
        Ok(self.resources.get_or_insert(&root_url).await)
    }

    pub fn application(&self, app_path: &str) -> Result<Arc<ApplicationContext>> {
        self.registry.get(app_path)
    }

    pub async fn get_session(&self, app_path: &str, session_id: &str) -> Result<Arc<Session>> {
        let context = self.registry.get(app_path)?;
        Ok(context.get_session(session_id).await)
    }

    /// Register a new live connection for `session`. Fails with
    /// `SessionExpired` if the session was discarded after it was looked up.
    pub async fn new_connection(
        &self,
        transport: Arc<dyn Transport>,
        context: &ApplicationContext,
        session: &Arc<Session>,
    ) -> Result<Arc<Connection>> {
        if self.state() != ServerState::Running {
            return Err(ServerError::NotAccepting);
        }
        if session.app_path != context.path() {
            return Err(ServerError::Configuration(format!(
                "session {} belongs to {}, not {}",
                session.id,
                session.app_path,
                context.path()
            )));
        }

        if !context.sessions().attach(session).await {
            return Err(ServerError::SessionExpired {
                app_path: session.app_path.clone(),
                session_id: session.id.clone(),
            });
        }
        let connection = Arc::new(Connection::new(transport, session.key()));
        self.connections.add(Arc::clone(&connection)).await;

        // stop() may have cleared the set between the state check and the add
        if self.state() != ServerState::Running {
            self.client_lost(&connection).await;
            return Err(ServerError::NotAccepting);
        }

        info!(
            connection = connection.id(),
            app = %context.path(),
            session_id = %session.id,
            "Client connected"
        );
        Ok(connection)
    }

    /// Forget a closed connection and detach it from its session. Safe to
    /// call more than once for the same connection.
    pub async fn client_lost(&self, connection: &Connection) {
        if !self.connections.remove(connection).await {
            return;
        }
        let key = connection.session_key();
        if let Ok(context) = self.registry.get(&key.app_path) {
            context.sessions().detach(&key.session_id).await;
        }
        info!(
            connection = connection.id(),
            session_id = %key.session_id,
            "Client disconnected"
        );
    }

    /// Run blocking `f` on the worker pool without stalling request handling.
    pub fn run_in_background<F, T, E>(&self, f: F) -> Result<TaskHandle<T>>
    where
        F: FnOnce() -> std::result::Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: Display + Send + 'static,
    {
        self.executor.submit(f)
    }

    pub async fn cleanup_sessions(&self) {
        cleanup_sessions(&self.registry, self.config.unused_session_linger).await;
    }
}

async fn log_stats(registry: &ApplicationRegistry, connections: &ConnectionSet) {
    let mut sessions = 0;
    for context in registry.contexts() {
        sessions += context.sessions().len().await;
    }
    info!(
        pid = std::process::id(),
        sessions,
        "[pid {}] {} clients connected",
        std::process::id(),
        connections.len().await
    );
}

async fn cleanup_sessions(registry: &ApplicationRegistry, linger: Duration) {
    for context in registry.contexts() {
        context.sessions().evict_idle(linger).await;
    }
}

async fn keep_alive(connections: &ConnectionSet) {
    connections
        .for_each(|connection| {
            if let Err(e) = connection.send_ping() {
                warn!(connection = connection.id(), "Keep-alive ping failed: {}", e);
            }
        })
        .await;
}

fn stats_job(
    interval: Duration,
    registry: &Arc<ApplicationRegistry>,
    connections: &Arc<ConnectionSet>,
) -> MaintenanceJob {
    let registry = Arc::clone(registry);
    let connections = Arc::clone(connections);
    MaintenanceJob::new(STATS_JOB, interval, move || {
        let registry = Arc::clone(&registry);
        let connections = Arc::clone(&connections);
        async move { log_stats(&registry, &connections).await }
    })
}

fn cleanup_job(
    interval: Duration,
    linger: Duration,
    registry: &Arc<ApplicationRegistry>,
) -> MaintenanceJob {
    let registry = Arc::clone(registry);
    MaintenanceJob::new(CLEANUP_JOB, interval, move || {
        let registry = Arc::clone(&registry);
        async move { cleanup_sessions(&registry, linger).await }
    })
}

fn keep_alive_job(interval: Duration, connections: &Arc<ConnectionSet>) -> MaintenanceJob {
    let connections = Arc::clone(connections);
    MaintenanceJob::new(KEEP_ALIVE_JOB, interval, move || {
        let connections = Arc::clone(&connections);
        async move { keep_alive(&connections).await }
    })
}
