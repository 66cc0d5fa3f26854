//! Registry of named applications served by this process.

use crate::application::Application;
use crate::error::{Result, ServerError};
use crate::state::{Session, SessionDirectory};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Route templates mounted under every application path.
pub const PER_APP_ROUTES: &[&str] = &["/", "/ws"];

const WEBSOCKET_SUFFIX: &str = "/ws";

/// One registered application and the sessions it owns.
pub struct ApplicationContext {
    path: String,
    routes: Vec<String>,
    websocket_path: String,
    sessions: SessionDirectory,
}

impl ApplicationContext {
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Concrete routes for this application, in template order.
    pub fn routes(&self) -> &[String] {
        &self.routes
    }

    pub fn websocket_path(&self) -> &str {
        &self.websocket_path
    }

    pub fn sessions(&self) -> &SessionDirectory {
        &self.sessions
    }

    pub async fn get_session(&self, session_id: &str) -> Arc<Session> {
        self.sessions.get_or_create_session(session_id).await
    }
}

/// Maps application paths to their contexts. The set of paths is fixed once
/// the registry has been handed to the server.
pub struct ApplicationRegistry {
    route_templates: Vec<String>,
    linger: Duration,
    applications: HashMap<String, Arc<ApplicationContext>>,
}

impl ApplicationRegistry {
    pub fn new(linger: Duration) -> Self {
        Self::with_routes(
            PER_APP_ROUTES.iter().map(|r| r.to_string()).collect(),
            linger,
        )
    }

    pub fn with_routes(route_templates: Vec<String>, linger: Duration) -> Self {
        Self {
            route_templates,
            linger,
            applications: HashMap::new(),
        }
    }

    pub fn register(&mut self, path: &str, application: Arc<dyn Application>) -> Result<()> {
        if self.applications.contains_key(path) {
            return Err(ServerError::Configuration(format!(
                "duplicate application path {}",
                path
            )));
        }

        let routes: Vec<String> = self
            .route_templates
            .iter()
            .map(|template| {
                if path == "/" {
                    template.clone()
                } else {
                    format!("{}{}", path.trim_end_matches('/'), template)
                }
            })
            .collect();

        let websocket_path = routes
            .iter()
            .rev()
            .find(|r| r.ends_with(WEBSOCKET_SUFFIX))
            .cloned()
            .ok_or_else(|| {
                ServerError::Configuration(format!(
                    "couldn't find websocket path for application {}",
                    path
                ))
            })?;

        let context = ApplicationContext {
            path: path.to_string(),
            routes,
            websocket_path,
            sessions: SessionDirectory::new(path, application, self.linger),
        };
        self.applications.insert(path.to_string(), Arc::new(context));
        Ok(())
    }

    pub fn get(&self, path: &str) -> Result<Arc<ApplicationContext>> {
        self.applications
            .get(path)
            .cloned()
            .ok_or_else(|| ServerError::NotFound(path.to_string()))
    }

    pub fn contexts(&self) -> impl Iterator<Item = &Arc<ApplicationContext>> {
        self.applications.values()
    }

    pub fn len(&self) -> usize {
        self.applications.len()
    }

    pub fn is_empty(&self) -> bool {
        self.applications.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::StaticApplication;

    fn app() -> Arc<dyn Application> {
        Arc::new(StaticApplication::new("test"))
    }

    #[test]
    fn registers_routes_under_application_path() {
        let mut registry = ApplicationRegistry::new(Duration::from_secs(60));
        registry.register("/app", app()).unwrap();
        registry.register("/", app()).unwrap();

        let ctx = registry.get("/app").unwrap();
        assert_eq!(ctx.routes(), &["/app/".to_string(), "/app/ws".to_string()]);
        assert_eq!(ctx.websocket_path(), "/app/ws");

        let root = registry.get("/").unwrap();
        assert_eq!(root.websocket_path(), "/ws");
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn duplicate_path_is_a_configuration_error() {
        let mut registry = ApplicationRegistry::new(Duration::from_secs(60));
        registry.register("/app", app()).unwrap();
        assert!(matches!(
            registry.register("/app", app()),
            Err(ServerError::Configuration(_))
        ));
    }

    #[test]
    fn missing_websocket_route_is_a_configuration_error() {
        let mut registry =
            ApplicationRegistry::with_routes(vec!["/".to_string()], Duration::from_secs(60));
        assert!(matches!(
            registry.register("/app", app()),
            Err(ServerError::Configuration(_))
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn unknown_path_is_not_found() {
        let registry = ApplicationRegistry::new(Duration::from_secs(60));
        assert!(matches!(
            registry.get("/nope"),
            Err(ServerError::NotFound(p)) if p == "/nope"
        ));
    }
}
