//! Server configuration.

use crate::error::{Result, ServerError};
use std::time::Duration;

/// Default interval between keep-alive pings. Proxies such as nginx and
/// heroku time out idle connections after 60s.
pub const DEFAULT_KEEP_ALIVE_MS: i64 = 37_000;

/// Connectionless sessions are kept this long before eviction (30 minutes).
pub const DEFAULT_UNUSED_SESSION_LINGER_SECS: u64 = 60 * 30;

pub const DEFAULT_STATS_INTERVAL_MS: u64 = 15_000;
pub const DEFAULT_CLEANUP_INTERVAL_MS: u64 = 17_000;
pub const DEFAULT_NUM_WORKERS: usize = 4;

/// Configuration for a [`ServerCore`](crate::server::ServerCore).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Allowed `Host` header values, e.g. `localhost:5006`.
    pub hosts: Vec<String>,
    /// Milliseconds between keep-alive pings. 0 disables pings.
    pub keep_alive_ms: i64,
    pub unused_session_linger: Duration,
    pub stats_interval: Duration,
    pub cleanup_interval: Duration,
    /// Size of the background worker pool.
    pub num_workers: usize,
}

impl ServerConfig {
    pub fn new(hosts: Vec<String>) -> Self {
        Self {
            hosts,
            ..Self::default()
        }
    }

    /// Checks values that would make the server unusable.
    pub fn validate(&self) -> Result<()> {
        if self.keep_alive_ms < 0 {
            return Err(ServerError::Configuration(format!(
                "keep_alive_milliseconds must be >= 0, got {}",
                self.keep_alive_ms
            )));
        }
        if self.num_workers == 0 {
            return Err(ServerError::Configuration(
                "num_workers must be at least 1".to_string(),
            ));
        }
        if self.stats_interval.is_zero() || self.cleanup_interval.is_zero() {
            return Err(ServerError::Configuration(
                "maintenance intervals must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Keep-alive interval, or `None` when pings are disabled.
    pub fn keep_alive_interval(&self) -> Option<Duration> {
        if self.keep_alive_ms > 0 {
            Some(Duration::from_millis(self.keep_alive_ms as u64))
        } else {
            None
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            hosts: vec!["localhost:5006".to_string()],
            keep_alive_ms: DEFAULT_KEEP_ALIVE_MS,
            unused_session_linger: Duration::from_secs(DEFAULT_UNUSED_SESSION_LINGER_SECS),
            stats_interval: Duration::from_millis(DEFAULT_STATS_INTERVAL_MS),
            cleanup_interval: Duration::from_millis(DEFAULT_CLEANUP_INTERVAL_MS),
            num_workers: DEFAULT_NUM_WORKERS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_keep_alive_is_rejected() {
        let config = ServerConfig {
            keep_alive_ms: -1,
            ..ServerConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ServerError::Configuration(_))
        ));
    }

    #[test]
    fn zero_keep_alive_disables_pings() {
        let config = ServerConfig {
            keep_alive_ms: 0,
            ..ServerConfig::default()
        };
        assert!(config.validate().is_ok());
        assert_eq!(config.keep_alive_interval(), None);
    }

    #[test]
    fn defaults_are_valid() {
        let config = ServerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(
            config.keep_alive_interval(),
            Some(Duration::from_millis(37_000))
        );
        assert_eq!(config.num_workers, 4);
    }

    #[test]
    fn zero_workers_is_rejected() {
        let config = ServerConfig {
            num_workers: 0,
            ..ServerConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
