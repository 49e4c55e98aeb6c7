//! Pool configuration with tunable limits.

use std::env;
use std::time::Duration;

use tracing::warn;

use crate::session::SessionConfig;

/// Configuration for the [`ConnectionPool`](super::ConnectionPool).
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Connections serving a batch at the same time (default: 10)
    pub max_connections: usize,
    /// Requests handed to one connection per batch (default: 10)
    pub requests_per_connection: usize,
    /// Requests a connection serves before it is replaced (default: 20)
    pub max_requests_per_connection: u32,
    /// Reusable connections kept per token in persistent mode (default: 1)
    pub persistent_connections: usize,
    /// Window collapsing individual requests into one batch (default: 100ms)
    pub debounce: Duration,
    /// Settings for every connection the pool opens
    pub session: SessionConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            requests_per_connection: 10,
            max_requests_per_connection: 20,
            persistent_connections: 1,
            debounce: Duration::from_millis(100),
            session: SessionConfig::default(),
        }
    }
}

impl PoolConfig {
    pub fn builder() -> PoolConfigBuilder {
        PoolConfigBuilder::default()
    }

    /// Few connections, each carrying more requests.
    pub fn conservative() -> Self {
        Self {
            max_connections: 3,
            requests_per_connection: 20,
            ..Default::default()
        }
    }

    /// Wide fan-out for large watchlists.
    pub fn high_throughput() -> Self {
        Self {
            max_connections: 20,
            requests_per_connection: 5,
            ..Default::default()
        }
    }

    /// Defaults overridden by `CHARTFEED_*` environment variables.
    ///
    /// Recognised: `CHARTFEED_URL`, `CHARTFEED_MAX_CONNECTIONS`,
    /// `CHARTFEED_REQUESTS_PER_CONNECTION`, `CHARTFEED_MAX_REQUESTS_PER_CONNECTION`,
    /// `CHARTFEED_DEBOUNCE_MS`.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = env::var("CHARTFEED_URL") {
            config.session.url = url;
        }
        if let Some(v) = parse_var("CHARTFEED_MAX_CONNECTIONS") {
            config.max_connections = v;
        }
        if let Some(v) = parse_var("CHARTFEED_REQUESTS_PER_CONNECTION") {
            config.requests_per_connection = v;
        }
        if let Some(v) = parse_var("CHARTFEED_MAX_REQUESTS_PER_CONNECTION") {
            config.max_requests_per_connection = v;
        }
        if let Some(v) = parse_var("CHARTFEED_DEBOUNCE_MS") {
            config.debounce = Duration::from_millis(v);
        }

        config
    }
}

fn parse_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = env::var(name).ok()?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("Ignoring {}={:?}: not a number", name, raw);
            None
        }
    }
}

/// Builder pattern for PoolConfig.
#[derive(Default)]
pub struct PoolConfigBuilder {
    config: PoolConfig,
}

impl PoolConfigBuilder {
    pub fn max_connections(mut self, n: usize) -> Self {
        self.config.max_connections = n.max(1);
        self
    }

    pub fn requests_per_connection(mut self, n: usize) -> Self {
        self.config.requests_per_connection = n.max(1);
        self
    }

    pub fn max_requests_per_connection(mut self, n: u32) -> Self {
        self.config.max_requests_per_connection = n.max(1);
        self
    }

    pub fn persistent_connections(mut self, n: usize) -> Self {
        self.config.persistent_connections = n;
        self
    }

    pub fn debounce(mut self, window: Duration) -> Self {
        self.config.debounce = window;
        self
    }

    pub fn session(mut self, session: SessionConfig) -> Self {
        self.config.session = session;
        self
    }

    pub fn build(self) -> PoolConfig {
        self.config
    }
}
