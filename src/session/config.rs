//! Per-connection settings: endpoint, handshake timeouts and data-wait budget.

use std::time::Duration;

pub const DEFAULT_URL: &str = "wss://data.tradingview.com/socket.io/websocket?type=chart";
pub const DEFAULT_ORIGIN: &str = "https://www.tradingview.com";

/// Configuration for a single [`ChartSession`](super::ChartSession).
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// WebSocket endpoint
    pub url: String,
    /// `Origin` header sent on upgrade
    pub origin: String,
    /// Upper bound on TCP + WebSocket upgrade (default: 10s)
    pub connect_timeout: Duration,
    /// Upper bound on waiting for the server handshake (default: 10s)
    pub handshake_timeout: Duration,
    /// Quiet period after bootstrap in which a server error still rejects
    /// the connect. Any other server message ends it early (default: 200ms)
    pub bootstrap_grace: Duration,
    /// Chart session timezone (default: Etc/UTC)
    pub timezone: String,
    /// Data wait for a request with no bars and no studies (default: 5s)
    pub base_data_timeout: Duration,
    /// Extra wait per requested bar (default: 2ms)
    pub per_bar_timeout: Duration,
    /// Extra wait per study (default: 5s)
    pub per_study_timeout: Duration,
    /// Hard cap on the data wait (default: 30s)
    pub max_data_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.to_string(),
            origin: DEFAULT_ORIGIN.to_string(),
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            bootstrap_grace: Duration::from_millis(200),
            timezone: "Etc/UTC".to_string(),
            base_data_timeout: Duration::from_secs(5),
            per_bar_timeout: Duration::from_millis(2),
            per_study_timeout: Duration::from_secs(5),
            max_data_timeout: Duration::from_secs(30),
        }
    }
}

impl SessionConfig {
    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder::default()
    }

    /// How long to wait for data: grows with bar volume and study count.
    pub fn data_timeout(&self, bars_count: u32, studies: usize) -> Duration {
        let studies = u32::try_from(studies).unwrap_or(u32::MAX);
        let wait = self
            .base_data_timeout
            .saturating_add(self.per_bar_timeout.saturating_mul(bars_count))
            .saturating_add(self.per_study_timeout.saturating_mul(studies));
        wait.min(self.max_data_timeout)
    }
}

/// Builder pattern for SessionConfig.
#[derive(Default)]
pub struct SessionConfigBuilder {
    config: SessionConfig,
}

impl SessionConfigBuilder {
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.config.url = url.into();
        self
    }

    pub fn origin(mut self, origin: impl Into<String>) -> Self {
        self.config.origin = origin.into();
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.config.handshake_timeout = timeout;
        self
    }

    pub fn bootstrap_grace(mut self, grace: Duration) -> Self {
        self.config.bootstrap_grace = grace;
        self
    }

    pub fn timezone(mut self, timezone: impl Into<String>) -> Self {
        self.config.timezone = timezone.into();
        self
    }

    /// Set base, per-bar and per-study wait, and the cap.
    pub fn data_timeouts(
        mut self,
        base: Duration,
        per_bar: Duration,
        per_study: Duration,
        max: Duration,
    ) -> Self {
        self.config.base_data_timeout = base;
        self.config.per_bar_timeout = per_bar;
        self.config.per_study_timeout = per_study;
        self.config.max_data_timeout = max;
        self
    }

    pub fn build(self) -> SessionConfig {
        self.config
    }
}
