use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChartError {
    #[error("Network connection failed: {0}")]
    Connection(String),

    #[error("Server reported a protocol error: {0}")]
    Protocol(String),

    #[error("Symbol error for {symbol}: {reason}")]
    Symbol { symbol: String, reason: String },

    #[error("No data received for {symbol}, symbol may be invalid or unavailable")]
    DataTimeout { symbol: String },

    #[error("Connection stale: no activity for {idle_ms}ms")]
    StaleConnection { idle_ms: u128 },

    #[error("WebSocket error: {0}")]
    Socket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Failed to parse JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Internal channel closed")]
    ChannelClosed,

    #[error("Invalid URL")]
    UrlParse(#[from] url::ParseError),

    #[error("Indicator setup failed: {0}")]
    Indicator(String),
}

impl ChartError {
    /// True for failures tied to one symbol rather than to the connection.
    pub fn is_symbol_scoped(&self) -> bool {
        matches!(self, Self::Symbol { .. } | Self::DataTimeout { .. })
    }
}

pub type Result<T> = std::result::Result<T, ChartError>;
