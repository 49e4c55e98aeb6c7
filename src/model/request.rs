use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::bar::OhlcvBar;
use super::study::IndicatorSeries;

/// User session credentials, forwarded only to the indicator config lookup.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Credentials {
    pub session_id: String,
    pub session_sign: String,
}

/// A request for `bars_count` bars of `symbol` at `resolution`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ChartRequest {
    pub symbol: String,
    pub resolution: String,
    pub bars_count: u32,
    /// Names of indicators to compute alongside the bars.
    #[serde(default)]
    pub indicators: Vec<String>,
    #[serde(default)]
    pub credentials: Option<Credentials>,
}

impl ChartRequest {
    pub fn new(symbol: impl Into<String>, resolution: impl Into<String>, bars_count: u32) -> Self {
        Self {
            symbol: symbol.into(),
            resolution: resolution.into(),
            bars_count,
            indicators: Vec::new(),
            credentials: None,
        }
    }

    pub fn with_indicator(mut self, name: impl Into<String>) -> Self {
        self.indicators.push(name.into());
        self
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }
}

/// Selected fields of the server's `symbol_resolved` payload.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct SymbolMetadata {
    pub symbol: String,
    pub resolution: String,
    pub name: Option<String>,
    pub description: Option<String>,
    pub exchange: Option<String>,
    pub kind: Option<String>,
    pub timezone: Option<String>,
    pub currency_code: Option<String>,
    pub session: Option<String>,
    pub pricescale: Option<f64>,
}

impl SymbolMetadata {
    pub fn from_resolved(symbol: &str, resolution: &str, info: &Value) -> Self {
        let text = |key: &str| info.get(key).and_then(Value::as_str).map(str::to_string);
        Self {
            symbol: symbol.to_string(),
            resolution: resolution.to_string(),
            name: text("name"),
            description: text("description"),
            exchange: text("exchange"),
            kind: text("type"),
            timezone: text("timezone"),
            currency_code: text("currency_code"),
            session: text("session"),
            pricescale: info.get("pricescale").and_then(Value::as_f64),
        }
    }
}

/// Result of one chart request.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ChartData {
    /// Ascending by time.
    pub bars: Vec<OhlcvBar>,
    pub metadata: SymbolMetadata,
    /// `None` when no indicators were requested or none could be set up.
    pub indicators: Option<Vec<IndicatorSeries>>,
}
