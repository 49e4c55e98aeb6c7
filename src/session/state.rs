//! Per-connection protocol state.

use std::collections::BTreeMap;

use rand::Rng;
use serde_json::Value;
use tracing::{debug, trace};

use super::extract::{self, BlockKind};
use crate::model::{ChartData, IndicatorSeries, OhlcvBar, StudyConfig, SymbolMetadata};

/// Lifecycle of one physical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Authenticated,
    SessionReady,
    Serving,
    Closing,
}

impl ConnectionState {
    /// Ready for, or busy with, chart requests.
    pub fn is_usable(&self) -> bool {
        matches!(self, Self::SessionReady | Self::Serving)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Authenticated => "authenticated",
            Self::SessionReady => "session-ready",
            Self::Serving => "serving",
            Self::Closing => "closing",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Everything one connection knows about its chart and quote sessions.
///
/// `request_count` only ever grows. Everything collected for a request is
/// wiped by [`reset_request_data`](Self::reset_request_data) before the next
/// one starts.
#[derive(Debug)]
pub struct SessionState {
    chart_session_id: String,
    quote_session_id: String,
    connection_id: Option<String>,
    request_count: u32,

    symbol: String,
    resolution: String,
    bars: BTreeMap<i64, OhlcvBar>,
    metadata: Option<SymbolMetadata>,
    indicators: Vec<IndicatorSeries>,
    expected_indicators: usize,
    /// Every study created for this request, including abandoned ones.
    created_studies: Vec<String>,
}

impl SessionState {
    pub fn new() -> Self {
        Self {
            chart_session_id: format!("cs_{}", random_suffix()),
            quote_session_id: format!("qs_{}", random_suffix()),
            connection_id: None,
            request_count: 0,
            symbol: String::new(),
            resolution: String::new(),
            bars: BTreeMap::new(),
            metadata: None,
            indicators: Vec::new(),
            expected_indicators: 0,
            created_studies: Vec::new(),
        }
    }

    pub fn chart_session_id(&self) -> &str {
        &self.chart_session_id
    }

    pub fn quote_session_id(&self) -> &str {
        &self.quote_session_id
    }

    pub fn connection_id(&self) -> Option<&str> {
        self.connection_id.as_deref()
    }

    /// Record the server-assigned id. Only the first call has an effect.
    pub fn set_connection_id(&mut self, id: String) {
        if self.connection_id.is_none() {
            self.connection_id = Some(id);
        }
    }

    pub fn request_count(&self) -> u32 {
        self.request_count
    }

    pub fn turnaround_id(&self) -> String {
        format!("s{}", self.request_count)
    }

    pub fn symbol_session_id(&self) -> String {
        format!("sds_sym_{}", self.request_count)
    }

    pub fn study_id(&self, index: usize) -> String {
        format!("st_{}_{}", self.request_count, index)
    }

    /// The series is created on the first request and modified afterwards.
    pub fn is_first_request(&self) -> bool {
        self.request_count == 1
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Start a new request. Returns the ids of studies left on the chart by
    /// the previous one so the caller can remove them.
    pub fn begin_request(&mut self, symbol: &str, resolution: &str) -> Vec<String> {
        let stale_studies = std::mem::take(&mut self.created_studies);
        self.reset_request_data();
        self.request_count += 1;
        self.symbol = symbol.to_string();
        self.resolution = resolution.to_string();
        stale_studies
    }

    pub fn reset_request_data(&mut self) {
        self.symbol.clear();
        self.resolution.clear();
        self.bars.clear();
        self.metadata = None;
        self.indicators.clear();
        self.expected_indicators = 0;
        self.created_studies.clear();
    }

    pub fn register_indicator(&mut self, id: String, config: StudyConfig) {
        self.created_studies.push(id.clone());
        self.indicators.push(IndicatorSeries::new(id, config));
        self.expected_indicators += 1;
    }

    /// Stop waiting for a study the server refused.
    pub fn abandon_indicator(&mut self, study_id: &str) {
        let before = self.indicators.len();
        self.indicators.retain(|s| s.id != study_id);
        let removed = before - self.indicators.len();
        self.expected_indicators = self.expected_indicators.saturating_sub(removed);
    }

    pub fn expected_indicators(&self) -> usize {
        self.expected_indicators
    }

    pub fn set_metadata(&mut self, info: &Value) {
        self.metadata = Some(SymbolMetadata::from_resolved(
            &self.symbol,
            &self.resolution,
            info,
        ));
    }

    /// Insert a bar, replacing any earlier bar with the same time.
    pub fn record_bar(&mut self, bar: OhlcvBar) {
        self.bars.insert(bar.time, bar);
    }

    pub fn bar_count(&self) -> usize {
        self.bars.len()
    }

    /// Collected bars, ascending by time.
    pub fn bars(&self) -> Vec<OhlcvBar> {
        self.bars.values().copied().collect()
    }

    /// Route every block of a `timescale_update`/`du` payload. Returns the
    /// number of tuples accepted.
    pub fn apply_series_data(&mut self, data: &Value) -> usize {
        let Some(blocks) = data.as_object() else {
            return 0;
        };
        let current_turnaround = self.turnaround_id();
        let mut accepted = 0;

        for (key, block) in blocks {
            let entries = extract::block_entries(block);
            if entries.is_empty() {
                continue;
            }

            match extract::classify(key, entries) {
                BlockKind::Ohlcv => {
                    if let Some(t) = extract::block_turnaround(block) {
                        if t != current_turnaround {
                            debug!("Ignoring stale series data for {} (current {})", t, current_turnaround);
                            continue;
                        }
                    }
                    for tuple in entries.iter().filter_map(extract::entry_tuple) {
                        match OhlcvBar::from_tuple(tuple) {
                            Some(bar) => {
                                self.record_bar(bar);
                                accepted += 1;
                            }
                            None => trace!("Dropping invalid bar {:?}", tuple),
                        }
                    }
                }
                BlockKind::Indicator => {
                    let Some(series) = self.indicators.iter_mut().find(|s| s.matches_key(key)) else {
                        trace!("No study registered for block {}", key);
                        continue;
                    };
                    for tuple in entries.iter().filter_map(extract::entry_tuple) {
                        if series.push_tuple(tuple) {
                            accepted += 1;
                        }
                    }
                }
            }
        }

        accepted
    }

    /// Bars present and every registered study has produced a value.
    pub fn is_complete(&self) -> bool {
        let reporting = self.indicators.iter().filter(|s| !s.values.is_empty()).count();
        !self.bars.is_empty() && reporting >= self.expected_indicators
    }

    /// Move the collected data out. Studies that produced nothing are left out.
    pub fn take_result(&mut self) -> ChartData {
        let bars = std::mem::take(&mut self.bars).into_values().collect();
        let metadata = self.metadata.take().unwrap_or_else(|| SymbolMetadata {
            symbol: self.symbol.clone(),
            resolution: self.resolution.clone(),
            ..Default::default()
        });
        let indicators: Vec<IndicatorSeries> = self
            .indicators
            .iter()
            .filter(|s| !s.values.is_empty())
            .cloned()
            .collect();

        ChartData {
            bars,
            metadata,
            indicators: (!indicators.is_empty()).then_some(indicators),
        }
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

fn random_suffix() -> String {
    let mut rng = rand::thread_rng();
    (0..12).map(|_| rng.gen_range(b'a'..=b'z') as char).collect()
}
