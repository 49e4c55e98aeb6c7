//! Typed view over inbound protocol messages.

use serde_json::Value;

use super::message::Message;

/// Inbound message, keyed by its `method`.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    /// `symbol_resolved [cs, symbol_session, info]`
    SymbolResolved {
        symbol_session: String,
        info: Value,
    },
    /// `symbol_error [cs, symbol_session, reason]`
    SymbolError {
        symbol_session: String,
        reason: String,
    },
    /// `timescale_update` or `du`: `[cs, {key: block, ...}]`
    SeriesData { data: Value },
    /// `series_completed [cs, series_id, status, turnaround]`
    SeriesCompleted { turnaround: Option<String> },
    /// `series_error [cs, series_id, turnaround, reason]`
    SeriesError {
        turnaround: Option<String>,
        reason: String,
    },
    /// `study_completed [cs, study_id, ...]`
    StudyCompleted { study_id: String },
    /// `study_error [cs, study_id, ..., reason]`
    StudyError { study_id: String, reason: String },
    /// `critical_error` / `protocol_error`
    Fatal { reason: String },
    /// Quote session traffic (`qsd`, `quote_completed`); not used for charts.
    Quote,
    Unknown(String),
}

impl ServerEvent {
    pub fn from_message(msg: &Message) -> Self {
        let str_at = |i: usize| msg.param_str(i).map(str::to_string);

        match msg.method.as_str() {
            "symbol_resolved" => Self::SymbolResolved {
                symbol_session: str_at(1).unwrap_or_default(),
                info: msg.params.get(2).cloned().unwrap_or(Value::Null),
            },
            "symbol_error" => Self::SymbolError {
                symbol_session: str_at(1).unwrap_or_default(),
                reason: str_at(2).unwrap_or_else(|| "symbol error".to_string()),
            },
            "timescale_update" | "du" => Self::SeriesData {
                data: msg.params.get(1).cloned().unwrap_or(Value::Null),
            },
            "series_completed" => Self::SeriesCompleted {
                turnaround: str_at(3),
            },
            "series_error" => Self::SeriesError {
                turnaround: str_at(2),
                reason: last_text(msg).unwrap_or_else(|| "series error".to_string()),
            },
            "study_completed" => Self::StudyCompleted {
                study_id: str_at(1).unwrap_or_default(),
            },
            "study_error" => Self::StudyError {
                study_id: str_at(1).unwrap_or_default(),
                reason: last_text(msg).unwrap_or_else(|| "study error".to_string()),
            },
            "critical_error" | "protocol_error" => Self::Fatal {
                reason: describe_params(msg),
            },
            "qsd" | "quote_completed" => Self::Quote,
            other => Self::Unknown(other.to_string()),
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal { .. })
    }
}

fn last_text(msg: &Message) -> Option<String> {
    msg.params
        .iter()
        .rev()
        .find_map(|v| v.as_str())
        .map(str::to_string)
}

fn describe_params(msg: &Message) -> String {
    let parts: Vec<String> = msg
        .params
        .iter()
        .map(|v| match v.as_str() {
            Some(s) => s.to_string(),
            None => v.to_string(),
        })
        .collect();
    if parts.is_empty() {
        msg.method.clone()
    } else {
        format!("{}: {}", msg.method, parts.join(", "))
    }
}
