//! Classification of inbound data blocks into bars or study values.
//!
//! The payload of `timescale_update`/`du` is an object whose keys are series
//! or study ids. A block is treated as bars when its key looks like a series
//! id and its tuples have six entries; everything else is a study.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

fn series_key_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^(?:sds_1|s\d+)$").expect("series key regex"))
}

pub fn is_series_key(key: &str) -> bool {
    series_key_pattern().is_match(key)
}

/// `{"i": n, "v": [...]}` entries of a block (`s` for series, `st` for studies).
pub fn block_entries(block: &Value) -> &[Value] {
    block
        .get("s")
        .or_else(|| block.get("st"))
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

pub fn entry_tuple(entry: &Value) -> Option<&[Value]> {
    entry.get("v").and_then(Value::as_array).map(Vec::as_slice)
}

/// Turnaround id stamped on a series block, if any.
pub fn block_turnaround(block: &Value) -> Option<&str> {
    block.get("t").and_then(Value::as_str)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Ohlcv,
    Indicator,
}

pub fn classify(key: &str, entries: &[Value]) -> BlockKind {
    let six_wide = entries
        .iter()
        .find_map(entry_tuple)
        .map_or(false, |tuple| tuple.len() == 6);

    if six_wide && is_series_key(key) {
        BlockKind::Ohlcv
    } else {
        BlockKind::Indicator
    }
}
