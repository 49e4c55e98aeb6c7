//! Builders for outbound protocol messages.

use serde_json::{json, Value};

use super::message::Message;
use super::study::StudyConfig;

/// Series id used for the single series each chart session carries.
pub const SERIES_ID: &str = "sds_1";

/// Script endpoint studies are created against.
pub const SCRIPT_ENDPOINT: &str = "Script@tv-scripting-101!";

/// Fields requested on the quote session.
pub const QUOTE_FIELDS: &[&str] = &[
    "ch", "chp", "current_session", "description", "exchange", "lp", "lp_time",
    "pricescale", "short_name", "type", "update_mode", "volume",
];

pub fn set_auth_token(token: &str) -> Message {
    Message::new("set_auth_token", vec![json!(token)])
}

pub fn chart_create_session(chart_session: &str) -> Message {
    Message::new("chart_create_session", vec![json!(chart_session), json!("")])
}

pub fn chart_delete_session(chart_session: &str) -> Message {
    Message::new("chart_delete_session", vec![json!(chart_session)])
}

pub fn switch_timezone(chart_session: &str, timezone: &str) -> Message {
    Message::new("switch_timezone", vec![json!(chart_session), json!(timezone)])
}

pub fn quote_create_session(quote_session: &str) -> Message {
    Message::new("quote_create_session", vec![json!(quote_session)])
}

pub fn quote_set_fields(quote_session: &str) -> Message {
    let mut params = vec![json!(quote_session)];
    params.extend(QUOTE_FIELDS.iter().map(|f| json!(f)));
    Message::new("quote_set_fields", params)
}

pub fn quote_delete_session(quote_session: &str) -> Message {
    Message::new("quote_delete_session", vec![json!(quote_session)])
}

/// `resolve_symbol` takes the symbol as an `=`-prefixed JSON string.
pub fn resolve_symbol(chart_session: &str, symbol_session: &str, symbol: &str) -> Message {
    let descriptor = json!({ "adjustment": "splits", "symbol": symbol });
    Message::new(
        "resolve_symbol",
        vec![
            json!(chart_session),
            json!(symbol_session),
            json!(format!("={}", descriptor)),
        ],
    )
}

pub fn create_series(
    chart_session: &str,
    turnaround: &str,
    symbol_session: &str,
    resolution: &str,
    bars_count: u32,
) -> Message {
    Message::new(
        "create_series",
        vec![
            json!(chart_session),
            json!(SERIES_ID),
            json!(turnaround),
            json!(symbol_session),
            json!(resolution),
            json!(bars_count),
        ],
    )
}

pub fn modify_series(
    chart_session: &str,
    turnaround: &str,
    symbol_session: &str,
    resolution: &str,
) -> Message {
    Message::new(
        "modify_series",
        vec![
            json!(chart_session),
            json!(SERIES_ID),
            json!(turnaround),
            json!(symbol_session),
            json!(resolution),
            json!(""),
        ],
    )
}

pub fn create_study(chart_session: &str, study_id: &str, config: &StudyConfig) -> Message {
    Message::new(
        "create_study",
        vec![
            json!(chart_session),
            json!(study_id),
            json!("st1"),
            json!(SERIES_ID),
            json!(SCRIPT_ENDPOINT),
            study_inputs(config),
        ],
    )
}

pub fn remove_study(chart_session: &str, study_id: &str) -> Message {
    Message::new("remove_study", vec![json!(chart_session), json!(study_id)])
}

/// The opaque script blob plus any user inputs, as `create_study` expects.
fn study_inputs(config: &StudyConfig) -> Value {
    let mut inputs = serde_json::Map::new();
    inputs.insert("text".into(), json!(config.text));
    inputs.insert("pineId".into(), json!(config.pine_id));
    inputs.insert("pineVersion".into(), json!(config.pine_version));
    if !config.pine_features.is_null() {
        inputs.insert(
            "pineFeatures".into(),
            json!({ "v": config.pine_features.to_string(), "f": true, "t": "text" }),
        );
    }
    for (key, value) in &config.inputs {
        inputs.insert(key.clone(), value.clone());
    }
    Value::Object(inputs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_symbol_descriptor() {
        let msg = resolve_symbol("cs_a", "sds_sym_2", "X:AAA");
        assert_eq!(msg.method, "resolve_symbol");
        assert_eq!(msg.param_str(1), Some("sds_sym_2"));

        let descriptor = msg.param_str(2).unwrap();
        assert!(descriptor.starts_with('='));
        let parsed: Value = serde_json::from_str(&descriptor[1..]).unwrap();
        assert_eq!(parsed["symbol"], "X:AAA");
    }

    #[test]
    fn test_series_commands() {
        let create = create_series("cs_a", "s1", "sds_sym_1", "1D", 50);
        assert_eq!(create.params[1], SERIES_ID);
        assert_eq!(create.params[5], 50);

        let modify = modify_series("cs_a", "s4", "sds_sym_4", "60");
        assert_eq!(modify.method, "modify_series");
        assert_eq!(modify.param_str(2), Some("s4"));
        assert_eq!(modify.param_str(3), Some("sds_sym_4"));
        assert_eq!(modify.param_str(4), Some("60"));
    }

    #[test]
    fn test_create_study_carries_blob() {
        let mut config = StudyConfig::new("Volume Delta", "PUB;abc", "1.0", "encrypted");
        config.inputs.insert("in_0".into(), json!(14));

        let msg = create_study("cs_a", "st_1_0", &config);
        assert_eq!(msg.param_str(4), Some(SCRIPT_ENDPOINT));
        let blob = &msg.params[5];
        assert_eq!(blob["pineId"], "PUB;abc");
        assert_eq!(blob["text"], "encrypted");
        assert_eq!(blob["in_0"], 14);
        assert!(blob.get("pineFeatures").is_none());
    }
}
