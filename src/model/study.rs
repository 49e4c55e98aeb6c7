//! Indicator ("study") types.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Opaque study definition supplied by an [`IndicatorConfigSource`].
///
/// [`IndicatorConfigSource`]: crate::indicators::IndicatorConfigSource
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct StudyConfig {
    pub name: String,
    pub pine_id: String,
    pub pine_version: String,
    /// Encrypted script text, passed through untouched.
    pub text: String,
    #[serde(default)]
    pub pine_features: Value,
    #[serde(default)]
    pub inputs: Map<String, Value>,
}

impl StudyConfig {
    pub fn new(
        name: impl Into<String>,
        pine_id: impl Into<String>,
        pine_version: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            pine_id: pine_id.into(),
            pine_version: pine_version.into(),
            text: text.into(),
            pine_features: Value::Null,
            inputs: Map::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct IndicatorPoint {
    pub time: i64,
    pub values: Vec<f64>,
}

/// Values collected for one study during one request.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct IndicatorSeries {
    pub id: String,
    pub name: String,
    pub config: StudyConfig,
    pub values: Vec<IndicatorPoint>,
}

impl IndicatorSeries {
    pub fn new(id: String, config: StudyConfig) -> Self {
        Self {
            id,
            name: config.name.clone(),
            config,
            values: Vec::new(),
        }
    }

    /// True when the data block `key` belongs to this study.
    pub fn matches_key(&self, key: &str) -> bool {
        !key.is_empty() && (key.contains(&self.id) || self.id.contains(key))
    }

    /// Append a `[time, v1, v2, ...]` tuple. Non-numeric entries become NaN.
    pub fn push_tuple(&mut self, tuple: &[Value]) -> bool {
        let Some(time) = tuple.first().and_then(Value::as_f64) else {
            return false;
        };
        let values = tuple[1..]
            .iter()
            .map(|v| v.as_f64().unwrap_or(f64::NAN))
            .collect();
        self.values.push(IndicatorPoint {
            time: time as i64,
            values,
        });
        true
    }
}
