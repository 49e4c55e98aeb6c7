//! Lookup of study definitions for named indicators.
//!
//! Fetching the encrypted script text for an indicator needs the user's
//! session credentials and happens outside this crate. The pool only sees
//! the [`IndicatorConfigSource`] trait.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::{ChartError, Result};
use crate::model::{Credentials, StudyConfig};

#[async_trait]
pub trait IndicatorConfigSource: Send + Sync {
    /// Resolve `indicator` into the blob passed to `create_study`.
    async fn fetch(&self, indicator: &str, credentials: &Credentials) -> Result<StudyConfig>;
}

/// Fixed table of study definitions. Credentials are required but not checked.
#[derive(Debug, Clone, Default)]
pub struct StaticIndicatorSource {
    configs: HashMap<String, StudyConfig>,
}

impl StaticIndicatorSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, indicator: impl Into<String>, config: StudyConfig) -> Self {
        self.configs.insert(indicator.into(), config);
        self
    }
}

#[async_trait]
impl IndicatorConfigSource for StaticIndicatorSource {
    async fn fetch(&self, indicator: &str, _credentials: &Credentials) -> Result<StudyConfig> {
        self.configs
            .get(indicator)
            .cloned()
            .ok_or_else(|| ChartError::Indicator(format!("unknown indicator {}", indicator)))
    }
}
