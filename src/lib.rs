mod error;
pub mod indicators;
pub mod lifecycle;
pub mod model;
pub mod network;
pub mod pool;
pub mod session;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{ChartError, Result};
pub use indicators::{IndicatorConfigSource, StaticIndicatorSource};
pub use lifecycle::{LifecycleConfig, LifecycleManager, LifecycleState};
pub use model::{ChartData, ChartRequest, Credentials, IndicatorSeries, OhlcvBar, StudyConfig, SymbolMetadata};
pub use pool::{BatchResult, ConnectionPool, PoolConfig, PoolStats};
pub use session::{ChartSession, SessionConfig};
