mod config;
mod manager;
mod pending;

pub use config::{PoolConfig, PoolConfigBuilder};
pub use manager::{BatchResult, ConnectionPool, PoolStats};
