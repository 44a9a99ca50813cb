pub mod circuit;
pub mod connect;
pub mod manager;

pub use circuit::{
    BreakerConfig, BreakerError, BreakerMetrics, BreakerRegistry, CircuitBreaker, CircuitState,
};
pub use connect::{Connector, PgConnector, PoolSizing};
pub use manager::{PoolError, PoolManager, PoolStats, Workload};
