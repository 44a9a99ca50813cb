//! Workload-segregated connection pools
//!
//! Request traffic, long-lived streaming traffic and background jobs get
//! independently sized pools so that a burst in one class cannot starve the
//! others. Pools are created lazily on first request and cached for the
//! process lifetime.

use sqlx::postgres::PgPool;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::config::{ConnectionSettings, WorkloadPoolSettings};
use crate::pool::connect::{Connector, PoolSizing};

/// Error types for pool manager operations
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("failed to create connection pool for {target}: {source}")]
    Connect {
        target: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("pool {workload} health check failed: {reason}")]
    Unhealthy { workload: Workload, reason: String },

    #[error("errors closing connection pools: {}", .0.join("; "))]
    Close(Vec<String>),
}

/// Category of database traffic with its own pool sizing policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Workload {
    /// Interactive request traffic
    Interactive,

    /// Long-lived streaming traffic
    Streaming,

    /// Background and batch jobs
    Background,
}

impl Workload {
    /// Default sizing policy for this workload class
    pub fn sizing(self) -> PoolSizing {
        match self {
            // Interactive operations need the most headroom
            Workload::Interactive => PoolSizing {
                max_open: 150,
                max_idle: 30,
                max_lifetime: Duration::from_secs(30 * 60),
                max_idle_time: Duration::from_secs(5 * 60),
            },
            Workload::Streaming => PoolSizing {
                max_open: 30,
                max_idle: 10,
                max_lifetime: Duration::from_secs(15 * 60),
                max_idle_time: Duration::from_secs(3 * 60),
            },
            Workload::Background => PoolSizing {
                max_open: 20,
                max_idle: 5,
                max_lifetime: Duration::from_secs(45 * 60),
                max_idle_time: Duration::from_secs(10 * 60),
            },
        }
    }
}

impl std::fmt::Display for Workload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Workload::Interactive => "interactive",
            Workload::Streaming => "streaming",
            Workload::Background => "background",
        };
        f.write_str(name)
    }
}

/// Point-in-time counters for one pool
#[derive(Debug, Clone)]
pub struct PoolStats {
    /// Connections currently open
    pub open_connections: u32,

    /// Connections currently idle
    pub idle_connections: usize,

    /// Configured maximum open connections
    pub max_open: u32,
}

/// Manages one lazily created connection pool per workload class
pub struct PoolManager {
    /// Cached pools keyed by workload class
    pools: RwLock<HashMap<Workload, PgPool>>,

    /// Primary connection parameters
    settings: ConnectionSettings,

    /// Configured sizing overrides
    overrides: WorkloadPoolSettings,

    /// Connection constructor
    connector: Arc<dyn Connector>,
}

impl PoolManager {
    pub fn new(
        settings: ConnectionSettings,
        overrides: WorkloadPoolSettings,
        connector: Arc<dyn Connector>,
    ) -> Self {
        Self {
            pools: RwLock::new(HashMap::new()),
            settings,
            overrides,
            connector,
        }
    }

    fn sizing_for(&self, workload: Workload) -> PoolSizing {
        let overrides = match workload {
            Workload::Interactive => &self.overrides.interactive,
            Workload::Streaming => &self.overrides.streaming,
            Workload::Background => &self.overrides.background,
        };

        match overrides {
            Some(settings) => workload.sizing().with_overrides(settings),
            None => workload.sizing(),
        }
    }

    /// Get the pool for a workload class, creating it on first request
    ///
    /// Concurrent first access yields exactly one pool: the cache is
    /// re-checked under the write lock before construction. A failed
    /// connect caches nothing, so the next call retries.
    pub async fn get(&self, workload: Workload) -> Result<PgPool, PoolError> {
        {
            let pools = self.pools.read().await;
            if let Some(pool) = pools.get(&workload) {
                return Ok(pool.clone());
            }
        }

        let mut pools = self.pools.write().await;

        // Double-check after acquiring write lock
        if let Some(pool) = pools.get(&workload) {
            return Ok(pool.clone());
        }

        let sizing = self.sizing_for(workload);
        let pool = self
            .connector
            .connect(&self.settings, &sizing)
            .await
            .map_err(|source| PoolError::Connect {
                target: self.settings.target(),
                source,
            })?;

        pools.insert(workload, pool.clone());
        info!(
            workload = %workload,
            max_open = sizing.max_open,
            max_idle = sizing.max_idle,
            "Created connection pool"
        );

        Ok(pool)
    }

    /// Close all cached pools, collecting per-pool errors rather than
    /// stopping at the first failure
    pub async fn close(&self) -> Result<(), PoolError> {
        let mut pools = self.pools.write().await;

        let mut errors = Vec::new();
        for (workload, pool) in pools.drain() {
            match self.connector.close(&pool).await {
                Ok(()) => info!(workload = %workload, "Closed connection pool"),
                Err(e) => errors.push(format!("{}: {}", workload, e)),
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(PoolError::Close(errors))
        }
    }

    /// Run a bounded round-trip probe against every cached pool, failing
    /// on the first unreachable one
    pub async fn health(&self, timeout: Duration) -> Result<(), PoolError> {
        let pools = self.pools.read().await;

        for (workload, pool) in pools.iter() {
            debug!(workload = %workload, "Pinging pool");
            match tokio::time::timeout(timeout, self.connector.ping(pool)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    return Err(PoolError::Unhealthy {
                        workload: *workload,
                        reason: e.to_string(),
                    })
                }
                Err(_) => {
                    return Err(PoolError::Unhealthy {
                        workload: *workload,
                        reason: format!("health check timed out after {:?}", timeout),
                    })
                }
            }
        }

        Ok(())
    }

    /// Snapshot counters for every cached pool
    pub async fn stats(&self) -> HashMap<Workload, PoolStats> {
        let pools = self.pools.read().await;

        pools
            .iter()
            .map(|(workload, pool)| {
                (
                    *workload,
                    PoolStats {
                        open_connections: pool.size(),
                        idle_connections: pool.num_idle(),
                        max_open: pool.options().get_max_connections(),
                    },
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workload_sizing_defaults() {
        let interactive = Workload::Interactive.sizing();
        assert_eq!(interactive.max_open, 150);
        assert_eq!(interactive.max_idle, 30);
        assert_eq!(interactive.max_lifetime, Duration::from_secs(1800));

        let streaming = Workload::Streaming.sizing();
        assert_eq!(streaming.max_open, 30);
        assert_eq!(streaming.max_idle_time, Duration::from_secs(180));

        let background = Workload::Background.sizing();
        assert_eq!(background.max_open, 20);
        assert_eq!(background.max_idle, 5);
    }

    #[test]
    fn test_workload_display() {
        assert_eq!(Workload::Interactive.to_string(), "interactive");
        assert_eq!(Workload::Streaming.to_string(), "streaming");
        assert_eq!(Workload::Background.to_string(), "background");
    }
}
