//! Shared service facade
//!
//! Wires configuration into the pool manager, replica manager, breaker
//! registry and router, and exposes the administrative surface. Clones
//! share the same underlying managers.

use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::metrics::{MetricsConfig, MetricsSnapshot, QueryMetrics, QueryStats};
use crate::pool::{
    BreakerConfig, BreakerError, BreakerMetrics, BreakerRegistry, Connector, PgConnector,
    PoolManager, PoolStats, Workload,
};
use crate::replica::{ReplicaInfo, ReplicaManager};
use crate::router::Router;

#[derive(Clone)]
pub struct Core {
    pub config: Arc<Config>,
    pub pools: Arc<PoolManager>,
    pub replicas: Arc<ReplicaManager>,
    pub breakers: Arc<BreakerRegistry>,
    pub metrics: Arc<QueryMetrics>,
    pub router: Router,
}

impl Core {
    /// Build the service from configuration using the sqlx connector
    pub async fn new(config: Config) -> Result<Self> {
        Self::with_connector(config, Arc::new(PgConnector::new())).await
    }

    /// Build the service with a custom connector
    pub async fn with_connector(config: Config, connector: Arc<dyn Connector>) -> Result<Self> {
        let config = Arc::new(config);

        let pools = Arc::new(PoolManager::new(
            config.primary.clone(),
            config.pools.clone(),
            connector.clone(),
        ));

        let replicas = Arc::new(ReplicaManager::new(
            config.replica_manager.clone(),
            connector.clone(),
        ));
        for (id, settings) in &config.replicas {
            replicas.add_replica(id, settings.clone()).await?;
        }
        replicas.start_health_checks();

        let metrics = Arc::new(QueryMetrics::new(MetricsConfig {
            slow_query_threshold: config.replica_manager.slow_query_threshold(),
            enable_slow_query_log: config.replica_manager.enable_slow_query_log,
        }));

        let breakers = Arc::new(BreakerRegistry::new());

        let router = Router::new(pools.clone(), replicas.clone(), metrics.clone());

        Ok(Self {
            config,
            pools,
            replicas,
            breakers,
            metrics,
            router,
        })
    }

    fn breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            max_failures: self.config.breaker.max_failures,
            recovery_timeout: Duration::from_secs(self.config.breaker.recovery_timeout_secs),
            required_successes: self.config.breaker.required_successes,
            max_half_open_probes: self.config.breaker.max_half_open_probes,
        }
    }

    /// Run an operation gated by the named resource's circuit breaker
    pub async fn execute_protected<T, E, F, Fut>(
        &self,
        resource: &str,
        operation: F,
    ) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        let breaker = self.breakers.get(resource, self.breaker_config()).await;
        breaker.execute(operation).await
    }

    /// Derived query statistics
    pub fn query_stats(&self) -> QueryStats {
        self.metrics.query_stats()
    }

    /// Full metrics counter snapshot
    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Per-workload pool counters
    pub async fn pool_stats(&self) -> HashMap<Workload, PoolStats> {
        self.pools.stats().await
    }

    /// Metrics for every registered circuit breaker
    pub async fn breaker_metrics(&self) -> HashMap<String, BreakerMetrics> {
        self.breakers.all_metrics().await
    }

    /// Status snapshot of every registered replica
    pub async fn replica_status(&self) -> Vec<ReplicaInfo> {
        self.replicas.all_replicas().await
    }

    /// Reset all breakers and query metrics
    pub async fn reset_all(&self) {
        self.breakers.reset_all().await;
        self.metrics.reset();
    }

    /// Probe every cached primary pool under the given timeout
    pub async fn health(&self, timeout: Duration) -> Result<()> {
        self.pools.health(timeout).await?;
        Ok(())
    }

    /// Shut down: stop health checking, then close replica and primary
    /// pools, attempting every resource even if some fail
    pub async fn close(&self) -> Result<()> {
        let mut errors = Vec::new();

        if let Err(e) = self.replicas.close().await {
            errors.push(e.to_string());
        }
        if let Err(e) = self.pools.close().await {
            errors.push(e.to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            anyhow::bail!("errors during shutdown: {}", errors.join("; "))
        }
    }
}
