//! Read/write routing and query execution
//!
//! The router resolves each operation to the right connection (a replica
//! for reads, the primary for writes and transactions), bounds it by the
//! operation's timeout, and feeds the outcome to the metrics collector.

use sqlx::postgres::PgPool;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

use crate::metrics::QueryMetrics;
use crate::pool::{PoolError, PoolManager, Workload};
use crate::replica::ReplicaManager;

/// Error types for routed query execution
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    /// The caller-supplied query failed; the driver error is unchanged
    #[error(transparent)]
    Query(#[from] sqlx::Error),

    #[error("query '{label}' timed out after {timeout:?}")]
    Timeout { label: String, timeout: Duration },

    #[error(transparent)]
    Pool(#[from] PoolError),
}

/// Kind of database operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Read,
    Write,
    Transactional,
}

impl OperationKind {
    pub fn name(self) -> &'static str {
        match self {
            OperationKind::Read => "read",
            OperationKind::Write => "write",
            OperationKind::Transactional => "transactional",
        }
    }
}

/// Informational criticality tag carried by an operation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Criticality {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

/// Caller-constructed descriptor for one database operation
#[derive(Debug, Clone)]
pub struct OperationContext {
    /// Operation kind, drives routing
    pub kind: OperationKind,

    /// Human-readable label for logging and metrics; never interpreted
    pub label: String,

    /// Optional execution deadline
    pub timeout: Option<Duration>,

    /// Whether the caller considers this operation safe to retry
    pub retryable: bool,

    /// Informational criticality tag
    pub criticality: Criticality,
}

impl OperationContext {
    fn new(kind: OperationKind, label: impl Into<String>) -> Self {
        Self {
            kind,
            label: label.into(),
            timeout: None,
            retryable: false,
            criticality: Criticality::default(),
        }
    }

    pub fn read(label: impl Into<String>) -> Self {
        Self::new(OperationKind::Read, label)
    }

    pub fn write(label: impl Into<String>) -> Self {
        Self::new(OperationKind::Write, label)
    }

    pub fn transactional(label: impl Into<String>) -> Self {
        Self::new(OperationKind::Transactional, label)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn retryable(mut self) -> Self {
        self.retryable = true;
        self
    }

    pub fn with_criticality(mut self, criticality: Criticality) -> Self {
        self.criticality = criticality;
        self
    }
}

/// Routes operations to the primary or a read replica
#[derive(Clone)]
pub struct Router {
    pools: Arc<PoolManager>,
    replicas: Arc<ReplicaManager>,
    metrics: Arc<QueryMetrics>,
}

impl Router {
    pub fn new(
        pools: Arc<PoolManager>,
        replicas: Arc<ReplicaManager>,
        metrics: Arc<QueryMetrics>,
    ) -> Self {
        Self {
            pools,
            replicas,
            metrics,
        }
    }

    /// Resolve the connection for an operation
    ///
    /// Reads go to a replica when one is selectable and otherwise fall
    /// back to the primary; writes and transactions always use the
    /// primary.
    pub async fn db_for(&self, op: &OperationContext) -> Result<PgPool, QueryError> {
        match op.kind {
            OperationKind::Read => match self.replicas.select().await {
                Ok(pool) => Ok(pool),
                Err(e) => {
                    warn!(
                        label = %op.label,
                        reason = %e,
                        "No replica available, falling back to primary for read"
                    );
                    Ok(self.pools.get(Workload::Interactive).await?)
                }
            },
            OperationKind::Write | OperationKind::Transactional => {
                Ok(self.pools.get(Workload::Interactive).await?)
            }
        }
    }

    /// Execute a query with the appropriate connection
    ///
    /// Applies the operation's timeout if set, records the outcome in the
    /// metrics collector, logs slow queries, and returns the query's
    /// error unchanged.
    pub async fn execute<T, F, Fut>(&self, op: &OperationContext, query_fn: F) -> Result<T, QueryError>
    where
        F: FnOnce(PgPool) -> Fut,
        Fut: Future<Output = Result<T, sqlx::Error>>,
    {
        let started = Instant::now();
        let pool = self.db_for(op).await?;

        let result = match op.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, query_fn(pool)).await {
                Ok(outcome) => outcome.map_err(QueryError::Query),
                Err(_) => Err(QueryError::Timeout {
                    label: op.label.clone(),
                    timeout,
                }),
            },
            None => query_fn(pool).await.map_err(QueryError::Query),
        };

        let elapsed = started.elapsed();
        self.metrics.record_query(op.kind, elapsed, result.is_err());

        if self.metrics.should_log_slow(elapsed) {
            warn!(
                label = %op.label,
                kind = op.kind.name(),
                criticality = ?op.criticality,
                elapsed_ms = elapsed.as_millis() as u64,
                "Slow query"
            );
        }

        result
    }
}
