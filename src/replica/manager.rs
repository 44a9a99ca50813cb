//! Read replica roster with health checking and weighted selection
//!
//! Replicas are registered explicitly, probed by a periodic background
//! task, and selected for reads using weighted random selection over the
//! priority-ordered healthy set.

use rand::Rng;
use sqlx::postgres::PgPool;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{ReplicaManagerSettings, ReplicaSettings};
use crate::pool::connect::{Connector, PoolSizing};

/// Error types for replica manager operations
#[derive(Debug, thiserror::Error)]
pub enum ReplicaError {
    #[error("replica with id '{0}' already exists")]
    DuplicateId(String),

    #[error("failed to connect to replica '{id}': {source}")]
    Connect {
        id: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("no read replicas registered")]
    NoReplicas,

    #[error("no healthy read replicas available")]
    NoHealthyReplicas,

    #[error("errors closing read replicas: {}", .0.join("; "))]
    Close(Vec<String>),
}

/// Health status of a replica
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaStatus {
    Healthy,

    /// Excluded from selection until a probe succeeds
    Unhealthy,

    /// Recently recovered from Unhealthy; selectable, but the recorded
    /// error is kept until a further successful probe
    Degraded,
}

impl ReplicaStatus {
    /// Whether a replica in this status may serve reads
    pub fn is_selectable(self) -> bool {
        !matches!(self, ReplicaStatus::Unhealthy)
    }
}

/// One registered read replica
pub struct Replica {
    pub id: String,
    pub pool: PgPool,
    pub weight: u32,
    pub priority: i32,
    pub status: ReplicaStatus,
    pub last_check: Instant,
    pub last_error: Option<String>,
}

/// Status snapshot of one replica, detached from its pool
#[derive(Debug, Clone)]
pub struct ReplicaInfo {
    pub id: String,
    pub weight: u32,
    pub priority: i32,
    pub status: ReplicaStatus,
    pub last_check_age: Duration,
    pub last_error: Option<String>,
}

/// Manages read replicas with health checking and load balancing
pub struct ReplicaManager {
    replicas: RwLock<Vec<Replica>>,
    settings: ReplicaManagerSettings,
    connector: Arc<dyn Connector>,

    /// Handle of the background health loop, aborted on close
    health_task: Mutex<Option<JoinHandle<()>>>,
}

impl ReplicaManager {
    pub fn new(settings: ReplicaManagerSettings, connector: Arc<dyn Connector>) -> Self {
        Self {
            replicas: RwLock::new(Vec::new()),
            settings,
            connector,
            health_task: Mutex::new(None),
        }
    }

    /// Register a new read replica, establishing its pool immediately
    ///
    /// Fails with `DuplicateId` if the id is taken and with `Connect` if
    /// the replica is unreachable; in both cases nothing is registered.
    pub async fn add_replica(&self, id: &str, settings: ReplicaSettings) -> Result<(), ReplicaError> {
        {
            let replicas = self.replicas.read().await;
            if replicas.iter().any(|r| r.id == id) {
                return Err(ReplicaError::DuplicateId(id.to_string()));
            }
        }

        let sizing = PoolSizing::replica_default().with_overrides(&settings.pool);
        let pool = self
            .connector
            .connect(&settings.connection, &sizing)
            .await
            .map_err(|source| ReplicaError::Connect {
                id: id.to_string(),
                source,
            })?;

        let mut replicas = self.replicas.write().await;

        // Re-check under the write lock: a concurrent registration may
        // have claimed the id while we were connecting
        if replicas.iter().any(|r| r.id == id) {
            let _ = self.connector.close(&pool).await;
            return Err(ReplicaError::DuplicateId(id.to_string()));
        }

        info!(
            replica_id = %id,
            target = %settings.connection.target(),
            weight = settings.weight,
            priority = settings.priority,
            "Added read replica"
        );

        replicas.push(Replica {
            id: id.to_string(),
            pool,
            weight: settings.weight,
            priority: settings.priority,
            status: ReplicaStatus::Healthy,
            last_check: Instant::now(),
            last_error: None,
        });

        Ok(())
    }

    /// Select a replica for a read using weighted random selection over
    /// the priority-ordered selectable set
    ///
    /// Priority orders the candidates but does not partition them: lower
    /// priority replicas still receive weighted chances unless excluded
    /// by health.
    pub async fn select(&self) -> Result<PgPool, ReplicaError> {
        let replicas = self.replicas.read().await;

        if replicas.is_empty() {
            return Err(ReplicaError::NoReplicas);
        }

        let mut candidates: Vec<&Replica> = replicas
            .iter()
            .filter(|r| r.status.is_selectable())
            .collect();

        if candidates.is_empty() {
            return Err(ReplicaError::NoHealthyReplicas);
        }

        // Stable sort: equal priorities keep registration order
        candidates.sort_by_key(|r| r.priority);

        Ok(Self::pick_weighted(&candidates).pool.clone())
    }

    /// Weighted random draw; a weight of zero counts as one
    fn pick_weighted<'a>(candidates: &[&'a Replica]) -> &'a Replica {
        let total: u64 = candidates.iter().map(|r| u64::from(r.weight.max(1))).sum();

        let mut draw = rand::thread_rng().gen_range(0..total);
        for replica in candidates {
            let weight = u64::from(replica.weight.max(1));
            if draw < weight {
                return replica;
            }
            draw -= weight;
        }

        // Unreachable: the draw is bounded by the summed weights
        candidates[candidates.len() - 1]
    }

    /// Number of replicas currently marked Healthy
    pub async fn healthy_count(&self) -> usize {
        let replicas = self.replicas.read().await;
        replicas
            .iter()
            .filter(|r| r.status == ReplicaStatus::Healthy)
            .count()
    }

    /// Status snapshot of every registered replica
    pub async fn all_replicas(&self) -> Vec<ReplicaInfo> {
        let replicas = self.replicas.read().await;
        replicas
            .iter()
            .map(|r| ReplicaInfo {
                id: r.id.clone(),
                weight: r.weight,
                priority: r.priority,
                status: r.status,
                last_check_age: r.last_check.elapsed(),
                last_error: r.last_error.clone(),
            })
            .collect()
    }

    /// Start the periodic background health check task
    ///
    /// The task runs until `close` aborts it.
    pub fn start_health_checks(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        let interval = self.settings.health_check_interval();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately; the roster was probed
            // at registration, so skip it
            ticker.tick().await;

            loop {
                ticker.tick().await;
                manager.check_now().await;
            }
        });

        if let Ok(mut slot) = self.health_task.lock() {
            if let Some(previous) = slot.replace(handle) {
                previous.abort();
            }
        }

        info!(
            interval_secs = self.settings.health_check_interval_secs,
            "Started replica health checking"
        );
    }

    /// Run one health check pass over every registered replica
    pub async fn check_now(&self) {
        let timeout = self.settings.health_check_timeout();
        let mut replicas = self.replicas.write().await;

        for replica in replicas.iter_mut() {
            let outcome = tokio::time::timeout(timeout, self.connector.ping(&replica.pool)).await;
            replica.last_check = Instant::now();

            match outcome {
                Ok(Ok(())) => match replica.status {
                    ReplicaStatus::Unhealthy => {
                        // One-tick recovery grace: not immediately trusted
                        replica.status = ReplicaStatus::Degraded;
                        info!(replica_id = %replica.id, "Replica recovering from unhealthy state");
                    }
                    _ => {
                        replica.status = ReplicaStatus::Healthy;
                        replica.last_error = None;
                        debug!(replica_id = %replica.id, "Replica healthy");
                    }
                },
                Ok(Err(e)) => {
                    replica.status = ReplicaStatus::Unhealthy;
                    replica.last_error = Some(e.to_string());
                    warn!(replica_id = %replica.id, error = %e, "Replica unhealthy");
                }
                Err(_) => {
                    let reason = format!("health check timed out after {:?}", timeout);
                    replica.status = ReplicaStatus::Unhealthy;
                    replica.last_error = Some(reason.clone());
                    warn!(replica_id = %replica.id, reason = %reason, "Replica unhealthy");
                }
            }
        }
    }

    /// Stop health checking and close every replica pool, collecting
    /// per-replica errors rather than stopping at the first failure
    pub async fn close(&self) -> Result<(), ReplicaError> {
        let handle = self.health_task.lock().ok().and_then(|mut slot| slot.take());
        if let Some(handle) = handle {
            handle.abort();
            debug!("Stopped replica health checking");
        }

        let mut replicas = self.replicas.write().await;

        let mut errors = Vec::new();
        for replica in replicas.drain(..) {
            match self.connector.close(&replica.pool).await {
                Ok(()) => info!(replica_id = %replica.id, "Closed read replica"),
                Err(e) => errors.push(format!("{}: {}", replica.id, e)),
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ReplicaError::Close(errors))
        }
    }
}
