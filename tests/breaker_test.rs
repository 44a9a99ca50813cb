//! Integration tests for circuit breaking under concurrency and through
//! the service facade

use async_trait::async_trait;
use pgsplit::config::{BreakerSettings, Config, ConnectionSettings, WorkloadPoolSettings};
use pgsplit::core::Core;
use pgsplit::pool::{
    BreakerConfig, BreakerError, CircuitBreaker, CircuitState, Connector, PoolSizing,
};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

struct LazyConnector;

#[async_trait]
impl Connector for LazyConnector {
    async fn connect(
        &self,
        settings: &ConnectionSettings,
        _sizing: &PoolSizing,
    ) -> Result<PgPool, sqlx::Error> {
        Ok(PgPoolOptions::new().connect_lazy_with(
            PgConnectOptions::new()
                .host(&settings.host)
                .port(settings.port)
                .database(&settings.dbname),
        ))
    }

    async fn ping(&self, _pool: &PgPool) -> Result<(), sqlx::Error> {
        Ok(())
    }
}

fn test_config() -> Config {
    Config {
        primary: ConnectionSettings {
            host: "primary-db".to_string(),
            port: 5432,
            user: "app".to_string(),
            password: String::new(),
            dbname: "app_db".to_string(),
            ssl_mode: "prefer".to_string(),
        },
        replicas: HashMap::new(),
        pools: WorkloadPoolSettings::default(),
        breaker: BreakerSettings {
            max_failures: 2,
            recovery_timeout_secs: 60,
            ..Default::default()
        },
        replica_manager: Default::default(),
    }
}

fn service_failure() -> Result<(), std::io::Error> {
    Err(std::io::Error::new(
        std::io::ErrorKind::ConnectionRefused,
        "connection refused",
    ))
}

#[tokio::test]
async fn in_flight_probes_count_against_half_open_capacity() {
    let breaker = Arc::new(CircuitBreaker::new(
        "replica-east",
        BreakerConfig {
            max_failures: 1,
            recovery_timeout: Duration::from_millis(50),
            required_successes: 3,
            max_half_open_probes: 2,
        },
    ));

    let _ = breaker.execute(|| async { service_failure() }).await;
    assert_eq!(breaker.state().await, CircuitState::Open);
    tokio::time::sleep(Duration::from_millis(80)).await;

    // Two probes are admitted and parked mid-flight on the gate
    let gate = Arc::new(Notify::new());
    let mut probes = Vec::new();
    for _ in 0..2 {
        let breaker = breaker.clone();
        let gate = gate.clone();
        probes.push(tokio::spawn(async move {
            breaker
                .execute(move || async move {
                    gate.notified().await;
                    Ok::<(), std::io::Error>(())
                })
                .await
        }));
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(breaker.state().await, CircuitState::HalfOpen);

    // Capacity is taken at admission, so a third call is rejected while
    // the first two are still running
    let result = breaker
        .execute(|| async { Ok::<(), std::io::Error>(()) })
        .await;
    assert!(matches!(result, Err(BreakerError::HalfOpenLimitReached(_))));

    gate.notify_waiters();
    for probe in probes {
        assert!(probe.await.unwrap().is_ok());
    }

    // Two successes out of the required three: still probing
    assert_eq!(breaker.state().await, CircuitState::HalfOpen);
}

#[tokio::test]
async fn concurrent_failures_open_the_circuit_once() {
    let breaker = Arc::new(CircuitBreaker::new(
        "primary-write",
        BreakerConfig {
            max_failures: 5,
            ..Default::default()
        },
    ));

    let mut handles = Vec::new();
    for _ in 0..20 {
        let breaker = breaker.clone();
        handles.push(tokio::spawn(async move {
            breaker.execute(|| async { service_failure() }).await
        }));
    }

    let mut service_errors = 0;
    let mut rejections = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Err(BreakerError::Service(_)) => service_errors += 1,
            Err(e) if e.is_rejection() => rejections += 1,
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    assert_eq!(breaker.state().await, CircuitState::Open);
    assert_eq!(service_errors + rejections, 20);
    // At least the threshold's worth of calls reached the service
    assert!(service_errors >= 5);

    let metrics = breaker.metrics().await;
    assert_eq!(metrics.total_requests, 20);
    assert_eq!(metrics.total_errors, 20);
    assert!(metrics.open_age.is_some());
}

#[tokio::test]
async fn facade_gates_operations_per_resource() {
    let core = Core::with_connector(test_config(), Arc::new(LazyConnector))
        .await
        .unwrap();

    // Two failures against "orders" open its breaker
    for _ in 0..2 {
        let result = core
            .execute_protected("orders", || async { service_failure() })
            .await;
        assert!(matches!(result, Err(BreakerError::Service(_))));
    }

    let result = core
        .execute_protected("orders", || async { Ok::<(), std::io::Error>(()) })
        .await;
    assert!(matches!(result, Err(BreakerError::CircuitOpen(_))));

    // A different resource is unaffected
    let result = core
        .execute_protected("billing", || async { Ok::<(), std::io::Error>(()) })
        .await;
    assert!(result.is_ok());

    let metrics = core.breaker_metrics().await;
    assert_eq!(metrics.len(), 2);
    assert_eq!(metrics["orders"].state, CircuitState::Open);
    assert_eq!(metrics["billing"].state, CircuitState::Closed);

    // Operator reset re-admits traffic
    core.reset_all().await;
    let result = core
        .execute_protected("orders", || async { Ok::<(), std::io::Error>(()) })
        .await;
    assert!(result.is_ok());

    core.close().await.unwrap();
}
