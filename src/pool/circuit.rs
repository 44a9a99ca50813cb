//! Circuit breaker implementation for fault tolerance
//!
//! Each protected resource gets an independent breaker with three states:
//! - Closed: normal operation, requests pass through and failures are counted
//! - Open: the resource has failed, requests are rejected without being attempted
//! - HalfOpen: testing recovery, a bounded number of probe requests allowed
//!
//! Breakers are created on demand through the registry and live for the
//! process lifetime.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Circuit breaker error types
///
/// `CircuitOpen` and `HalfOpenLimitReached` are rejections: the wrapped
/// operation was never invoked. `Service` carries the operation's own error
/// unchanged.
#[derive(Debug, thiserror::Error)]
pub enum BreakerError<E> {
    #[error("circuit breaker '{0}' is open")]
    CircuitOpen(String),

    #[error("circuit breaker '{0}' has reached its half-open probe limit")]
    HalfOpenLimitReached(String),

    #[error(transparent)]
    Service(E),
}

impl<E> BreakerError<E> {
    /// True when the breaker rejected the call without attempting it
    pub fn is_rejection(&self) -> bool {
        !matches!(self, BreakerError::Service(_))
    }
}

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn name(&self) -> &'static str {
        match self {
            CircuitState::Closed => "Closed",
            CircuitState::Open => "Open",
            CircuitState::HalfOpen => "HalfOpen",
        }
    }
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Cumulative failures before the circuit opens
    pub max_failures: u32,

    /// How long to wait after the last failure before admitting probes
    pub recovery_timeout: Duration,

    /// Consecutive successful probes required to close the circuit
    pub required_successes: u32,

    /// Maximum probes admitted while half-open
    pub max_half_open_probes: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            max_failures: 5,
            recovery_timeout: Duration::from_secs(30),
            required_successes: 3,
            max_half_open_probes: 5,
        }
    }
}

/// Snapshot of one breaker's state and counters
#[derive(Debug, Clone)]
pub struct BreakerMetrics {
    pub name: String,
    pub state: CircuitState,
    pub failures: u64,
    pub successes: u64,
    pub half_open_probes: u64,
    pub total_requests: u64,
    pub total_successes: u64,
    pub total_errors: u64,
    pub last_failure_age: Option<Duration>,
    pub open_age: Option<Duration>,
}

/// Mutable state machine guarded by one lock so transitions serialize
struct BreakerState {
    state: CircuitState,
    failures: u64,
    successes: u64,
    half_open_probes: u64,
    last_failure: Option<Instant>,
    opened_at: Option<Instant>,
}

enum Rejection {
    Open,
    HalfOpenFull,
}

/// Failure-isolation state machine for one named resource
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: RwLock<BreakerState>,

    // Lifetime counters, updated outside the state lock
    request_count: AtomicU64,
    success_count: AtomicU64,
    error_count: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: RwLock::new(BreakerState {
                state: CircuitState::Closed,
                failures: 0,
                successes: 0,
                half_open_probes: 0,
                last_failure: None,
                opened_at: None,
            }),
            request_count: AtomicU64::new(0),
            success_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
        }
    }

    /// Run the operation if the circuit allows it
    ///
    /// Rejected calls never invoke the operation; executed calls have their
    /// outcome recorded against the state machine and their error returned
    /// unchanged.
    pub async fn execute<T, E, F, Fut>(&self, operation: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        self.request_count.fetch_add(1, Ordering::Relaxed);

        if let Err(rejection) = self.admit().await {
            self.error_count.fetch_add(1, Ordering::Relaxed);
            return Err(match rejection {
                Rejection::Open => BreakerError::CircuitOpen(self.name.clone()),
                Rejection::HalfOpenFull => BreakerError::HalfOpenLimitReached(self.name.clone()),
            });
        }

        match operation().await {
            Ok(value) => {
                self.success_count.fetch_add(1, Ordering::Relaxed);
                self.on_success().await;
                Ok(value)
            }
            Err(e) => {
                self.error_count.fetch_add(1, Ordering::Relaxed);
                self.on_failure().await;
                Err(BreakerError::Service(e))
            }
        }
    }

    /// Decide whether a request may proceed, committing any due
    /// Open -> HalfOpen transition exactly once
    async fn admit(&self) -> Result<(), Rejection> {
        // Fast path for the common Closed state
        {
            let state = self.inner.read().await;
            if state.state == CircuitState::Closed {
                return Ok(());
            }
        }

        let mut state = self.inner.write().await;

        // Re-check under the exclusive lock: another caller may have
        // transitioned the breaker while we waited
        match state.state {
            CircuitState::Closed => Ok(()),

            CircuitState::Open => {
                let recovered = state
                    .last_failure
                    .map(|t| t.elapsed() >= self.config.recovery_timeout)
                    .unwrap_or(true);

                if recovered {
                    state.state = CircuitState::HalfOpen;
                    state.half_open_probes = 1;
                    state.successes = 0;
                    info!(breaker = %self.name, "Circuit transitioning from Open to HalfOpen");
                    Ok(())
                } else {
                    Err(Rejection::Open)
                }
            }

            CircuitState::HalfOpen => {
                if state.half_open_probes < u64::from(self.config.max_half_open_probes) {
                    state.half_open_probes += 1;
                    Ok(())
                } else {
                    Err(Rejection::HalfOpenFull)
                }
            }
        }
    }

    async fn on_success(&self) {
        let mut state = self.inner.write().await;
        state.successes += 1;

        if state.state == CircuitState::HalfOpen
            && state.successes >= u64::from(self.config.required_successes)
        {
            state.state = CircuitState::Closed;
            state.failures = 0;
            state.successes = 0;
            state.half_open_probes = 0;
            state.opened_at = None;
            info!(
                breaker = %self.name,
                required = self.config.required_successes,
                "Circuit closed after successful probes"
            );
        }
    }

    async fn on_failure(&self) {
        let mut state = self.inner.write().await;
        state.failures += 1;
        state.last_failure = Some(Instant::now());

        match state.state {
            CircuitState::Closed => {
                if state.failures >= u64::from(self.config.max_failures) {
                    state.state = CircuitState::Open;
                    state.opened_at = Some(Instant::now());
                    warn!(
                        breaker = %self.name,
                        failures = state.failures,
                        "Circuit opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                state.state = CircuitState::Open;
                state.opened_at = Some(Instant::now());
                warn!(breaker = %self.name, "Circuit re-opened during half-open probing");
            }
            CircuitState::Open => {}
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current breaker state
    pub async fn state(&self) -> CircuitState {
        self.inner.read().await.state
    }

    /// Snapshot state and counters
    pub async fn metrics(&self) -> BreakerMetrics {
        let state = self.inner.read().await;
        BreakerMetrics {
            name: self.name.clone(),
            state: state.state,
            failures: state.failures,
            successes: state.successes,
            half_open_probes: state.half_open_probes,
            total_requests: self.request_count.load(Ordering::Relaxed),
            total_successes: self.success_count.load(Ordering::Relaxed),
            total_errors: self.error_count.load(Ordering::Relaxed),
            last_failure_age: state.last_failure.map(|t| t.elapsed()),
            open_age: state.opened_at.map(|t| t.elapsed()),
        }
    }

    /// Unconditionally return the breaker to Closed with all counters
    /// zeroed, bypassing normal transition rules
    ///
    /// Intended for operator intervention, not automatic recovery.
    pub async fn reset(&self) {
        let mut state = self.inner.write().await;
        state.state = CircuitState::Closed;
        state.failures = 0;
        state.successes = 0;
        state.half_open_probes = 0;
        state.last_failure = None;
        state.opened_at = None;
        info!(breaker = %self.name, "Circuit manually reset to Closed");
    }
}

/// Creates and caches circuit breakers by resource name
pub struct BreakerRegistry {
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new() -> Self {
        Self {
            breakers: RwLock::new(HashMap::new()),
        }
    }

    /// Get the breaker for a resource, creating one with the given
    /// configuration on first request
    pub async fn get(&self, name: &str, config: BreakerConfig) -> Arc<CircuitBreaker> {
        {
            let breakers = self.breakers.read().await;
            if let Some(breaker) = breakers.get(name) {
                return breaker.clone();
            }
        }

        let mut breakers = self.breakers.write().await;

        // Double-check after acquiring write lock
        if let Some(breaker) = breakers.get(name) {
            return breaker.clone();
        }

        let breaker = Arc::new(CircuitBreaker::new(name, config));
        breakers.insert(name.to_string(), breaker.clone());
        info!(breaker = %name, "Created circuit breaker");

        breaker
    }

    /// Snapshot metrics for every registered breaker
    pub async fn all_metrics(&self) -> HashMap<String, BreakerMetrics> {
        let breakers = self.breakers.read().await;

        let mut metrics = HashMap::with_capacity(breakers.len());
        for (name, breaker) in breakers.iter() {
            metrics.insert(name.clone(), breaker.metrics().await);
        }
        metrics
    }

    /// Reset every registered breaker to Closed
    pub async fn reset_all(&self) {
        let breakers = self.breakers.read().await;
        for breaker in breakers.values() {
            breaker.reset().await;
        }
    }
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fail() -> Result<(), std::io::Error> {
        Err(std::io::Error::new(std::io::ErrorKind::Other, "boom"))
    }

    fn succeed() -> Result<(), std::io::Error> {
        Ok(())
    }

    #[tokio::test]
    async fn test_opens_at_failure_threshold() {
        let breaker = CircuitBreaker::new(
            "primary-write",
            BreakerConfig {
                max_failures: 3,
                ..Default::default()
            },
        );

        for _ in 0..3 {
            let result = breaker.execute(|| async { fail() }).await;
            assert!(matches!(result, Err(BreakerError::Service(_))));
        }
        assert_eq!(breaker.state().await, CircuitState::Open);

        // The next call is rejected without invoking the operation
        let mut invoked = false;
        let result = breaker
            .execute(|| {
                invoked = true;
                async { succeed() }
            })
            .await;
        assert!(matches!(result, Err(BreakerError::CircuitOpen(_))));
        assert!(!invoked);
    }

    #[tokio::test]
    async fn test_failures_accumulate_across_successes_while_closed() {
        let breaker = CircuitBreaker::new(
            "primary-write",
            BreakerConfig {
                max_failures: 2,
                ..Default::default()
            },
        );

        let _ = breaker.execute(|| async { fail() }).await;
        let _ = breaker.execute(|| async { succeed() }).await;
        assert_eq!(breaker.state().await, CircuitState::Closed);

        // The counter is cumulative: one more failure opens the circuit
        let _ = breaker.execute(|| async { fail() }).await;
        assert_eq!(breaker.state().await, CircuitState::Open);
    }

    #[tokio::test]
    async fn test_recovery_timeout_gates_half_open() {
        let breaker = CircuitBreaker::new(
            "replica-east",
            BreakerConfig {
                max_failures: 1,
                recovery_timeout: Duration::from_millis(100),
                ..Default::default()
            },
        );

        let _ = breaker.execute(|| async { fail() }).await;
        assert_eq!(breaker.state().await, CircuitState::Open);

        // Before the timeout elapses the call is rejected
        let result = breaker.execute(|| async { succeed() }).await;
        assert!(matches!(result, Err(BreakerError::CircuitOpen(_))));

        tokio::time::sleep(Duration::from_millis(150)).await;

        // After the timeout the call is admitted as a probe
        let result = breaker.execute(|| async { succeed() }).await;
        assert!(result.is_ok());
        assert_eq!(breaker.state().await, CircuitState::HalfOpen);
    }

    #[tokio::test]
    async fn test_half_open_closes_after_required_successes() {
        let breaker = CircuitBreaker::new(
            "replica-east",
            BreakerConfig {
                max_failures: 1,
                recovery_timeout: Duration::from_millis(50),
                required_successes: 3,
                max_half_open_probes: 5,
            },
        );

        let _ = breaker.execute(|| async { fail() }).await;
        tokio::time::sleep(Duration::from_millis(80)).await;

        for _ in 0..3 {
            let result = breaker.execute(|| async { succeed() }).await;
            assert!(result.is_ok());
        }

        assert_eq!(breaker.state().await, CircuitState::Closed);
        let metrics = breaker.metrics().await;
        assert_eq!(metrics.failures, 0);
        assert_eq!(metrics.successes, 0);
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens() {
        let breaker = CircuitBreaker::new(
            "replica-east",
            BreakerConfig {
                max_failures: 1,
                recovery_timeout: Duration::from_millis(50),
                ..Default::default()
            },
        );

        let _ = breaker.execute(|| async { fail() }).await;
        tokio::time::sleep(Duration::from_millis(80)).await;

        let _ = breaker.execute(|| async { succeed() }).await;
        assert_eq!(breaker.state().await, CircuitState::HalfOpen);

        let _ = breaker.execute(|| async { fail() }).await;
        assert_eq!(breaker.state().await, CircuitState::Open);
    }

    #[tokio::test]
    async fn test_half_open_probe_capacity() {
        let breaker = CircuitBreaker::new(
            "replica-east",
            BreakerConfig {
                max_failures: 1,
                recovery_timeout: Duration::from_millis(50),
                // More successes required than probes admitted, so the
                // breaker stays half-open while the limit is exercised
                required_successes: 10,
                max_half_open_probes: 5,
            },
        );

        let _ = breaker.execute(|| async { fail() }).await;
        tokio::time::sleep(Duration::from_millis(80)).await;

        for _ in 0..5 {
            let result = breaker.execute(|| async { succeed() }).await;
            assert!(result.is_ok());
        }
        assert_eq!(breaker.state().await, CircuitState::HalfOpen);

        let result = breaker.execute(|| async { succeed() }).await;
        assert!(matches!(result, Err(BreakerError::HalfOpenLimitReached(_))));
    }

    #[tokio::test]
    async fn test_manual_reset() {
        let breaker = CircuitBreaker::new(
            "primary-write",
            BreakerConfig {
                max_failures: 1,
                ..Default::default()
            },
        );

        let _ = breaker.execute(|| async { fail() }).await;
        assert_eq!(breaker.state().await, CircuitState::Open);

        breaker.reset().await;
        assert_eq!(breaker.state().await, CircuitState::Closed);

        let metrics = breaker.metrics().await;
        assert_eq!(metrics.failures, 0);
        assert_eq!(metrics.successes, 0);
        assert!(metrics.last_failure_age.is_none());

        let result = breaker.execute(|| async { succeed() }).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_registry_returns_same_breaker() {
        let registry = BreakerRegistry::new();

        let a = registry.get("primary-write", BreakerConfig::default()).await;
        let b = registry.get("primary-write", BreakerConfig::default()).await;
        assert!(Arc::ptr_eq(&a, &b));

        let other = registry.get("replica-east", BreakerConfig::default()).await;
        assert!(!Arc::ptr_eq(&a, &other));

        let metrics = registry.all_metrics().await;
        assert_eq!(metrics.len(), 2);
        assert!(metrics.contains_key("primary-write"));
    }

    #[tokio::test]
    async fn test_registry_reset_all() {
        let registry = BreakerRegistry::new();
        let breaker = registry
            .get(
                "primary-write",
                BreakerConfig {
                    max_failures: 1,
                    ..Default::default()
                },
            )
            .await;

        let _ = breaker.execute(|| async { fail() }).await;
        assert_eq!(breaker.state().await, CircuitState::Open);

        registry.reset_all().await;
        assert_eq!(breaker.state().await, CircuitState::Closed);
    }
}
