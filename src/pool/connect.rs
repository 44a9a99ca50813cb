//! Connection establishment seam
//!
//! The managers in this crate never talk to the driver directly; they go
//! through the `Connector` trait so that the connection constructor and the
//! liveness ping can be substituted in tests and by embedders with custom
//! connection setup.

use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgSslMode};
use std::time::Duration;
use tracing::debug;

use crate::config::{ConnectionSettings, PoolSizingSettings};

/// Resolved sizing for one connection pool
#[derive(Debug, Clone, Copy)]
pub struct PoolSizing {
    /// Maximum open connections
    pub max_open: u32,

    /// Connections kept warm when idle
    pub max_idle: u32,

    /// Maximum connection lifetime
    pub max_lifetime: Duration,

    /// Maximum connection idle time
    pub max_idle_time: Duration,
}

impl PoolSizing {
    /// Default sizing for replica pools: 50 open, 10 idle, 30 min
    /// lifetime, 5 min idle time
    pub fn replica_default() -> Self {
        Self {
            max_open: 50,
            max_idle: 10,
            max_lifetime: Duration::from_secs(30 * 60),
            max_idle_time: Duration::from_secs(5 * 60),
        }
    }

    /// Apply configured overrides on top of this sizing
    pub fn with_overrides(self, overrides: &PoolSizingSettings) -> Self {
        Self {
            max_open: overrides.max_open.unwrap_or(self.max_open),
            max_idle: overrides.max_idle.unwrap_or(self.max_idle),
            max_lifetime: overrides
                .max_lifetime_secs
                .map(Duration::from_secs)
                .unwrap_or(self.max_lifetime),
            max_idle_time: overrides
                .max_idle_time_secs
                .map(Duration::from_secs)
                .unwrap_or(self.max_idle_time),
        }
    }
}

/// Creates pooled connections and probes their liveness
#[async_trait]
pub trait Connector: Send + Sync {
    /// Establish a pooled connection to the given target
    async fn connect(
        &self,
        settings: &ConnectionSettings,
        sizing: &PoolSizing,
    ) -> Result<PgPool, sqlx::Error>;

    /// Round-trip liveness probe against an established pool
    async fn ping(&self, pool: &PgPool) -> Result<(), sqlx::Error>;

    /// Release all connections held by a pool
    async fn close(&self, pool: &PgPool) -> Result<(), sqlx::Error> {
        pool.close().await;
        Ok(())
    }
}

/// Default connector backed by the sqlx Postgres driver
#[derive(Debug, Clone, Default)]
pub struct PgConnector {
    /// Timeout for acquiring a connection from the pool
    pub acquire_timeout: Duration,
}

impl PgConnector {
    pub fn new() -> Self {
        Self {
            acquire_timeout: Duration::from_secs(10),
        }
    }

    fn connect_options(settings: &ConnectionSettings) -> PgConnectOptions {
        let ssl_mode = match settings.ssl_mode.as_str() {
            "disable" => PgSslMode::Disable,
            "allow" => PgSslMode::Allow,
            "require" => PgSslMode::Require,
            "verify-ca" => PgSslMode::VerifyCa,
            "verify-full" => PgSslMode::VerifyFull,
            _ => PgSslMode::Prefer,
        };

        PgConnectOptions::new()
            .host(&settings.host)
            .port(settings.port)
            .username(&settings.user)
            .password(&settings.password)
            .database(&settings.dbname)
            .ssl_mode(ssl_mode)
    }
}

#[async_trait]
impl Connector for PgConnector {
    async fn connect(
        &self,
        settings: &ConnectionSettings,
        sizing: &PoolSizing,
    ) -> Result<PgPool, sqlx::Error> {
        debug!(
            target = %settings.target(),
            max_open = sizing.max_open,
            max_idle = sizing.max_idle,
            "Connecting pool"
        );

        PgPoolOptions::new()
            .max_connections(sizing.max_open)
            .min_connections(sizing.max_idle)
            .max_lifetime(sizing.max_lifetime)
            .idle_timeout(sizing.max_idle_time)
            .acquire_timeout(self.acquire_timeout)
            .connect_with(Self::connect_options(settings))
            .await
    }

    async fn ping(&self, pool: &PgPool) -> Result<(), sqlx::Error> {
        sqlx::query("SELECT 1").execute(pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> ConnectionSettings {
        ConnectionSettings {
            host: "db.internal".to_string(),
            port: 5432,
            user: "app".to_string(),
            password: "secret".to_string(),
            dbname: "app_db".to_string(),
            ssl_mode: "verify-full".to_string(),
        }
    }

    #[test]
    fn test_connect_options_carry_settings() {
        let options = PgConnector::connect_options(&settings());
        assert_eq!(options.get_host(), "db.internal");
        assert_eq!(options.get_port(), 5432);
        assert_eq!(options.get_database(), Some("app_db"));
    }

    #[test]
    fn test_sizing_overrides() {
        let overrides = PoolSizingSettings {
            max_open: Some(80),
            max_idle: None,
            max_lifetime_secs: Some(600),
            max_idle_time_secs: None,
        };

        let sizing = PoolSizing::replica_default().with_overrides(&overrides);
        assert_eq!(sizing.max_open, 80);
        assert_eq!(sizing.max_idle, 10);
        assert_eq!(sizing.max_lifetime, Duration::from_secs(600));
        assert_eq!(sizing.max_idle_time, Duration::from_secs(300));
    }
}
