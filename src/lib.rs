//! pgsplit - database resilience and read/write splitting for PostgreSQL

pub mod config;
pub mod core;
pub mod metrics;
pub mod pool;
pub mod replica;
pub mod router;

pub use crate::config::Config;
pub use crate::core::Core;
