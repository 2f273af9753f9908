//! Postgres pool sizing.
//!
//! A running detection job holds at most one connection at a time and none
//! while the detector call is in flight, so the pool is sized from the
//! worker's concurrency plus a fixed share for API requests.

use std::time::{Duration, Instant};

use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::info;

use tether_core::{defaults, Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::for_workers(defaults::DETECTION_MAX_CONCURRENT)
    }
}

impl PoolConfig {
    /// One connection per concurrent detection job plus the API share.
    pub fn for_workers(max_concurrent_jobs: usize) -> Self {
        let jobs = u32::try_from(max_concurrent_jobs.max(1)).unwrap_or(u32::MAX);
        Self {
            max_connections: jobs.saturating_add(defaults::DB_API_CONNECTIONS),
            acquire_timeout: Duration::from_secs(defaults::DB_ACQUIRE_TIMEOUT_SECS),
        }
    }

    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `DATABASE_MAX_CONNECTIONS` | derived | Explicit pool size, overrides sizing |
    /// | `DETECTION_MAX_CONCURRENT` | `4` | Sizes the pool when no explicit size is set |
    /// | `DATABASE_ACQUIRE_TIMEOUT_SECS` | `30` | Wait for a free connection |
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let jobs = lookup("DETECTION_MAX_CONCURRENT")
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(defaults::DETECTION_MAX_CONCURRENT);
        let mut config = Self::for_workers(jobs);

        if let Some(n) = lookup("DATABASE_MAX_CONNECTIONS")
            .and_then(|v| v.parse::<u32>().ok())
            .filter(|n| *n > 0)
        {
            config.max_connections = n;
        }
        if let Some(secs) = lookup("DATABASE_ACQUIRE_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            config.acquire_timeout = Duration::from_secs(secs);
        }
        config
    }

    pub fn with_max_connections(mut self, n: u32) -> Self {
        self.max_connections = n;
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }
}

pub(crate) async fn connect(database_url: &str, config: &PoolConfig) -> Result<PgPool> {
    let start = Instant::now();
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(config.acquire_timeout)
        .connect(database_url)
        .await
        .map_err(Error::Database)?;

    info!(
        subsystem = "database",
        component = "pool",
        max_connections = config.max_connections,
        acquire_timeout_secs = config.acquire_timeout.as_secs(),
        duration_ms = start.elapsed().as_millis() as u64,
        "Database connection pool established"
    );
    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_pool_sized_from_worker_concurrency() {
        let config = PoolConfig::from_lookup(lookup(&[("DETECTION_MAX_CONCURRENT", "12")]));
        assert_eq!(config.max_connections, 12 + defaults::DB_API_CONNECTIONS);
        assert_eq!(PoolConfig::default(), PoolConfig::for_workers(4));
        assert_eq!(
            PoolConfig::for_workers(0).max_connections,
            1 + defaults::DB_API_CONNECTIONS
        );
    }

    #[test]
    fn test_explicit_pool_size_wins() {
        let config = PoolConfig::from_lookup(lookup(&[
            ("DETECTION_MAX_CONCURRENT", "12"),
            ("DATABASE_MAX_CONNECTIONS", "5"),
            ("DATABASE_ACQUIRE_TIMEOUT_SECS", "3"),
        ]));
        assert_eq!(config.max_connections, 5);
        assert_eq!(config.acquire_timeout, Duration::from_secs(3));

        let config = PoolConfig::from_lookup(lookup(&[("DATABASE_MAX_CONNECTIONS", "0")]));
        assert_eq!(config, PoolConfig::default());
    }
}
