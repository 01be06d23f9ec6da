use serde::Deserialize;

/// Process-wide configuration loaded from environment variables. Per-chain
/// sync/contract configuration (spec.md §6's "Configuration contract") is a
/// separate, richer object handed in by the (external) config-file loader —
/// see `crate::types::ChainConfig`. This struct only covers the ambient
/// concerns: where the database lives, and the knobs with safe defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct CoreConfig {
    /// PostgreSQL connection string.
    pub database_url: String,

    /// Maximum number of PostgreSQL connections in the pool (default: 20).
    pub db_max_connections: u32,

    /// Processor poll interval when caught up to the syncer's frontier,
    /// in milliseconds (spec.md §4.7, default 1 s).
    pub processor_poll_interval_ms: u64,

    /// Cached RPC concurrency semaphore size (spec.md §4.4, default 100).
    pub rpc_cache_concurrency: usize,

    /// Integer suffix applied to the `sync`/`app`/`crons` schema names, so
    /// multiple spec versions can coexist (spec.md §6).
    pub schema_version: u32,
}

impl CoreConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            database_url: std::env::var("DATABASE_URL")
                .map_err(|_| anyhow::anyhow!("DATABASE_URL environment variable is required"))?,
            db_max_connections: std::env::var("DB_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "20".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("DB_MAX_CONNECTIONS must be a valid u32"))?,
            processor_poll_interval_ms: std::env::var("PROCESSOR_POLL_INTERVAL_MS")
                .unwrap_or_else(|_| "1000".to_string())
                .parse()
                .map_err(|_| {
                    anyhow::anyhow!("PROCESSOR_POLL_INTERVAL_MS must be a valid u64")
                })?,
            rpc_cache_concurrency: std::env::var("RPC_CACHE_CONCURRENCY")
                .unwrap_or_else(|_| "100".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("RPC_CACHE_CONCURRENCY must be a valid usize"))?,
            schema_version: std::env::var("SCHEMA_VERSION")
                .unwrap_or_else(|_| "1".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("SCHEMA_VERSION must be a valid u32"))?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_env_requires_database_url() {
        // SAFETY: test runs single-threaded within this process's env scope.
        unsafe {
            std::env::remove_var("DATABASE_URL");
        }
        let result = CoreConfig::from_env();
        assert!(result.is_err());
    }
}
