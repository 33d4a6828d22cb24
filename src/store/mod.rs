//! Persistence layer.
//!
//! `Database` wraps a single `sqlx::AnyPool` so the same repository code
//! runs unmodified against SQLite, PostgreSQL, or MySQL — the dialect is
//! chosen once, from the DSN scheme, when the pool is opened. The teacher
//! crate (`db/mod.rs`) hard-wires a single `SqlitePool`; we generalize that
//! shape instead of rewriting it, keeping `new()`'s connect-then-migrate
//! sequence.

pub mod backup;
pub mod migrations;
pub mod models;
pub mod repository;

use std::time::Duration;

use sqlx::any::{AnyConnectOptions, AnyKind, AnyPoolOptions};
use sqlx::AnyPool;
use tracing::info;

use crate::config::PoolConfig;
use crate::error::{KeymasterError, Result};

/// Database connection pool, dialect-agnostic at the call site.
#[derive(Clone)]
pub struct Database {
    pool: AnyPool,
}

impl Database {
    /// Opens `dsn` and applies any pending migrations for its dialect.
    /// `dsn` is a standard connection string: `sqlite://path/to/file.db`,
    /// `sqlite::memory:`, `postgres://...`, or `mysql://...`.
    pub async fn connect(dsn: &str, pool_config: &PoolConfig) -> Result<Self> {
        sqlx::any::install_default_drivers();

        let options: AnyConnectOptions = dsn.parse().map_err(|e: sqlx::Error| {
            KeymasterError::PersistError(format!("invalid DSN: {e}"))
        })?;

        let is_memory_sqlite = dsn.contains(":memory:");
        let mut pool_options = AnyPoolOptions::new()
            .max_connections(if is_memory_sqlite { 1 } else { pool_config.max_open_conns })
            .min_connections(if is_memory_sqlite { 1 } else { 0 });

        if let Some(lifetime) = pool_config.conn_max_lifetime {
            pool_options = pool_options.max_lifetime(lifetime);
        }
        if let Some(idle) = pool_config.conn_max_idle_time {
            pool_options = pool_options.idle_timeout(idle);
        }

        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(|e| KeymasterError::PersistError(format!("connecting to {dsn}: {e}")))?;

        info!(dialect = ?pool.any_kind(), "connected to store");

        let db = Self { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    async fn run_migrations(&self) -> Result<()> {
        migrations::run_migrations(&self.pool).await
    }

    pub fn dialect(&self) -> AnyKind {
        self.pool.any_kind()
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    /// Runs engine-appropriate maintenance: `PRAGMA optimize` (non-fatal),
    /// `VACUUM`, and a WAL checkpoint for SQLite; `VACUUM ANALYZE` for
    /// Postgres; a per-table `OPTIMIZE TABLE` sweep for MySQL whose
    /// individual failures are collected into one aggregate error.
    pub async fn run_maintenance(&self) -> Result<()> {
        match self.pool.any_kind() {
            AnyKind::Sqlite => {
                if let Err(e) = sqlx::query("PRAGMA optimize").execute(&self.pool).await {
                    tracing::warn!(error = %e, "PRAGMA optimize failed, continuing");
                }
                sqlx::query("VACUUM").execute(&self.pool).await?;
                sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)").execute(&self.pool).await?;
            }
            AnyKind::Postgres => {
                sqlx::query("VACUUM ANALYZE").execute(&self.pool).await?;
            }
            AnyKind::MySql => {
                let mut failures = Vec::new();
                for table in [
                    "accounts",
                    "public_keys",
                    "account_keys",
                    "system_keys",
                    "known_hosts",
                    "audit_log",
                    "bootstrap_sessions",
                ] {
                    if let Err(e) = sqlx::query(&format!("OPTIMIZE TABLE {table}"))
                        .execute(&self.pool)
                        .await
                    {
                        failures.push(format!("{table}: {e}"));
                    }
                }
                if !failures.is_empty() {
                    return Err(KeymasterError::PersistError(format!(
                        "table optimize failed for: {}",
                        failures.join(", ")
                    )));
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Performs an engine-appropriate integrity check, used by the facade's
    /// `RunDBMaintenance` before running anything destructive. On SQLite
    /// this runs `PRAGMA integrity_check` and returns `DBCorrupt` unless the
    /// result is exactly `"ok"`; other engines fall back to a connectivity
    /// probe against the migrations table.
    pub async fn check_integrity(&self) -> Result<()> {
        if matches!(self.pool.any_kind(), AnyKind::Sqlite) {
            let row: (String,) = sqlx::query_as("PRAGMA integrity_check")
                .fetch_one(&self.pool)
                .await
                .map_err(|e| KeymasterError::DBCorrupt(e.to_string()))?;
            if row.0 != "ok" {
                return Err(KeymasterError::DBCorrupt(row.0));
            }
            return Ok(());
        }

        sqlx::query("SELECT 1 FROM schema_migrations LIMIT 1")
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| KeymasterError::DBCorrupt(e.to_string()))?;
        Ok(())
    }
}

pub(crate) fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;

    #[tokio::test]
    async fn connects_and_migrates_in_memory_sqlite() {
        let db = Database::connect("sqlite::memory:", &PoolConfig::default())
            .await
            .expect("connect");
        db.check_integrity().await.expect("integrity check");
        assert!(matches!(db.dialect(), AnyKind::Sqlite));
    }
}
