//! Embedded migration runner.
//!
//! Each supported dialect has its own directory under `migrations/` at the
//! workspace root, embedded into the binary at compile time with
//! `rust-embed` (the teacher embeds its web UI bundle the same way, via
//! `#[derive(RustEmbed)]` in `server.rs`). Files are named
//! `NNNN_description.up.sql` and applied in lexicographic order, each inside
//! its own transaction, tracked in a `schema_migrations` table so a restart
//! only applies what's new.

use rust_embed::RustEmbed;
use sqlx::any::AnyKind;
use sqlx::{AnyPool, Row};
use tracing::info;

use crate::error::{KeymasterError, Result};

#[derive(RustEmbed)]
#[folder = "migrations/sqlite/"]
struct SqliteMigrations;

#[derive(RustEmbed)]
#[folder = "migrations/postgres/"]
struct PostgresMigrations;

#[derive(RustEmbed)]
#[folder = "migrations/mysql/"]
struct MysqlMigrations;

fn dialect_files(kind: AnyKind) -> Vec<(String, String)> {
    let mut names: Vec<String> = match kind {
        AnyKind::Sqlite => SqliteMigrations::iter().map(|f| f.to_string()).collect(),
        AnyKind::Postgres => PostgresMigrations::iter().map(|f| f.to_string()).collect(),
        AnyKind::MySql => MysqlMigrations::iter().map(|f| f.to_string()).collect(),
        _ => Vec::new(),
    };
    names.sort();
    names
        .into_iter()
        .filter_map(|name| {
            let bytes = match kind {
                AnyKind::Sqlite => SqliteMigrations::get(&name),
                AnyKind::Postgres => PostgresMigrations::get(&name),
                AnyKind::MySql => MysqlMigrations::get(&name),
                _ => None,
            }?;
            let sql = String::from_utf8_lossy(&bytes.data).into_owned();
            Some((name, sql))
        })
        .collect()
}

/// Applies every migration for `pool`'s dialect that isn't already recorded
/// in `schema_migrations`. Idempotent: safe to call on every startup.
pub async fn run_migrations(pool: &AnyPool) -> Result<()> {
    let kind = pool.any_kind();

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS schema_migrations (\
            version TEXT PRIMARY KEY\
        )",
    )
    .execute(pool)
    .await?;

    // Older installs may predate the applied_at column; add it if missing
    // rather than assuming a fresh table.
    let add_column_sql = match kind {
        AnyKind::MySql => "ALTER TABLE schema_migrations ADD COLUMN applied_at TEXT",
        AnyKind::Postgres => "ALTER TABLE schema_migrations ADD COLUMN IF NOT EXISTS applied_at TEXT",
        _ => "ALTER TABLE schema_migrations ADD COLUMN applied_at TEXT",
    };
    match sqlx::query(add_column_sql).execute(pool).await {
        Ok(_) => {}
        Err(e) => {
            // Postgres/MySQL/SQLite all error if the column already exists
            // (Postgres is the exception, handled by IF NOT EXISTS above);
            // any other failure here is a real problem.
            let msg = e.to_string().to_lowercase();
            if !msg.contains("duplicate") && !msg.contains("already exists") {
                return Err(KeymasterError::MigrationFailed {
                    version: "schema_migrations bootstrap".into(),
                    cause: e.to_string(),
                });
            }
        }
    }
    for (version, sql) in dialect_files(kind) {
        let applied: Option<String> =
            sqlx::query("SELECT version FROM schema_migrations WHERE version = ?")
                .bind(version.clone())
                .fetch_optional(pool)
                .await?
                .map(|row| row.get::<String, _>(0));

        if applied.is_some() {
            continue;
        }

        info!(version = %version, "applying migration");
        let mut tx = pool.begin().await.map_err(|e| KeymasterError::MigrationFailed {
            version: version.clone(),
            cause: e.to_string(),
        })?;

        for statement in split_statements(&sql) {
            sqlx::query(statement)
                .execute(&mut *tx)
                .await
                .map_err(|e| KeymasterError::MigrationFailed {
                    version: version.clone(),
                    cause: e.to_string(),
                })?;
        }

        sqlx::query("INSERT INTO schema_migrations (version, applied_at) VALUES (?, ?)")
            .bind(version.clone())
            .bind(chrono::Utc::now().to_rfc3339())
            .execute(&mut *tx)
            .await
            .map_err(|e| KeymasterError::MigrationFailed {
                version: version.clone(),
                cause: e.to_string(),
            })?;

        tx.commit().await.map_err(|e| KeymasterError::MigrationFailed {
            version: version.clone(),
            cause: e.to_string(),
        })?;

        info!(version = %version, "migration applied");
    }

    Ok(())
}

fn split_statements(sql: &str) -> impl Iterator<Item = &str> {
    sql.split(';').filter(|s| !s.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlite_migrations_are_ordered() {
        let files = dialect_files(AnyKind::Sqlite);
        let names: Vec<&str> = files.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["0001_initial_schema.up.sql", "0002_backup_support.up.sql"]);
    }

    #[test]
    fn every_dialect_has_the_same_migration_count() {
        assert_eq!(dialect_files(AnyKind::Sqlite).len(), dialect_files(AnyKind::Postgres).len());
        assert_eq!(dialect_files(AnyKind::Sqlite).len(), dialect_files(AnyKind::MySql).len());
    }
}
