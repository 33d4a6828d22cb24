//! Structured backup dump: the full contents of every table, keyed the same
//! way `db/models.rs`'s `From` impls in the teacher project convert DB rows
//! into API-facing JSON (`serde_json`, plain field-for-field structs, no
//! custom (de)serialization logic).

use serde::{Deserialize, Serialize};

use super::models::{
    Account, AccountKey, AuditLogEntry, BootstrapSession, KnownHost, PublicKey, SystemKey,
};
use super::Database;
use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupDump {
    pub accounts: Vec<Account>,
    pub public_keys: Vec<PublicKey>,
    pub account_keys: Vec<AccountKey>,
    pub system_keys: Vec<SystemKey>,
    pub known_hosts: Vec<KnownHost>,
    pub audit_log: Vec<AuditLogEntry>,
    pub bootstrap_sessions: Vec<BootstrapSession>,
}

impl Database {
    pub async fn export_data_for_backup(&self) -> Result<BackupDump> {
        let accounts = sqlx::query_as::<_, Account>("SELECT * FROM accounts ORDER BY id")
            .fetch_all(self.pool())
            .await?;
        let public_keys = sqlx::query_as::<_, PublicKey>("SELECT * FROM public_keys ORDER BY id")
            .fetch_all(self.pool())
            .await?;
        let account_keys = sqlx::query_as::<_, AccountKey>(
            "SELECT * FROM account_keys ORDER BY account_id, key_id",
        )
        .fetch_all(self.pool())
        .await?;
        let system_keys = sqlx::query_as::<_, SystemKey>("SELECT * FROM system_keys ORDER BY id")
            .fetch_all(self.pool())
            .await?;
        let known_hosts =
            sqlx::query_as::<_, KnownHost>("SELECT * FROM known_hosts ORDER BY hostname")
                .fetch_all(self.pool())
                .await?;
        let audit_log = sqlx::query_as::<_, AuditLogEntry>("SELECT * FROM audit_log ORDER BY id")
            .fetch_all(self.pool())
            .await?;
        let bootstrap_sessions = sqlx::query_as::<_, BootstrapSession>(
            "SELECT * FROM bootstrap_sessions ORDER BY id",
        )
        .fetch_all(self.pool())
        .await?;

        Ok(BackupDump {
            accounts,
            public_keys,
            account_keys,
            system_keys,
            known_hosts,
            audit_log,
            bootstrap_sessions,
        })
    }

    /// Replaces all current contents with `dump`, transactionally. Destructive.
    pub async fn import_data_from_backup(&self, dump: &BackupDump) -> Result<()> {
        let mut tx = self.pool().begin().await?;

        for table in [
            "account_keys",
            "accounts",
            "public_keys",
            "system_keys",
            "known_hosts",
            "audit_log",
            "bootstrap_sessions",
        ] {
            sqlx::query(&format!("DELETE FROM {table}")).execute(&mut *tx).await?;
        }

        for account in &dump.accounts {
            sqlx::query(
                "INSERT INTO accounts (id, username, hostname, label, tags, serial, is_active, is_dirty) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(account.id)
            .bind(&account.username)
            .bind(&account.hostname)
            .bind(&account.label)
            .bind(&account.tags)
            .bind(account.serial)
            .bind(account.is_active)
            .bind(account.is_dirty)
            .execute(&mut *tx)
            .await?;
        }

        for key in &dump.public_keys {
            sqlx::query(
                "INSERT INTO public_keys (id, algorithm, key_data, comment, is_global, expires_at) \
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(key.id)
            .bind(&key.algorithm)
            .bind(&key.key_data)
            .bind(&key.comment)
            .bind(key.is_global)
            .bind(&key.expires_at)
            .execute(&mut *tx)
            .await?;
        }

        for edge in &dump.account_keys {
            sqlx::query("INSERT INTO account_keys (account_id, key_id) VALUES (?, ?)")
                .bind(edge.account_id)
                .bind(edge.key_id)
                .execute(&mut *tx)
                .await?;
        }

        for key in &dump.system_keys {
            sqlx::query(
                "INSERT INTO system_keys (id, serial, public_key, private_key, is_active) \
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(key.id)
            .bind(key.serial)
            .bind(&key.public_key)
            .bind(&key.private_key)
            .bind(key.is_active)
            .execute(&mut *tx)
            .await?;
        }

        for host in &dump.known_hosts {
            sqlx::query("INSERT INTO known_hosts (hostname, key) VALUES (?, ?)")
                .bind(&host.hostname)
                .bind(&host.key)
                .execute(&mut *tx)
                .await?;
        }

        for entry in &dump.audit_log {
            sqlx::query(
                "INSERT INTO audit_log (id, timestamp, username, action, details) \
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(entry.id)
            .bind(&entry.timestamp)
            .bind(&entry.username)
            .bind(&entry.action)
            .bind(&entry.details)
            .execute(&mut *tx)
            .await?;
        }

        for session in &dump.bootstrap_sessions {
            sqlx::query(
                "INSERT INTO bootstrap_sessions \
                 (id, username, hostname, label, tags, temp_public_key, temp_private_key, expires_at, status) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&session.id)
            .bind(&session.username)
            .bind(&session.hostname)
            .bind(&session.label)
            .bind(&session.tags)
            .bind(&session.temp_public_key)
            .bind(&session.temp_private_key)
            .bind(&session.expires_at)
            .bind(&session.status)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Additive merge: existing rows win on natural-key collision, otherwise
    /// the imported row is inserted. Transactional.
    pub async fn integrate_data_from_backup(&self, dump: &BackupDump) -> Result<()> {
        let mut tx = self.pool().begin().await?;

        for account in &dump.accounts {
            let exists: Option<i64> = sqlx::query_scalar(
                "SELECT id FROM accounts WHERE username = ? AND hostname = ?",
            )
            .bind(&account.username)
            .bind(&account.hostname)
            .fetch_optional(&mut *tx)
            .await?;
            if exists.is_none() {
                sqlx::query(
                    "INSERT INTO accounts (username, hostname, label, tags, serial, is_active, is_dirty) \
                     VALUES (?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(&account.username)
                .bind(&account.hostname)
                .bind(&account.label)
                .bind(&account.tags)
                .bind(account.serial)
                .bind(account.is_active)
                .bind(account.is_dirty)
                .execute(&mut *tx)
                .await?;
            }
        }

        for key in &dump.public_keys {
            let exists: Option<i64> =
                sqlx::query_scalar("SELECT id FROM public_keys WHERE comment = ?")
                    .bind(&key.comment)
                    .fetch_optional(&mut *tx)
                    .await?;
            if exists.is_none() {
                sqlx::query(
                    "INSERT INTO public_keys (algorithm, key_data, comment, is_global, expires_at) \
                     VALUES (?, ?, ?, ?, ?)",
                )
                .bind(&key.algorithm)
                .bind(&key.key_data)
                .bind(&key.comment)
                .bind(key.is_global)
                .bind(&key.expires_at)
                .execute(&mut *tx)
                .await?;
            }
        }

        for host in &dump.known_hosts {
            let exists: Option<String> =
                sqlx::query_scalar("SELECT hostname FROM known_hosts WHERE hostname = ?")
                    .bind(&host.hostname)
                    .fetch_optional(&mut *tx)
                    .await?;
            if exists.is_none() {
                sqlx::query("INSERT INTO known_hosts (hostname, key) VALUES (?, ?)")
                    .bind(&host.hostname)
                    .bind(&host.key)
                    .execute(&mut *tx)
                    .await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }
}
