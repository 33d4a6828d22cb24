//! Typed CRUD operations over the `Database` pool.
//!
//! Every insert uses an insert-then-select-by-natural-key pattern instead of
//! `RETURNING` or `LAST_INSERT_ID()`: MySQL has no `RETURNING` clause, so a
//! single code path that works across all three dialects reads the row back
//! by its unique key right after the insert. This mirrors the teacher's
//! `db/repository.rs` CRUD shape (plain `sqlx::query_as` calls against one
//! pool) generalized from `SqlitePool` to `AnyPool`.

use sqlx::Row;

use super::models::{
    Account, AccountKey, AuditLogEntry, BootstrapSession, KnownHost, PublicKey, SystemKey,
};
use super::now_rfc3339;
use super::Database;
use crate::error::{KeymasterError, Result};

impl Database {
    // ---- Accounts ----------------------------------------------------

    pub async fn create_account(
        &self,
        username: &str,
        hostname: &str,
        label: Option<&str>,
        tags: Option<&str>,
    ) -> Result<Account> {
        sqlx::query(
            "INSERT INTO accounts (username, hostname, label, tags, serial, is_active, is_dirty) \
             VALUES (?, ?, ?, ?, 0, 1, 0)",
        )
        .bind(username)
        .bind(hostname)
        .bind(label)
        .bind(tags)
        .execute(self.pool())
        .await?;

        self.get_account_by_identity(username, hostname)
            .await?
            .ok_or_else(|| KeymasterError::PersistError("account vanished after insert".into()))
    }

    pub async fn get_account(&self, id: i64) -> Result<Option<Account>> {
        let row = sqlx::query_as::<_, Account>("SELECT * FROM accounts WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        Ok(row)
    }

    pub async fn get_account_by_identity(
        &self,
        username: &str,
        hostname: &str,
    ) -> Result<Option<Account>> {
        let row = sqlx::query_as::<_, Account>(
            "SELECT * FROM accounts WHERE username = ? AND hostname = ?",
        )
        .bind(username)
        .bind(hostname)
        .fetch_optional(self.pool())
        .await?;
        Ok(row)
    }

    pub async fn get_account_by_label(&self, label: &str) -> Result<Option<Account>> {
        let row = sqlx::query_as::<_, Account>(
            "SELECT * FROM accounts WHERE LOWER(label) = LOWER(?)",
        )
        .bind(label)
        .fetch_optional(self.pool())
        .await?;
        Ok(row)
    }

    pub async fn list_accounts(&self, active_only: bool) -> Result<Vec<Account>> {
        let rows = if active_only {
            sqlx::query_as::<_, Account>("SELECT * FROM accounts WHERE is_active = 1 ORDER BY id")
                .fetch_all(self.pool())
                .await?
        } else {
            sqlx::query_as::<_, Account>("SELECT * FROM accounts ORDER BY id")
                .fetch_all(self.pool())
                .await?
        };
        Ok(rows)
    }

    pub async fn list_accounts_by_tag(&self, key: &str, value: &str) -> Result<Vec<Account>> {
        let needle = format!("{key}:{value}");
        let accounts = self.list_accounts(true).await?;
        Ok(accounts
            .into_iter()
            .filter(|a| a.tag_list().iter().any(|t| t == &needle))
            .collect())
    }

    pub async fn update_account_serial(&self, id: i64, serial: i64) -> Result<()> {
        sqlx::query("UPDATE accounts SET serial = ?, is_dirty = 0 WHERE id = ?")
            .bind(serial)
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn mark_account_dirty(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE accounts SET is_dirty = 1 WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn set_account_active(&self, id: i64, active: bool) -> Result<()> {
        sqlx::query("UPDATE accounts SET is_active = ? WHERE id = ?")
            .bind(active)
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn delete_account(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM accounts WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    // ---- Public keys ---------------------------------------------------

    pub async fn create_public_key(
        &self,
        algorithm: &str,
        key_data: &str,
        comment: &str,
        is_global: bool,
        expires_at: Option<&str>,
    ) -> Result<PublicKey> {
        sqlx::query(
            "INSERT INTO public_keys (algorithm, key_data, comment, is_global, expires_at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(algorithm)
        .bind(key_data)
        .bind(comment)
        .bind(is_global)
        .bind(expires_at)
        .execute(self.pool())
        .await?;

        self.get_public_key_by_comment(comment)
            .await?
            .ok_or_else(|| KeymasterError::PersistError("public key vanished after insert".into()))
    }

    pub async fn get_public_key_by_comment(&self, comment: &str) -> Result<Option<PublicKey>> {
        let row = sqlx::query_as::<_, PublicKey>("SELECT * FROM public_keys WHERE comment = ?")
            .bind(comment)
            .fetch_optional(self.pool())
            .await?;
        Ok(row)
    }

    pub async fn list_global_keys(&self) -> Result<Vec<PublicKey>> {
        let rows = sqlx::query_as::<_, PublicKey>(
            "SELECT * FROM public_keys WHERE is_global = 1 ORDER BY comment",
        )
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    pub async fn list_account_keys(&self, account_id: i64) -> Result<Vec<PublicKey>> {
        let rows = sqlx::query_as::<_, PublicKey>(
            "SELECT public_keys.* FROM public_keys \
             JOIN account_keys ON account_keys.key_id = public_keys.id \
             WHERE account_keys.account_id = ? \
             ORDER BY public_keys.comment",
        )
        .bind(account_id)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    pub async fn assign_key(&self, account_id: i64, key_id: i64) -> Result<AccountKey> {
        sqlx::query(
            "INSERT INTO account_keys (account_id, key_id) VALUES (?, ?)",
        )
        .bind(account_id)
        .bind(key_id)
        .execute(self.pool())
        .await?;
        Ok(AccountKey { account_id, key_id })
    }

    pub async fn unassign_key(&self, account_id: i64, key_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM account_keys WHERE account_id = ? AND key_id = ?")
            .bind(account_id)
            .bind(key_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn delete_public_key(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM public_keys WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    // ---- System keys / rotation ----------------------------------------

    pub async fn get_active_system_key(&self) -> Result<Option<SystemKey>> {
        let row = sqlx::query_as::<_, SystemKey>(
            "SELECT * FROM system_keys WHERE is_active = 1 LIMIT 1",
        )
        .fetch_optional(self.pool())
        .await?;
        Ok(row)
    }

    pub async fn get_system_key_by_serial(&self, serial: i64) -> Result<Option<SystemKey>> {
        let row = sqlx::query_as::<_, SystemKey>("SELECT * FROM system_keys WHERE serial = ?")
            .bind(serial)
            .fetch_optional(self.pool())
            .await?;
        Ok(row)
    }

    /// Invariant S1: deactivates every existing row, then inserts the new
    /// active key with the next dense serial, all inside one transaction.
    pub async fn rotate_system_key(&self, public_key: &str, private_key: &str) -> Result<i64> {
        let mut tx = self.pool().begin().await?;

        sqlx::query("UPDATE system_keys SET is_active = 0")
            .execute(&mut *tx)
            .await?;

        let max_row = sqlx::query("SELECT MAX(serial) FROM system_keys")
            .fetch_one(&mut *tx)
            .await?;
        let max_serial: Option<i64> = max_row.try_get(0)?;
        let new_serial = max_serial.unwrap_or(0) + 1;

        sqlx::query(
            "INSERT INTO system_keys (serial, public_key, private_key, is_active) \
             VALUES (?, ?, ?, 1)",
        )
        .bind(new_serial)
        .bind(public_key)
        .bind(private_key)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(new_serial)
    }

    // ---- Known hosts -----------------------------------------------------

    pub async fn get_known_host(&self, hostname: &str) -> Result<Option<KnownHost>> {
        let row = sqlx::query_as::<_, KnownHost>("SELECT * FROM known_hosts WHERE hostname = ?")
            .bind(hostname)
            .fetch_optional(self.pool())
            .await?;
        Ok(row)
    }

    pub async fn save_known_host(&self, hostname: &str, key: &str) -> Result<()> {
        let upserted = sqlx::query(
            "INSERT INTO known_hosts (hostname, key) VALUES (?, ?) \
             ON CONFLICT (hostname) DO UPDATE SET key = excluded.key",
        )
        .bind(hostname)
        .bind(key)
        .execute(self.pool())
        .await;

        match upserted {
            Ok(_) => Ok(()),
            Err(_) => self.upsert_known_host_fallback(hostname, key).await,
        }
    }

    /// MySQL doesn't understand `ON CONFLICT`; fall back to delete-then-insert
    /// inside one call when the dialect-specific upsert syntax fails to parse.
    async fn upsert_known_host_fallback(&self, hostname: &str, key: &str) -> Result<()> {
        let mut tx = self.pool().begin().await?;
        sqlx::query("DELETE FROM known_hosts WHERE hostname = ?")
            .bind(hostname)
            .execute(&mut *tx)
            .await?;
        sqlx::query("INSERT INTO known_hosts (hostname, key) VALUES (?, ?)")
            .bind(hostname)
            .bind(key)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    // ---- Audit log ---------------------------------------------------

    pub async fn append_audit(
        &self,
        username: Option<&str>,
        action: &str,
        details: Option<&str>,
    ) -> Result<AuditLogEntry> {
        let timestamp = now_rfc3339();
        sqlx::query(
            "INSERT INTO audit_log (timestamp, username, action, details) VALUES (?, ?, ?, ?)",
        )
        .bind(&timestamp)
        .bind(username)
        .bind(action)
        .bind(details)
        .execute(self.pool())
        .await?;

        let row = sqlx::query_as::<_, AuditLogEntry>(
            "SELECT * FROM audit_log WHERE timestamp = ? AND action = ? ORDER BY id DESC LIMIT 1",
        )
        .bind(&timestamp)
        .bind(action)
        .fetch_optional(self.pool())
        .await?
        .ok_or_else(|| KeymasterError::PersistError("audit entry vanished after insert".into()))?;
        Ok(row)
    }

    pub async fn list_audit_log(&self, limit: i64) -> Result<Vec<AuditLogEntry>> {
        let rows = sqlx::query_as::<_, AuditLogEntry>(
            "SELECT * FROM audit_log ORDER BY timestamp DESC, id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    // ---- Bootstrap sessions --------------------------------------------

    pub async fn save_bootstrap_session(&self, session: &BootstrapSession) -> Result<()> {
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
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn update_bootstrap_session_status(&self, id: &str, status: &str) -> Result<()> {
        sqlx::query("UPDATE bootstrap_sessions SET status = ? WHERE id = ?")
            .bind(status)
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn get_bootstrap_session(&self, id: &str) -> Result<Option<BootstrapSession>> {
        let row = sqlx::query_as::<_, BootstrapSession>(
            "SELECT * FROM bootstrap_sessions WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(self.pool())
        .await?;
        Ok(row)
    }

    pub async fn delete_bootstrap_session(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM bootstrap_sessions WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn get_expired_bootstrap_sessions(&self) -> Result<Vec<BootstrapSession>> {
        let now = now_rfc3339();
        let rows = sqlx::query_as::<_, BootstrapSession>(
            "SELECT * FROM bootstrap_sessions \
             WHERE expires_at < ? AND status IN ('pending', 'active')",
        )
        .bind(now)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    pub async fn get_orphaned_bootstrap_sessions(&self) -> Result<Vec<BootstrapSession>> {
        let completed = sqlx::query_as::<_, BootstrapSession>(
            "SELECT * FROM bootstrap_sessions WHERE status = 'completed'",
        )
        .fetch_all(self.pool())
        .await?;

        let mut orphaned = Vec::new();
        for session in completed {
            let resolved = self
                .get_account_by_identity(&session.username, &session.hostname)
                .await?;
            if resolved.is_none() {
                orphaned.push(session);
            }
        }
        Ok(orphaned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;

    async fn test_db() -> Database {
        Database::connect("sqlite::memory:", &PoolConfig::default())
            .await
            .expect("connect")
    }

    #[tokio::test]
    async fn create_and_fetch_account_round_trips() {
        let db = test_db().await;
        let account = db
            .create_account("deploy", "web01", Some("edge"), Some("prod,web"))
            .await
            .expect("create");
        assert_eq!(account.username, "deploy");
        assert_eq!(account.serial, 0);
        assert!(account.is_active);

        let fetched = db
            .get_account_by_identity("deploy", "web01")
            .await
            .expect("fetch")
            .expect("present");
        assert_eq!(fetched.id, account.id);
        assert_eq!(fetched.label.as_deref(), Some("edge"));
    }

    #[tokio::test]
    async fn duplicate_account_identity_is_rejected() {
        let db = test_db().await;
        db.create_account("deploy", "web01", None, None)
            .await
            .expect("first insert");
        let second = db.create_account("deploy", "web01", None, None).await;
        assert!(second.is_err());
    }

    #[tokio::test]
    async fn rotate_system_key_advances_dense_serial_and_keeps_one_active() {
        let db = test_db().await;
        let first = db.rotate_system_key("pub-1", "priv-1").await.expect("rotate 1");
        assert_eq!(first, 1);
        let second = db.rotate_system_key("pub-2", "priv-2").await.expect("rotate 2");
        assert_eq!(second, 2);

        let active = db.get_active_system_key().await.expect("query").expect("present");
        assert_eq!(active.serial, 2);

        let stale = db
            .get_system_key_by_serial(1)
            .await
            .expect("query")
            .expect("retained");
        assert!(!stale.is_active);
    }

    #[tokio::test]
    async fn assign_and_list_account_keys_sorted_by_comment() {
        let db = test_db().await;
        let account = db.create_account("deploy", "web01", None, None).await.expect("account");
        let zebra = db
            .create_public_key("ssh-ed25519", "AAAA", "zebra", false, None)
            .await
            .expect("key");
        let alpha = db
            .create_public_key("ssh-ed25519", "AAAA", "alpha", false, None)
            .await
            .expect("key");
        db.assign_key(account.id, zebra.id).await.expect("assign");
        db.assign_key(account.id, alpha.id).await.expect("assign");

        let keys = db.list_account_keys(account.id).await.expect("list");
        let comments: Vec<&str> = keys.iter().map(|k| k.comment.as_str()).collect();
        assert_eq!(comments, vec!["alpha", "zebra"]);
    }

    #[tokio::test]
    async fn orphaned_bootstrap_sessions_are_detected() {
        let db = test_db().await;
        let session = BootstrapSession {
            id: "sess-1".into(),
            username: "deploy".into(),
            hostname: "web01".into(),
            label: None,
            tags: None,
            temp_public_key: "temp-pub".into(),
            temp_private_key: "temp-priv".into(),
            expires_at: now_rfc3339(),
            status: "completed".into(),
        };
        db.save_bootstrap_session(&session).await.expect("save");

        let orphaned = db.get_orphaned_bootstrap_sessions().await.expect("query");
        assert_eq!(orphaned.len(), 1);
        assert_eq!(orphaned[0].id, "sess-1");

        db.create_account("deploy", "web01", None, None).await.expect("account");
        let orphaned_after = db.get_orphaned_bootstrap_sessions().await.expect("query");
        assert!(orphaned_after.is_empty());
    }
}
