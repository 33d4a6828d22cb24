//! Facade (component H): the stable, UI-independent surface consumed by
//! front-ends.
//!
//! Grounded in the teacher's `cli/mod.rs` `CliClient`-calls-API shape,
//! collapsed to direct in-process calls — no HTTP hop, since this binary has
//! no server/sidecar split. `ParallelRun` generalizes the teacher's
//! per-agent `tokio::spawn` + `Vec<JoinHandle>` fan-out
//! (`deployment/mod.rs::execute_basic`, `health/mod.rs::check_all_agents`)
//! into a bounded semaphore plus a buffered `mpsc` channel sized to the
//! batch, per spec.md §5's concurrency model.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};
use tracing::warn;

use crate::bootstrap::BootstrapEngine;
use crate::deploy::{
    AuditResult, BulkDecommissionCounts, DecommissionMode, DecommissionOptions, DeployEngine,
    DeployOutcome, DriftReport,
};
use crate::error::Result;
use crate::rotation::RotationEngine;
use crate::store::models::{Account, PublicKey};
use crate::store::Database;

pub const DEFAULT_PARALLEL_CAP: usize = 8;

/// Cooperative cancellation signal checked at every suspension point inside
/// a `ParallelRun` task (connect, remote read/write, DB call).
#[derive(Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

pub struct Facade {
    store: Database,
    deploy: DeployEngine,
    bootstrap: BootstrapEngine,
    rotation: RotationEngine,
    parallel_cap: usize,
}

impl Facade {
    pub fn new(store: Database, deploy: DeployEngine, bootstrap: BootstrapEngine, rotation: RotationEngine) -> Self {
        Self {
            store,
            deploy,
            bootstrap,
            rotation,
            parallel_cap: DEFAULT_PARALLEL_CAP,
        }
    }

    pub fn with_parallel_cap(mut self, cap: usize) -> Self {
        self.parallel_cap = cap;
        self
    }

    pub async fn deploy(&self, account: &Account, force: bool) -> Result<DeployOutcome> {
        self.deploy.deploy_for_account(account, force).await
    }

    pub async fn audit(&self, account: &Account, strict: bool) -> Result<AuditResult> {
        if strict {
            self.deploy.audit_strict(account).await
        } else {
            self.deploy.audit_serial(account).await
        }
    }

    pub async fn analyze_drift(&self, account: &Account) -> Result<DriftReport> {
        self.deploy.analyze_drift(account).await
    }

    pub async fn trust_host(&self, hostname: &str, save: bool) -> Result<String> {
        self.deploy.trust_host(hostname, save).await
    }

    pub async fn decommission(
        &self,
        account: &Account,
        mode: DecommissionMode,
        opts: DecommissionOptions,
    ) -> Result<()> {
        self.deploy.decommission_account(account, mode, opts).await
    }

    pub async fn decommission_bulk(
        &self,
        accounts: &[Account],
        mode: DecommissionMode,
        opts: DecommissionOptions,
    ) -> BulkDecommissionCounts {
        self.deploy.decommission_bulk(accounts, mode, opts).await
    }

    pub async fn backup<W: std::io::Write>(&self, writer: W) -> Result<()> {
        self.rotation.backup(writer).await
    }

    pub async fn restore<R: std::io::Read>(&self, reader: R, full: bool) -> Result<()> {
        if full {
            self.rotation.restore(reader).await
        } else {
            self.rotation.integrate(reader).await
        }
    }

    pub async fn migrate(&self, target_dsn: &str) -> Result<()> {
        self.rotation.migrate(target_dsn).await
    }

    pub async fn rotate_key(&self, passphrase: Option<&str>) -> Result<i64> {
        self.rotation.rotate_system_key(passphrase).await
    }

    /// Flips an account's `is_active` flag without touching the remote host
    /// or the database row otherwise; an inactive account is excluded from
    /// global-key application until re-activated.
    pub async fn toggle_account_status(&self, account: &Account) -> Result<bool> {
        let new_active = !account.is_active;
        self.store.set_account_active(account.id, new_active).await?;
        self.store
            .append_audit(
                Some(&account.username),
                "TOGGLE_ACCOUNT_STATUS",
                Some(&format!("account={}, active={}", account.identifier(), new_active)),
            )
            .await?;
        Ok(new_active)
    }

    pub async fn run_db_maintenance(&self, skip_integrity: bool) -> Result<()> {
        if !skip_integrity {
            self.store.check_integrity().await?;
        }
        self.store.run_maintenance().await
    }

    pub fn bootstrap_engine(&self) -> &BootstrapEngine {
        &self.bootstrap
    }

    pub async fn list_active_accounts(&self) -> Result<Vec<Account>> {
        self.store.list_accounts(true).await
    }

    pub async fn list_accounts_by_tag(&self, key: &str, value: &str) -> Result<Vec<Account>> {
        self.store.list_accounts_by_tag(key, value).await
    }

    pub async fn export_ssh_client_config(&self) -> Result<String> {
        let accounts = self.store.list_accounts(true).await?;
        let mut out = String::new();
        for account in accounts {
            out.push_str(&format!(
                "Host {}\n    HostName {}\n    User {}\n\n",
                account.label.clone().unwrap_or_else(|| account.hostname.clone()),
                account.hostname,
                account.username,
            ));
        }
        Ok(out)
    }

    /// Consumes a plain-text stream, one `authorized_keys` line per line,
    /// skipping blanks and `#` comments, skipping empty or duplicate
    /// comments, otherwise adding the key as a new, non-global `PublicKey`.
    pub async fn import_authorized_keys(&self, text: &str) -> Result<Vec<PublicKey>> {
        let mut imported = Vec::new();
        for line in text.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let parsed = match crate::keycodec::ParsedKey::parse(trimmed) {
                Ok(p) => p,
                Err(e) => {
                    warn!(line = trimmed, error = %e, "skipping unparseable import line");
                    continue;
                }
            };
            if parsed.comment.is_empty() {
                continue;
            }
            if self.store.get_public_key_by_comment(&parsed.comment).await?.is_some() {
                continue;
            }
            let key = self
                .store
                .create_public_key(&parsed.algorithm, &parsed.key_data, &parsed.comment, false, None)
                .await?;
            self.store
                .append_audit(None, "IMPORT_KEY", Some(&parsed.comment))
                .await?;
            imported.push(key);
        }
        Ok(imported)
    }

    /// Resolves a string to an account by, in order: numeric id, `user@host`
    /// (case-insensitive), then label (case-insensitive).
    pub async fn find_account_by_identifier(&self, identifier: &str) -> Result<Option<Account>> {
        if let Ok(id) = identifier.parse::<i64>() {
            if let Some(account) = self.store.get_account(id).await? {
                return Ok(Some(account));
            }
        }

        if let Some((user, host)) = identifier.split_once('@') {
            let accounts = self.store.list_accounts(false).await?;
            if let Some(account) = accounts.into_iter().find(|a| {
                a.username.eq_ignore_ascii_case(user) && a.hostname.eq_ignore_ascii_case(host)
            }) {
                return Ok(Some(account));
            }
        }

        let accounts = self.store.list_accounts(false).await?;
        Ok(accounts.into_iter().find(|a| {
            a.label
                .as_deref()
                .map(|l| l.eq_ignore_ascii_case(identifier))
                .unwrap_or(false)
        }))
    }

    /// Launches one task per account, bounded by `parallel_cap` concurrent
    /// in-flight tasks, and collects every result through a channel sized
    /// to the batch. Returns only after every task has reported; results
    /// are unordered.
    pub async fn parallel_run<T, F, Fut>(&self, accounts: Vec<Account>, cancel: CancellationToken, task: F) -> Vec<T>
    where
        T: Send + 'static,
        F: Fn(Account, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        let semaphore = Arc::new(Semaphore::new(self.parallel_cap.max(1)));
        let task = Arc::new(task);
        let (tx, mut rx) = mpsc::channel::<T>(accounts.len().max(1));

        for account in accounts {
            let semaphore = semaphore.clone();
            let task = task.clone();
            let tx = tx.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore not closed");
                if cancel.is_cancelled() {
                    return;
                }
                let result = task(account, cancel).await;
                let _ = tx.send(result).await;
            });
        }
        drop(tx);

        let mut results = Vec::new();
        while let Some(result) = rx.recv().await {
            results.push(result);
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::BootstrapEngine;
    use crate::config::PoolConfig;
    use crate::deploy::DeployEngine;
    use crate::rotation::RotationEngine;
    use crate::transport::mock::MockTransportFactory;

    async fn seeded_facade() -> Facade {
        let store = Database::connect("sqlite::memory:", &PoolConfig::default()).await.expect("connect");
        store.rotate_system_key("sys-pub", "sys-priv").await.expect("rotate");
        let factory = Arc::new(MockTransportFactory::default());
        let deploy = DeployEngine::new(store.clone(), factory.clone());
        let bootstrap = BootstrapEngine::new(store.clone(), factory);
        let rotation = RotationEngine::new(store.clone());
        Facade::new(store, deploy, bootstrap, rotation)
    }

    #[tokio::test]
    async fn import_authorized_keys_skips_blanks_comments_and_duplicates() {
        let facade = seeded_facade().await;
        let text = "\
# a comment
ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIBbFIY6iamgzm3f20bnMJ5rZVnGZ5JUqMUV6VVN99SAH alice
ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIBbFIY6iamgzm3f20bnMJ5rZVnGZ5JUqMUV6VVN99SAH alice

ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIBbFIY6iamgzm3f20bnMJ5rZVnGZ5JUqMUV6VVN99SAH bob
";
        let imported = facade.import_authorized_keys(text).await.expect("import");
        assert_eq!(imported.len(), 2);
        assert_eq!(imported[0].comment, "alice");
        assert_eq!(imported[1].comment, "bob");
    }

    #[tokio::test]
    async fn find_account_by_identifier_tries_id_then_identity_then_label() {
        let facade = seeded_facade().await;
        let account = facade
            .store
            .create_account("deploy", "web01", Some("edge-1"), None)
            .await
            .expect("account");

        let by_id = facade.find_account_by_identifier(&account.id.to_string()).await.unwrap();
        assert_eq!(by_id.unwrap().id, account.id);

        let by_identity = facade.find_account_by_identifier("DEPLOY@WEB01").await.unwrap();
        assert_eq!(by_identity.unwrap().id, account.id);

        let by_label = facade.find_account_by_identifier("EDGE-1").await.unwrap();
        assert_eq!(by_label.unwrap().id, account.id);
    }

    #[tokio::test]
    async fn toggle_account_status_flips_active_flag() {
        let facade = seeded_facade().await;
        let account = facade.store.create_account("deploy", "web01", None, None).await.unwrap();
        assert!(account.is_active);

        let now_active = facade.toggle_account_status(&account).await.expect("toggle");
        assert!(!now_active);
        let reloaded = facade.store.get_account(account.id).await.unwrap().unwrap();
        assert!(!reloaded.is_active);

        let now_active = facade.toggle_account_status(&reloaded).await.expect("toggle again");
        assert!(now_active);
    }

    #[tokio::test]
    async fn parallel_run_collects_every_result() {
        let facade = seeded_facade().await;
        let accounts = vec![
            facade.store.create_account("a", "h1", None, None).await.unwrap(),
            facade.store.create_account("b", "h2", None, None).await.unwrap(),
            facade.store.create_account("c", "h3", None, None).await.unwrap(),
        ];

        let cancel = CancellationToken::new();
        let results = facade
            .parallel_run(accounts, cancel, |account, _cancel| async move { account.hostname })
            .await;

        let mut hosts = results;
        hosts.sort();
        assert_eq!(hosts, vec!["h1", "h2", "h3"]);
    }
}
