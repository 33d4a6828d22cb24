//! Deployment engine (component E): per-account deploy, audit, drift
//! analysis, remediation, and decommission.
//!
//! Grounded in the teacher's `DeploymentExecutor` (`deployment/mod.rs`): a
//! struct holding `Database` plus injected collaborators, constructed with
//! `::new(db, ...)`, exposing `async fn` operations that read/write through
//! the repository layer. Generalized here from "deploy config to an HTTP
//! agent" to "render and push an `authorized_keys` file over SSH".

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::content::{build_authorized_keys, normalize_for_audit};
use crate::error::{KeymasterError, Result};
use crate::keycodec::{parse_serial_header, ParsedKey};
use crate::store::models::{Account, PublicKey};
use crate::store::Database;
use crate::transport::TransportFactory;

/// Explicit state machine for one deploy attempt, per spec: a failure in
/// `Connecting` or `Writing` is recoverable and does not advance the
/// account's serial; a failure after `Committed` but before `Reported` is
/// logged as `DEPLOY_INCONSISTENT` and left for the next audit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployState {
    Idle,
    Connecting,
    Writing,
    Committed,
    Reported,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployOutcome {
    pub state: DeployState,
    pub new_serial: Option<i64>,
    pub skipped: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriftSeverity {
    None,
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriftReport {
    pub has_drift: bool,
    pub actual_serial: Option<u64>,
    pub expected_serial: i64,
    pub missing_keymaster_header: bool,
    pub serial_mismatch: bool,
    pub missing_keys: Vec<PublicKey>,
    pub extra_keys: Vec<String>,
    pub classification: DriftSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditResult {
    Match,
    Drift,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecommissionMode {
    Full,
    KeepFile,
    SkipRemote,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DecommissionOptions {
    pub mode_force: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BulkDecommissionCounts {
    pub successful: u32,
    pub failed: u32,
    pub skipped: u32,
}

pub struct DeployEngine {
    store: Database,
    transports: Arc<dyn TransportFactory>,
}

impl DeployEngine {
    pub fn new(store: Database, transports: Arc<dyn TransportFactory>) -> Self {
        Self { store, transports }
    }

    async fn expected_content(&self, account: &Account) -> Result<(i64, String)> {
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
            chrono::Utc::now(),
            &BTreeSet::new(),
        );
        Ok((system_key.serial, content))
    }

    pub async fn deploy_for_account(&self, account: &Account, force: bool) -> Result<DeployOutcome> {
        let (active_serial, content) = self.expected_content(account).await?;

        if !force && account.serial == active_serial && !account.is_dirty {
            self.store
                .append_audit(
                    Some(&account.username),
                    "DEPLOY_SKIPPED",
                    Some(&format!("account={}, serial={}", account.identifier(), active_serial)),
                )
                .await?;
            return Ok(DeployOutcome {
                state: DeployState::Idle,
                new_serial: None,
                skipped: true,
            });
        }

        let mut state = DeployState::Connecting;
        let mut transport = self
            .transports
            .connect(&account.hostname, &account.username)
            .await
            .map_err(|e| {
                warn!(account = %account.identifier(), error = %e, "deploy connect failed");
                e
            })?;

        state = DeployState::Writing;
        let write_result = transport.deploy_authorized_keys(content.as_bytes()).await;
        let _ = transport.close().await;

        if let Err(e) = write_result {
            warn!(account = %account.identifier(), state = ?state, error = %e, "deploy write failed");
            return Err(e);
        }
        state = DeployState::Committed;

        if let Err(e) = self.store.update_account_serial(account.id, active_serial).await {
            warn!(
                account = %account.identifier(),
                "remote commit succeeded but serial update failed; will self-heal on next audit"
            );
            self.store
                .append_audit(
                    Some(&account.username),
                    "DEPLOY_INCONSISTENT",
                    Some(&format!("account={}, error={}", account.identifier(), e)),
                )
                .await?;
            return Err(e);
        }
        state = DeployState::Reported;

        self.store
            .append_audit(
                Some(&account.username),
                "DEPLOY",
                Some(&format!("account={}, new_serial={}", account.identifier(), active_serial)),
            )
            .await?;

        info!(account = %account.identifier(), serial = active_serial, "deployed");
        Ok(DeployOutcome {
            state,
            new_serial: Some(active_serial),
            skipped: false,
        })
    }

    pub async fn audit_strict(&self, account: &Account) -> Result<AuditResult> {
        let (_, expected) = self.expected_content(account).await?;
        let mut transport = self.transports.connect(&account.hostname, &account.username).await?;
        let actual = transport.get_authorized_keys().await?;
        let _ = transport.close().await;

        let actual_text = String::from_utf8_lossy(&actual);
        let result = if normalize_for_audit(&expected) == normalize_for_audit(&actual_text) {
            AuditResult::Match
        } else {
            AuditResult::Drift
        };

        self.store
            .append_audit(Some(&account.username), "AUDIT", Some(&account.identifier()))
            .await?;
        Ok(result)
    }

    pub async fn audit_serial(&self, account: &Account) -> Result<AuditResult> {
        let mut transport = self.transports.connect(&account.hostname, &account.username).await?;
        let actual = transport.get_authorized_keys().await?;
        let _ = transport.close().await;

        let text = String::from_utf8_lossy(&actual);
        let actual_serial = text.lines().find_map(parse_serial_header);

        self.store
            .append_audit(Some(&account.username), "AUDIT", Some(&account.identifier()))
            .await?;

        match actual_serial {
            Some(serial) if serial as i64 == account.serial => Ok(AuditResult::Match),
            _ => Ok(AuditResult::Drift),
        }
    }

    pub async fn analyze_drift(&self, account: &Account) -> Result<DriftReport> {
        let (expected_serial, expected_content) = self.expected_content(account).await?;
        let mut transport = self.transports.connect(&account.hostname, &account.username).await?;
        let actual = transport.get_authorized_keys().await?;
        let _ = transport.close().await;

        let actual_text = String::from_utf8_lossy(&actual).to_string();
        let actual_lines: Vec<&str> = actual_text.lines().collect();
        let actual_serial = actual_lines.first().and_then(|l| parse_serial_header(l));
        let missing_header = actual_serial.is_none();
        let serial_mismatch = actual_serial
            .map(|s| s as i64 != expected_serial)
            .unwrap_or(true);

        let expected_keys: Vec<PublicKey> = {
            let mut global = self.store.list_global_keys().await?;
            let mut account_keys = self.store.list_account_keys(account.id).await?;
            global.append(&mut account_keys);
            global
        };

        let normalize = |algorithm: &str, key_data: &str| format!("{algorithm} {key_data}");
        let expected_fields: BTreeSet<String> = expected_keys
            .iter()
            .map(|k| normalize(&k.algorithm, &k.key_data))
            .collect();

        let actual_parsed: Vec<ParsedKey> = actual_lines
            .iter()
            .skip(1)
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| ParsedKey::parse(l).ok())
            .collect();
        let actual_fields: BTreeSet<String> = actual_parsed
            .iter()
            .map(|k| normalize(&k.algorithm, &k.key_data))
            .collect();

        let missing_keys: Vec<PublicKey> = expected_keys
            .into_iter()
            .filter(|k| !actual_fields.contains(&normalize(&k.algorithm, &k.key_data)))
            .collect();

        let extra_keys: Vec<String> = actual_parsed
            .iter()
            .filter(|k| !expected_fields.contains(&normalize(&k.algorithm, &k.key_data)))
            .filter(|k| k.comment != crate::content::SYSTEM_KEY_COMMENT)
            .map(|k| k.to_line())
            .collect();

        let has_drift = normalize_for_audit(&expected_content) != normalize_for_audit(&actual_text);

        let classification = if missing_header || serial_mismatch {
            DriftSeverity::Critical
        } else if !missing_keys.is_empty() {
            DriftSeverity::Warning
        } else if !extra_keys.is_empty() {
            DriftSeverity::Info
        } else {
            DriftSeverity::None
        };

        Ok(DriftReport {
            has_drift,
            actual_serial,
            expected_serial,
            missing_keymaster_header: missing_header,
            serial_mismatch,
            missing_keys,
            extra_keys,
            classification,
        })
    }

    pub async fn remediate(&self, account: &Account, dry_run: bool) -> Result<Option<DeployOutcome>> {
        let drift = self.analyze_drift(account).await?;
        if !drift.has_drift {
            return Ok(None);
        }
        if dry_run {
            debug!(account = %account.identifier(), "remediation dry run, no changes applied");
            return Ok(None);
        }
        let outcome = self.deploy_for_account(account, true).await?;
        Ok(Some(outcome))
    }

    pub async fn decommission_account(
        &self,
        account: &Account,
        mode: DecommissionMode,
        opts: DecommissionOptions,
    ) -> Result<()> {
        if mode != DecommissionMode::SkipRemote {
            let result = match mode {
                DecommissionMode::Full => {
                    let mut transport =
                        self.transports.connect(&account.hostname, &account.username).await?;
                    let r = transport.deploy_authorized_keys(b"").await;
                    let _ = transport.close().await;
                    r
                }
                DecommissionMode::KeepFile => {
                    let mut transport =
                        self.transports.connect(&account.hostname, &account.username).await?;
                    let remote = match transport.get_authorized_keys().await {
                        Ok(bytes) => bytes,
                        Err(e) => {
                            let _ = transport.close().await;
                            return Err(e);
                        }
                    };
                    let remote_text = String::from_utf8_lossy(&remote).to_string();

                    let mut managed_comments: BTreeSet<String> = BTreeSet::new();
                    for key in self.store.list_global_keys().await? {
                        managed_comments.insert(key.comment);
                    }
                    for key in self.store.list_account_keys(account.id).await? {
                        managed_comments.insert(key.comment);
                    }

                    let stripped = crate::content::strip_keymaster_block(&remote_text, &managed_comments);
                    let mut stripped_bytes = stripped.into_bytes();
                    if !stripped_bytes.is_empty() && !stripped_bytes.ends_with(b"\n") {
                        stripped_bytes.push(b'\n');
                    }

                    let r = transport.deploy_authorized_keys(&stripped_bytes).await;
                    let _ = transport.close().await;
                    r
                }
                DecommissionMode::SkipRemote => unreachable!(),
            };

            if let Err(e) = result {
                if !opts.mode_force {
                    return Err(e);
                }
                warn!(account = %account.identifier(), error = %e, "remote decommission failed, forcing DB removal");
            }
        }

        self.store.delete_account(account.id).await?;
        self.store
            .append_audit(Some(&account.username), "DECOMMISSION", Some(&account.identifier()))
            .await?;
        Ok(())
    }

    pub async fn decommission_bulk(
        &self,
        accounts: &[Account],
        mode: DecommissionMode,
        opts: DecommissionOptions,
    ) -> BulkDecommissionCounts {
        let mut counts = BulkDecommissionCounts::default();
        for account in accounts {
            if mode == DecommissionMode::SkipRemote && !opts.mode_force {
                counts.skipped += 1;
                continue;
            }
            match self.decommission_account(account, mode, opts).await {
                Ok(()) => counts.successful += 1,
                Err(_) => counts.failed += 1,
            }
        }
        counts
    }

    pub async fn trust_host(&self, hostname: &str, save: bool) -> Result<String> {
        let line = self.transports.fetch_host_key(hostname).await?;
        if save {
            self.store.save_known_host(hostname, &line).await?;
            self.store
                .append_audit(None, "TRUST_HOST", Some(hostname))
                .await?;
        }
        Ok(line)
    }
}
