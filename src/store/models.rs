//! Row types returned by the repository layer.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Account {
    pub id: i64,
    pub username: String,
    pub hostname: String,
    pub label: Option<String>,
    pub tags: Option<String>,
    pub serial: i64,
    pub is_active: bool,
    pub is_dirty: bool,
}

impl Account {
    pub fn identifier(&self) -> String {
        format!("{}@{}", self.username, self.hostname)
    }

    pub fn tag_list(&self) -> Vec<String> {
        self.tags
            .as_deref()
            .unwrap_or("")
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct PublicKey {
    pub id: i64,
    pub algorithm: String,
    pub key_data: String,
    pub comment: String,
    pub is_global: bool,
    pub expires_at: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct AccountKey {
    pub account_id: i64,
    pub key_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct SystemKey {
    pub id: i64,
    pub serial: i64,
    pub public_key: String,
    pub private_key: String,
    pub is_active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct KnownHost {
    pub hostname: String,
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct AuditLogEntry {
    pub id: i64,
    pub timestamp: String,
    pub username: Option<String>,
    pub action: String,
    pub details: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BootstrapStatus {
    Pending,
    Completed,
    Expired,
    Failed,
}

impl BootstrapStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BootstrapStatus::Pending => "pending",
            BootstrapStatus::Completed => "completed",
            BootstrapStatus::Expired => "expired",
            BootstrapStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(BootstrapStatus::Pending),
            "completed" => Some(BootstrapStatus::Completed),
            "expired" => Some(BootstrapStatus::Expired),
            "failed" => Some(BootstrapStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct BootstrapSession {
    pub id: String,
    pub username: String,
    pub hostname: String,
    pub label: Option<String>,
    pub tags: Option<String>,
    pub temp_public_key: String,
    pub temp_private_key: String,
    pub expires_at: String,
    pub status: String,
}

impl BootstrapSession {
    pub fn status(&self) -> Option<BootstrapStatus> {
        BootstrapStatus::parse(&self.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_list_splits_and_trims() {
        let account = Account {
            id: 1,
            username: "deploy".into(),
            hostname: "web01".into(),
            label: None,
            tags: Some("prod, web , east".into()),
            serial: 0,
            is_active: true,
            is_dirty: false,
        };
        assert_eq!(account.tag_list(), vec!["prod", "web", "east"]);
    }

    #[test]
    fn tag_list_empty_when_unset() {
        let account = Account {
            id: 1,
            username: "deploy".into(),
            hostname: "web01".into(),
            label: None,
            tags: None,
            serial: 0,
            is_active: true,
            is_dirty: false,
        };
        assert!(account.tag_list().is_empty());
    }

    #[test]
    fn bootstrap_status_round_trips() {
        for s in [
            BootstrapStatus::Pending,
            BootstrapStatus::Completed,
            BootstrapStatus::Expired,
            BootstrapStatus::Failed,
        ] {
            assert_eq!(BootstrapStatus::parse(s.as_str()), Some(s));
        }
    }
}
