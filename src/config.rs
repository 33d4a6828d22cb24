//! Ambient configuration: DB pool tuning from the environment, and the
//! on-disk YAML config file lookup.
//!
//! Grounded in the teacher's `get_data_dir()` (env var first, then a
//! well-known directory, then a local fallback) and its `#[arg(env = "...")]`
//! CLI fields. Full config-file schema validation and hot reload are out of
//! scope (spec.md Non-goals); only resolution and pool-tuning precedence are
//! implemented here.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Database connection pool tuning, sourced from environment variables.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_open_conns: u32,
    pub max_idle_conns: u32,
    pub conn_max_lifetime: Option<Duration>,
    pub conn_max_idle_time: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_open_conns: 10,
            max_idle_conns: 5,
            conn_max_lifetime: None,
            conn_max_idle_time: None,
        }
    }
}

impl PoolConfig {
    /// Read from `KEYMASTER_DB_MAX_OPEN_CONNS`, `KEYMASTER_DB_MAX_IDLE_CONNS`,
    /// `KEYMASTER_DB_CONN_MAX_LIFETIME_SECONDS`, `KEYMASTER_DB_CONN_MAX_IDLE_SECONDS`.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(v) = env_u32("KEYMASTER_DB_MAX_OPEN_CONNS") {
            cfg.max_open_conns = v;
        }
        if let Some(v) = env_u32("KEYMASTER_DB_MAX_IDLE_CONNS") {
            cfg.max_idle_conns = v;
        }
        if let Some(v) = env_u64("KEYMASTER_DB_CONN_MAX_LIFETIME_SECONDS") {
            cfg.conn_max_lifetime = Some(Duration::from_secs(v));
        }
        if let Some(v) = env_u64("KEYMASTER_DB_CONN_MAX_IDLE_SECONDS") {
            cfg.conn_max_idle_time = Some(Duration::from_secs(v));
        }
        cfg
    }
}

fn env_u32(key: &str) -> Option<u32> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

/// On-disk settings, loaded from YAML. Every field has a sane default so a
/// missing or partially-specified file never blocks startup.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FileConfig {
    pub dsn: Option<String>,
    pub default_fan_out: Option<usize>,
    pub bootstrap_session_ttl_minutes: Option<u64>,
}

/// Resolve the config file path: user config dir first, then `/etc/keymaster`,
/// file name `keymaster.yaml`.
pub fn resolve_config_path() -> Option<PathBuf> {
    if let Some(dir) = dirs::config_dir() {
        let candidate = dir.join("keymaster").join("keymaster.yaml");
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    let etc = PathBuf::from("/etc/keymaster/keymaster.yaml");
    if etc.is_file() {
        return Some(etc);
    }
    None
}

/// Load the file config, if present. Absence is not an error: every caller
/// treats `FileConfig::default()` as a perfectly valid configuration.
pub fn load_file_config() -> FileConfig {
    match resolve_config_path() {
        Some(path) => match std::fs::read_to_string(&path) {
            Ok(contents) => serde_yaml::from_str(&contents).unwrap_or_default(),
            Err(_) => FileConfig::default(),
        },
        None => FileConfig::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_config_defaults() {
        let cfg = PoolConfig::default();
        assert_eq!(cfg.max_open_conns, 10);
        assert_eq!(cfg.max_idle_conns, 5);
    }

    #[test]
    fn file_config_defaults_are_empty() {
        let cfg = FileConfig::default();
        assert!(cfg.dsn.is_none());
        assert!(cfg.default_fan_out.is_none());
    }
}
