//! Crate-wide error type.
//!
//! Every component boundary (codec, store, transport, engines) returns
//! `Result<T, KeymasterError>`. The front-end (CLI) is the only place that
//! widens into `anyhow::Error`, mirroring how the teacher crate keeps typed
//! errors (`GitStoreError`, `AgentError`, `TapError`) at module boundaries and
//! only reaches for `anyhow` in `main.rs`/`cli/mod.rs`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum KeymasterError {
    #[error("malformed key: {0}")]
    MalformedKey(String),

    #[error("unknown algorithm: {0}")]
    UnknownAlgorithm(String),

    #[error("untrusted host: {0}")]
    UntrustedHost(String),

    #[error("transport error: {0}")]
    TransportError(String),

    #[error("remote I/O error: {0}")]
    RemoteIO(String),

    #[error("failed to generate content: {0}")]
    GenerateContentError(String),

    #[error("persistence error: {0}")]
    PersistError(String),

    #[error("migration {version} failed: {cause}")]
    MigrationFailed { version: String, cause: String },

    #[error("database integrity check failed: {0}")]
    DBCorrupt(String),

    #[error("{entity} not found")]
    NotFound { entity: String },

    #[error("conflict on {entity}")]
    Conflict { entity: String },

    #[error("invalid argument: {0}")]
    InvalidArg(String),

    #[error("operation canceled")]
    Canceled,

    #[error("operation timed out")]
    Timeout,
}

impl From<sqlx::Error> for KeymasterError {
    fn from(e: sqlx::Error) -> Self {
        KeymasterError::PersistError(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, KeymasterError>;
