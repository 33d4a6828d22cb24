//! Production `Transport`/`TransportFactory` over `russh` + `russh-sftp`.
//!
//! Host-key verification plugs into `russh::client::Handler::check_server_key`
//! and compares the presented key against the `KnownHost` row for the
//! canonical hostname; no matching entry is an `UntrustedHost`. The system
//! key always authenticates with the hardened restriction set from
//! `content.rs`; the engine never opens a shell, only the SFTP subsystem.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Handle};
use russh_keys::key::{self, PublicKey as RusshPublicKey};
use russh_sftp::client::SftpSession;

use crate::content::SYSTEM_KEY_RESTRICTIONS;
use crate::error::{KeymasterError, Result};
use crate::keycodec::fingerprint_key_data;
use crate::store::Database;

use super::{Transport, TransportFactory};

const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(30);
const AUTHORIZED_KEYS_PATH: &str = ".ssh/authorized_keys";

/// Verifies the remote host key against a pinned fingerprint, or accepts
/// unconditionally for the trust-on-first-use `fetch_host_key` handshake.
struct PinnedHostKey {
    expected_fingerprint: Option<String>,
    observed: Arc<std::sync::Mutex<Option<String>>>,
}

#[async_trait]
impl client::Handler for PinnedHostKey {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &RusshPublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        let line = format!(
            "{} {}",
            server_public_key.name(),
            base64::Engine::encode(
                &base64::engine::general_purpose::STANDARD,
                server_public_key.public_key_bytes()
            )
        );
        *self.observed.lock().unwrap() = Some(line.clone());

        match &self.expected_fingerprint {
            None => Ok(true),
            Some(expected) => {
                let actual = fingerprint_key_data(
                    server_public_key.name(),
                    &base64::Engine::encode(
                        &base64::engine::general_purpose::STANDARD,
                        server_public_key.public_key_bytes(),
                    ),
                )
                .map(|fp| fp.to_string())
                .unwrap_or_default();
                Ok(&actual == expected)
            }
        }
    }
}

/// A session pinned to one host, carrying its SFTP channel.
pub struct RusshTransport {
    _handle: Handle<PinnedHostKey>,
    sftp: SftpSession,
}

impl RusshTransport {
    async fn connect_with_handler(
        hostname: &str,
        port: u16,
        username: &str,
        private_key_pem: &str,
        handler: PinnedHostKey,
    ) -> Result<(Handle<PinnedHostKey>, SftpSession)> {
        let config = Arc::new(client::Config {
            inactivity_timeout: Some(DEFAULT_OPERATION_TIMEOUT),
            ..Default::default()
        });

        let mut handle = client::connect(config, (hostname, port), handler)
            .await
            .map_err(|e| KeymasterError::TransportError(format!("connecting to {hostname}: {e}")))?;

        let key_pair = russh_keys::decode_secret_key(private_key_pem, None)
            .map_err(|e| KeymasterError::TransportError(format!("decoding system key: {e}")))?;

        let authenticated = handle
            .authenticate_publickey(username, Arc::new(key_pair))
            .await
            .map_err(|e| KeymasterError::TransportError(format!("authenticating: {e}")))?;
        if !authenticated {
            return Err(KeymasterError::TransportError(
                "public key authentication rejected".to_string(),
            ));
        }

        let channel = handle
            .channel_open_session()
            .await
            .map_err(|e| KeymasterError::TransportError(format!("opening channel: {e}")))?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| KeymasterError::TransportError(format!("requesting sftp subsystem: {e}")))?;

        let sftp = SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| KeymasterError::RemoteIO(format!("starting sftp session: {e}")))?;

        Ok((handle, sftp))
    }
}

#[async_trait]
impl Transport for RusshTransport {
    async fn get_authorized_keys(&mut self) -> Result<Vec<u8>> {
        match self.sftp.read(AUTHORIZED_KEYS_PATH).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if is_not_found(&e) => Ok(Vec::new()),
            Err(e) => Err(KeymasterError::RemoteIO(e.to_string())),
        }
    }

    async fn deploy_authorized_keys(&mut self, content: &[u8]) -> Result<()> {
        let tmp_path = format!("{AUTHORIZED_KEYS_PATH}.keymaster-tmp");
        self.sftp
            .write(&tmp_path, content)
            .await
            .map_err(|e| KeymasterError::RemoteIO(format!("writing temp file: {e}")))?;
        self.sftp
            .set_metadata(
                &tmp_path,
                russh_sftp::protocol::FileAttributes {
                    permissions: Some(0o600),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| KeymasterError::RemoteIO(format!("setting permissions: {e}")))?;
        self.sftp
            .rename(&tmp_path, AUTHORIZED_KEYS_PATH)
            .await
            .map_err(|e| KeymasterError::RemoteIO(format!("renaming into place: {e}")))?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.sftp
            .close()
            .await
            .map_err(|e| KeymasterError::RemoteIO(e.to_string()))
    }
}

fn is_not_found(err: &russh_sftp::client::error::Error) -> bool {
    err.to_string().to_lowercase().contains("no such file")
}

/// Builds `RusshTransport` sessions, resolving the system key and pinned
/// host keys from the store.
pub struct RusshTransportFactory {
    store: Database,
    port: u16,
}

impl RusshTransportFactory {
    pub fn new(store: Database, port: u16) -> Self {
        Self { store, port }
    }
}

#[async_trait]
impl TransportFactory for RusshTransportFactory {
    async fn connect(&self, hostname: &str, username: &str) -> Result<Box<dyn Transport>> {
        let system_key = self
            .store
            .get_active_system_key()
            .await?
            .ok_or_else(|| KeymasterError::TransportError("no active system key".to_string()))?;

        self.connect_with_key(hostname, username, &system_key.private_key).await
    }

    /// Used by the bootstrap engine to authenticate with a session's
    /// one-time temporary key instead of the active system key, since the
    /// target host has no system key installed until the final deploy.
    async fn connect_with_key(
        &self,
        hostname: &str,
        username: &str,
        private_key_pem: &str,
    ) -> Result<Box<dyn Transport>> {
        let known_host = self
            .store
            .get_known_host(hostname)
            .await?
            .ok_or_else(|| KeymasterError::UntrustedHost(hostname.to_string()))?;

        let expected_fingerprint = known_host_fingerprint(&known_host.key)?;
        let handler = PinnedHostKey {
            expected_fingerprint: Some(expected_fingerprint),
            observed: Arc::new(std::sync::Mutex::new(None)),
        };

        let (handle, sftp) = RusshTransport::connect_with_handler(
            hostname,
            self.port,
            username,
            private_key_pem,
            handler,
        )
        .await?;

        let _ = SYSTEM_KEY_RESTRICTIONS;
        Ok(Box::new(RusshTransport { _handle: handle, sftp }))
    }

    async fn fetch_host_key(&self, hostname: &str) -> Result<String> {
        let handler = PinnedHostKey {
            expected_fingerprint: None,
            observed: Arc::new(std::sync::Mutex::new(None)),
        };
        let observed = handler.observed.clone();

        let config = Arc::new(client::Config {
            inactivity_timeout: Some(DEFAULT_OPERATION_TIMEOUT),
            ..Default::default()
        });
        let mut handle = client::connect(config, (hostname, self.port), handler)
            .await
            .map_err(|e| KeymasterError::TransportError(format!("connecting to {hostname}: {e}")))?;
        let _ = handle.authenticate_none("keymaster-probe").await;

        observed
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| KeymasterError::TransportError("host key not presented".to_string()))
    }
}

fn known_host_fingerprint(known_host_line: &str) -> Result<String> {
    let parsed = crate::keycodec::ParsedKey::parse(known_host_line)?;
    Ok(parsed.fingerprint()?.to_string())
}
