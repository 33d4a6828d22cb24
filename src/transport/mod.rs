//! SSH/SFTP transport (component C).
//!
//! `Transport` is a trait so the deployment and bootstrap engines can run
//! against an in-memory mock in tests, the same way the teacher's
//! `DeploymentExecutor` is exercised against its SQLite pool without a live
//! Vector agent. `RusshTransport` is the production implementation; see
//! `russh_transport.rs`.

pub mod russh_transport;

use async_trait::async_trait;

use crate::error::Result;

/// What the core needs from an open SSH session to one host.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Reads the remote `authorized_keys` file. An absent file is not an
    /// error; it returns empty content.
    async fn get_authorized_keys(&mut self) -> Result<Vec<u8>>;

    /// Writes `content` to a sibling temporary path and renames it into
    /// place atomically, preserving mode `0600` and owner.
    async fn deploy_authorized_keys(&mut self, content: &[u8]) -> Result<()>;

    /// Releases the session. Called on every exit path.
    async fn close(&mut self) -> Result<()>;
}

/// Builds sessions to hosts, given a private key and a known-hosts lookup.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Opens a session authenticating with the active system key.
    async fn connect(&self, hostname: &str, username: &str) -> Result<Box<dyn Transport>>;

    /// Opens a session authenticating with an explicit private key instead
    /// of the active system key. Used by the bootstrap engine to connect
    /// with a session's one-time temporary key, which is the only key
    /// present on a host's `authorized_keys` before the final deploy.
    async fn connect_with_key(
        &self,
        hostname: &str,
        username: &str,
        private_key_pem: &str,
    ) -> Result<Box<dyn Transport>>;

    /// Unauthenticated handshake that returns the presented host key line
    /// without persisting anything or mutating state.
    async fn fetch_host_key(&self, hostname: &str) -> Result<String>;
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    /// In-memory stand-in used by the deployment/bootstrap engine tests.
    #[derive(Clone, Default)]
    pub struct MockTransport {
        pub content: Arc<Mutex<Vec<u8>>>,
        pub closed: Arc<Mutex<bool>>,
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn get_authorized_keys(&mut self) -> Result<Vec<u8>> {
            Ok(self.content.lock().unwrap().clone())
        }

        async fn deploy_authorized_keys(&mut self, content: &[u8]) -> Result<()> {
            *self.content.lock().unwrap() = content.to_vec();
            Ok(())
        }

        async fn close(&mut self) -> Result<()> {
            *self.closed.lock().unwrap() = true;
            Ok(())
        }
    }

    #[derive(Clone, Default)]
    pub struct MockTransportFactory {
        pub hosts: Arc<Mutex<HashMap<String, MockTransport>>>,
        pub known_host_keys: Arc<Mutex<HashMap<String, String>>>,
    }

    #[async_trait]
    impl TransportFactory for MockTransportFactory {
        async fn connect(&self, hostname: &str, _username: &str) -> Result<Box<dyn Transport>> {
            let mut hosts = self.hosts.lock().unwrap();
            let transport = hosts.entry(hostname.to_string()).or_default().clone();
            Ok(Box::new(transport))
        }

        async fn connect_with_key(
            &self,
            hostname: &str,
            _username: &str,
            _private_key_pem: &str,
        ) -> Result<Box<dyn Transport>> {
            // The mock doesn't model authentication, so connecting with an
            // explicit key behaves identically to the active-system-key path.
            let mut hosts = self.hosts.lock().unwrap();
            let transport = hosts.entry(hostname.to_string()).or_default().clone();
            Ok(Box::new(transport))
        }

        async fn fetch_host_key(&self, hostname: &str) -> Result<String> {
            self.known_host_keys
                .lock()
                .unwrap()
                .get(hostname)
                .cloned()
                .ok_or_else(|| {
                    crate::error::KeymasterError::TransportError(format!(
                        "no host key for {hostname}"
                    ))
                })
        }
    }
}
