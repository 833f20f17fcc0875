//! SSH Client implementation using russh

use std::sync::Arc;

use russh::client::{self, Handle};
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::PublicKey;
use tracing::{debug, info, warn};

use super::config::{Credential, SshTarget};
use super::error::SshError;
use crate::config::EngineConfig;

/// Dials and authenticates one SSH connection
pub struct SshClient {
    target: SshTarget,
    config: EngineConfig,
}

impl SshClient {
    pub fn new(target: SshTarget, config: EngineConfig) -> Self {
        Self { target, config }
    }

    /// Connect to the SSH server and return the authenticated handle
    pub async fn connect(self) -> Result<Handle<ClientHandler>, SshError> {
        let addr = self.target.addr();

        info!("Connecting to SSH server at {}", addr);

        let socket_addr = tokio::net::lookup_host(addr.as_str())
            .await
            .map_err(|e| SshError::DialFailed(format!("Failed to resolve {}: {}", addr, e)))?
            .next()
            .ok_or_else(|| SshError::DialFailed(format!("No address found for {}", addr)))?;

        let ssh_config = client::Config {
            inactivity_timeout: None,
            keepalive_interval: self.config.ssh_keepalive_interval(),
            keepalive_max: self.config.ssh_keepalive_max,
            ..Default::default()
        };

        let handler = ClientHandler::new(self.target.host.clone(), self.target.port);
        let timeout = self.config.connect_timeout();

        let mut handle = tokio::time::timeout(
            timeout,
            client::connect(Arc::new(ssh_config), socket_addr, handler),
        )
        .await
        .map_err(|_| SshError::Timeout(format!("Connection to {} timed out", addr)))?
        .map_err(|e| SshError::DialFailed(format!("{}: {}", addr, e)))?;

        debug!("SSH handshake completed with {}", addr);

        let authenticated =
            match tokio::time::timeout(timeout, self.authenticate(&mut handle)).await {
                Ok(result) => result,
                Err(_) => Err(SshError::Timeout(format!(
                    "Authentication with {} timed out",
                    addr
                ))),
            };

        let authenticated = match authenticated {
            Ok(result) => result,
            Err(e) => {
                close_handle(&handle).await;
                return Err(e);
            }
        };

        if !authenticated.success() {
            close_handle(&handle).await;
            return Err(SshError::AuthFailed(format!(
                "{} authentication rejected by server for user {}",
                self.target.credential.kind(),
                self.target.username
            )));
        }

        info!(
            "SSH authentication successful for {}@{}",
            self.target.username, addr
        );

        Ok(handle)
    }

    async fn authenticate(
        &self,
        handle: &mut Handle<ClientHandler>,
    ) -> Result<client::AuthResult, SshError> {
        let username = self.target.username.as_str();
        match &self.target.credential {
            Credential::Password { password } => handle
                .authenticate_password(username, password)
                .await
                .map_err(|e| SshError::AuthFailed(e.to_string())),
            Credential::Key {
                private_key,
                passphrase,
            } => {
                let key = russh::keys::decode_secret_key(private_key, passphrase.as_deref())
                    .map_err(|e| SshError::Key(e.to_string()))?;
                let key_with_hash = PrivateKeyWithHashAlg::new(Arc::new(key), None);

                handle
                    .authenticate_publickey(username, key_with_hash)
                    .await
                    .map_err(|e| SshError::AuthFailed(e.to_string()))
            }
        }
    }
}

/// Disconnect a handle that never made it to a session
async fn close_handle(handle: &Handle<ClientHandler>) {
    let _ = handle
        .disconnect(russh::Disconnect::ByApplication, "Authentication failed", "en")
        .await;
}

/// Client handler for russh callbacks
///
/// Host key policy is accept-any: there is no known_hosts check. This matches
/// the tunnel manager's established behavior, but it leaves sessions open to
/// man-in-the-middle attacks and is not what a hardened client would do.
pub struct ClientHandler {
    host: String,
    port: u16,
}

impl ClientHandler {
    pub fn new(host: String, port: u16) -> Self {
        Self { host, port }
    }
}

impl client::Handler for ClientHandler {
    type Error = SshError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        warn!(
            "Accepting unverified host key for {}:{} ({})",
            self.host,
            self.port,
            server_public_key.algorithm().as_str()
        );
        Ok(true)
    }
}
