//! SSH Target Configuration

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::error::SshError;

/// Remote host a session logs into
#[derive(Clone, Serialize, Deserialize)]
pub struct SshTarget {
    /// Remote host address
    pub host: String,

    /// SSH port (default: 22)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Username for authentication
    pub username: String,

    /// Opaque authenticator
    pub credential: Credential,
}

impl SshTarget {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        credential: Credential,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
            credential,
        }
    }

    /// `host:port`, bracketing IPv6 literals
    pub fn addr(&self) -> String {
        join_host_port(&self.host, self.port)
    }
}

// Credentials never end up in logs
impl fmt::Debug for SshTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshTarget")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("credential", &self.credential.kind())
            .finish()
    }
}

/// Authentication methods supported
#[derive(Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Credential {
    /// Password authentication
    Password { password: String },

    /// Public key authentication from in-memory key material
    Key {
        /// Private key text (OpenSSH or PEM)
        private_key: String,
        /// Optional passphrase for encrypted keys
        #[serde(default, skip_serializing_if = "Option::is_none")]
        passphrase: Option<String>,
    },
}

impl Credential {
    pub fn password(password: impl Into<String>) -> Self {
        Self::Password {
            password: password.into(),
        }
    }

    pub fn key(private_key: impl Into<String>, passphrase: Option<String>) -> Self {
        Self::Key {
            private_key: private_key.into(),
            passphrase,
        }
    }

    /// Read key material from a file on disk
    pub async fn key_from_file(
        path: impl AsRef<Path>,
        passphrase: Option<String>,
    ) -> Result<Self, SshError> {
        let private_key = tokio::fs::read_to_string(path.as_ref()).await.map_err(|e| {
            SshError::Key(format!(
                "Failed to read private key {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Ok(Self::key(private_key, passphrase))
    }

    /// Short name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            Credential::Password { .. } => "password",
            Credential::Key { .. } => "key",
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Credential::{}(<redacted>)", self.kind())
    }
}

fn default_port() -> u16 {
    22
}

/// Join host and port the way socket addresses are written
pub fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}
