// SPDX-License-Identifier: AGPL-3.0-only
//! Identity model as seen by the gate, and the provider that vouches for it.

use crate::error::AuthError;
use async_trait::async_trait;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use thiserror::Error;
use tracing::warn;

/// Serialized with the same names `as_str` reports to hooks and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LoginMethod {
    #[serde(rename = "password")]
    Password,
    #[serde(rename = "publickey")]
    PublicKey,
    #[serde(rename = "keyboard-interactive")]
    KeyboardInteractive,
    #[serde(rename = "tls-certificate")]
    TlsCertificate,
    #[serde(rename = "tls-certificate+password")]
    TlsCertificateAndPassword,
}

impl LoginMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoginMethod::Password => "password",
            LoginMethod::PublicKey => "publickey",
            LoginMethod::KeyboardInteractive => "keyboard-interactive",
            LoginMethod::TlsCertificate => "tls-certificate",
            LoginMethod::TlsCertificateAndPassword => "tls-certificate+password",
        }
    }
}

impl fmt::Display for LoginMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Storage backend kind behind an identity's home directory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FsProvider {
    #[default]
    Local,
    Crypt,
    S3,
    Gcs,
    AzureBlob,
    Sftp,
}

impl FsProvider {
    /// Remote SFTP backends have nothing to create locally, so the login-time
    /// root check would only open a useless connection.
    pub fn checks_root_path(self) -> bool {
        !matches!(self, FsProvider::Sftp)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FsProvider::Local => "local",
            FsProvider::Crypt => "crypt",
            FsProvider::S3 => "s3",
            FsProvider::Gcs => "gcs",
            FsProvider::AzureBlob => "azure_blob",
            FsProvider::Sftp => "sftp",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualFolder {
    pub virtual_path: String,
    pub mapped_path: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub username: String,
    #[serde(default)]
    pub home_dir: PathBuf,
    #[serde(default)]
    pub uid: u32,
    #[serde(default)]
    pub gid: u32,
    #[serde(default)]
    pub denied_protocols: Vec<String>,
    /// Empty means every login method is allowed.
    #[serde(default)]
    pub allowed_login_methods: Vec<LoginMethod>,
    /// Maximum concurrent sessions, 0 means unlimited.
    #[serde(default)]
    pub max_sessions: usize,
    #[serde(default)]
    pub allowed_ips: Vec<IpNet>,
    #[serde(default)]
    pub denied_ips: Vec<IpNet>,
    #[serde(default)]
    pub virtual_folders: Vec<VirtualFolder>,
    #[serde(default)]
    pub fs_provider: FsProvider,
    #[serde(skip)]
    pub last_login: Option<SystemTime>,
}

impl Identity {
    /// A bare identity carrying only the submitted username, used for audit
    /// records when the provider has nothing better.
    pub fn named(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            ..Default::default()
        }
    }

    pub fn is_protocol_denied(&self, protocol: &str) -> bool {
        self.denied_protocols.iter().any(|p| p == protocol)
    }

    pub fn is_login_method_allowed(&self, method: LoginMethod) -> bool {
        self.allowed_login_methods.is_empty() || self.allowed_login_methods.contains(&method)
    }

    /// Allow rules win over deny rules; with only deny rules configured every
    /// other address is accepted.
    pub fn is_login_from_addr_allowed(&self, remote_addr: &str) -> bool {
        if self.allowed_ips.is_empty() && self.denied_ips.is_empty() {
            return true;
        }
        let ip_str = crate::gate::ip_from_remote_address(remote_addr);
        let Ok(ip) = ip_str.parse::<IpAddr>() else {
            warn!(user = %self.username, remote_addr = %remote_addr, "login allowed for invalid remote address");
            return true;
        };
        if self.allowed_ips.iter().any(|net| net.contains(&ip)) {
            return true;
        }
        if self.denied_ips.iter().any(|net| net.contains(&ip)) {
            return false;
        }
        self.allowed_ips.is_empty()
    }

    pub fn has_overlapped_mapped_paths(&self) -> bool {
        if self.virtual_folders.len() <= 1 {
            return false;
        }
        for (idx, first) in self.virtual_folders.iter().enumerate() {
            for second in &self.virtual_folders[idx + 1..] {
                if first.virtual_path == second.virtual_path {
                    continue;
                }
                if is_mapped_dir_overlapped(&first.mapped_path, &second.mapped_path) {
                    return true;
                }
            }
        }
        false
    }
}

fn is_mapped_dir_overlapped(first: &Path, second: &Path) -> bool {
    first.starts_with(second) || second.starts_with(first)
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    #[error("user {0:?} not found")]
    NotFound(String),
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("{0}")]
    Backend(String),
}

impl From<ProviderError> for AuthError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::NotFound(user) => AuthError::UserNotFound(user),
            ProviderError::InvalidCredentials => AuthError::InvalidCredentials,
            ProviderError::Backend(msg) => AuthError::Provider(msg),
        }
    }
}

/// Persistent identity store. Slow calls are bounded by the provider's own
/// timeouts.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Full credential verification.
    async fn check_credentials(
        &self,
        username: &str,
        password: &str,
        ip: &str,
        protocol: &str,
    ) -> Result<Identity, ProviderError>;

    async fn update_last_login(&self, identity: &Identity) -> Result<(), ProviderError>;
}
