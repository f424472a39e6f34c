// SPDX-License-Identifier: AGPL-3.0-only
//! Identities loaded from a JSON file.

use anyhow::{Context, Result, bail};
use argon2::{Argon2, PasswordHash, PasswordVerifier};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::SystemTime;
use tracing::{info, warn};
use usg_dav_gate::{Identity, IdentityProvider, ProviderError};

#[derive(Debug, Clone, Deserialize)]
struct IdentityEntry {
    #[serde(flatten)]
    identity: Identity,
    /// Compared verbatim.
    #[serde(default)]
    password: Option<String>,
    /// PHC string, `$argon2id$...`.
    #[serde(default)]
    password_hash: Option<String>,
}

enum Secret {
    Plain(String),
    Argon2(String),
    None,
}

pub struct StaticIdentityProvider {
    entries: HashMap<String, (Identity, Secret)>,
    last_logins: Mutex<HashMap<String, SystemTime>>,
}

impl StaticIdentityProvider {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading identities from {}", path.display()))?;
        let provider = Self::from_json(&data)
            .with_context(|| format!("parsing identities from {}", path.display()))?;
        info!(count = provider.len(), path = %path.display(), "loaded identities");
        Ok(provider)
    }

    pub fn from_json(data: &str) -> Result<Self> {
        let raw: Vec<IdentityEntry> = serde_json::from_str(data)?;
        let mut entries = HashMap::with_capacity(raw.len());
        for entry in raw {
            let username = entry.identity.username.clone();
            if username.is_empty() {
                bail!("identity with empty username");
            }
            let secret = match (entry.password, entry.password_hash) {
                (Some(_), Some(_)) => {
                    bail!("identity {username:?} sets both password and password_hash")
                }
                (Some(plain), None) => Secret::Plain(plain),
                (None, Some(hash)) => {
                    PasswordHash::new(&hash)
                        .map_err(|e| anyhow::anyhow!("identity {username:?}: invalid password_hash: {e}"))?;
                    Secret::Argon2(hash)
                }
                (None, None) => {
                    warn!(user = %username, "identity has no password and cannot log in");
                    Secret::None
                }
            };
            if entries
                .insert(username.clone(), (entry.identity, secret))
                .is_some()
            {
                bail!("duplicate identity {username:?}");
            }
        }
        Ok(Self {
            entries,
            last_logins: Mutex::new(HashMap::new()),
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last_login(&self, username: &str) -> Option<SystemTime> {
        self.last_logins.lock().get(username).copied()
    }
}

fn verify_argon2(hash: &str, password: &str) -> bool {
    PasswordHash::new(hash)
        .map(|parsed| {
            Argon2::default()
                .verify_password(password.as_bytes(), &parsed)
                .is_ok()
        })
        .unwrap_or(false)
}

#[async_trait]
impl IdentityProvider for StaticIdentityProvider {
    async fn check_credentials(
        &self,
        username: &str,
        password: &str,
        _ip: &str,
        _protocol: &str,
    ) -> Result<Identity, ProviderError> {
        let Some((identity, secret)) = self.entries.get(username) else {
            return Err(ProviderError::NotFound(username.to_string()));
        };
        let matched = match secret {
            Secret::Plain(expected) => expected == password,
            Secret::Argon2(hash) => {
                let hash = hash.clone();
                let password = password.to_string();
                tokio::task::spawn_blocking(move || verify_argon2(&hash, &password))
                    .await
                    .map_err(|e| ProviderError::Backend(e.to_string()))?
            }
            Secret::None => false,
        };
        if !matched {
            return Err(ProviderError::InvalidCredentials);
        }
        let mut identity = identity.clone();
        identity.last_login = self.last_login(username);
        Ok(identity)
    }

    async fn update_last_login(&self, identity: &Identity) -> Result<(), ProviderError> {
        self.last_logins
            .lock()
            .insert(identity.username.clone(), SystemTime::now());
        Ok(())
    }
}
