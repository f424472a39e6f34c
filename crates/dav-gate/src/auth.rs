// SPDX-License-Identifier: AGPL-3.0-only
//! HTTP Basic authentication backed by the credential cache and the
//! identity provider.

use crate::PROTOCOL_WEBDAV;
use crate::cache::{CachedCredential, CredentialCache};
use crate::error::{AuthError, GateError};
use crate::fs::FilesystemFactory;
use crate::identity::{Identity, IdentityProvider};
use crate::lock::{LockHandle, MemLockSystem};
use crate::outcome::OutcomeReporter;
use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicCredentials {
    pub username: String,
    pub password: String,
}

/// Parse `Authorization: Basic ...`. The scheme is case-insensitive and the
/// password may itself contain `:`.
pub fn basic_credentials(headers: &HeaderMap) -> Option<BasicCredentials> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, encoded) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some(BasicCredentials {
        username: username.to_string(),
        password: password.to_string(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsersCacheConfig {
    /// Zero disables expiration.
    pub expiration: Duration,
    /// Zero disables the size bound.
    pub max_size: usize,
}

impl Default for UsersCacheConfig {
    fn default() -> Self {
        Self {
            expiration: Duration::ZERO,
            max_size: 50,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Authenticated {
    pub identity: Identity,
    pub lock_system: LockHandle,
    pub from_cache: bool,
}

pub struct Authenticator {
    provider: Arc<dyn IdentityProvider>,
    cache: Arc<CredentialCache>,
    fs_factory: Arc<dyn FilesystemFactory>,
    reporter: OutcomeReporter,
    config: UsersCacheConfig,
}

impl Authenticator {
    pub fn new(
        provider: Arc<dyn IdentityProvider>,
        cache: Arc<CredentialCache>,
        fs_factory: Arc<dyn FilesystemFactory>,
        reporter: OutcomeReporter,
        config: UsersCacheConfig,
    ) -> Self {
        Self {
            provider,
            cache,
            fs_factory,
            reporter,
            config,
        }
    }

    pub fn cache(&self) -> &Arc<CredentialCache> {
        &self.cache
    }

    /// Resolve the request credentials to an identity. Every failure past
    /// credential extraction has already been reported when this returns.
    pub async fn authenticate(
        &self,
        headers: &HeaderMap,
        ip: &str,
    ) -> Result<Authenticated, GateError> {
        let Some(creds) = basic_credentials(headers) else {
            return Err(AuthError::MissingCredentials.into());
        };

        // `get` already drops an expired entry and reports a miss
        if let Some(cached) = self.cache.get(&creds.username) {
            if !creds.password.is_empty() && cached.password == creds.password {
                debug!(user = %creds.username, "authenticated from credential cache");
                return Ok(Authenticated {
                    identity: cached.identity,
                    lock_system: cached.lock_system,
                    from_cache: true,
                });
            }
            let err = GateError::from(AuthError::InvalidCredentials);
            self.reporter.report(&cached.identity, ip, Some(&err)).await;
            return Err(err);
        }

        let identity = match self
            .provider
            .check_credentials(&creds.username, &creds.password, ip, PROTOCOL_WEBDAV)
            .await
        {
            Ok(identity) => identity,
            Err(e) => {
                let err = GateError::from(AuthError::from(e));
                self.reporter
                    .report(&Identity::named(&creds.username), ip, Some(&err))
                    .await;
                return Err(err);
            }
        };

        let lock_system = MemLockSystem::new_handle();
        if !creds.password.is_empty() {
            let expiration = (!self.config.expiration.is_zero())
                .then(|| SystemTime::now() + self.config.expiration);
            self.cache.put(
                CachedCredential {
                    identity: identity.clone(),
                    password: creds.password,
                    lock_system: Arc::clone(&lock_system),
                    expiration,
                },
                self.config.max_size,
            );
            if identity.fs_provider.checks_root_path() {
                self.check_root_path(&identity).await;
            }
        }

        Ok(Authenticated {
            identity,
            lock_system,
            from_cache: false,
        })
    }

    async fn check_root_path(&self, identity: &Identity) {
        match self.fs_factory.open(identity, "temp").await {
            Ok(fs) => {
                fs.check_root_path(&identity.username, identity.uid, identity.gid)
                    .await;
                fs.close();
            }
            Err(e) => {
                debug!(user = %identity.username, error = %e, "root path check skipped");
            }
        }
    }
}
