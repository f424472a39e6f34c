// SPDX-License-Identifier: AGPL-3.0-only
//! Connection-level and identity-level admission checks.

use crate::PROTOCOL_WEBDAV;
use crate::defender::Defender;
use crate::error::{AdmissionError, ConnectionError};
use crate::hooks::Hooks;
use crate::identity::{Identity, LoginMethod};
use crate::registry::ConnectionRegistry;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

/// Fresh process-unique id, `DAV_<token>`.
pub fn new_connection_id() -> String {
    format!("{}_{}", PROTOCOL_WEBDAV, Uuid::new_v4().simple())
}

/// Identity rejection. The connection id stays available for audit records.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{error}")]
pub struct Rejected {
    pub connection_id: String,
    pub error: AdmissionError,
}

pub struct AdmissionController {
    registry: Arc<ConnectionRegistry>,
    defender: Arc<dyn Defender>,
    hooks: Arc<dyn Hooks>,
    quota_tracking: bool,
}

impl AdmissionController {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        defender: Arc<dyn Defender>,
        hooks: Arc<dyn Hooks>,
        quota_tracking: bool,
    ) -> Self {
        Self {
            registry,
            defender,
            hooks,
            quota_tracking,
        }
    }

    /// Runs once per inbound request, before any credential is inspected.
    pub async fn check_connection(&self, ip: &str) -> Result<(), ConnectionError> {
        if !self.registry.is_new_connection_allowed() {
            debug!(ip = %ip, "connection refused, configured limit reached");
            return Err(ConnectionError::LimitReached);
        }
        if self.defender.is_banned(ip) {
            debug!(ip = %ip, "connection refused, source address is banned");
            return Err(ConnectionError::Banned(ip.to_string()));
        }
        if let Err(e) = self.hooks.post_connect(ip, PROTOCOL_WEBDAV).await {
            debug!(ip = %ip, error = %e, "connection refused by post-connect hook");
            return Err(ConnectionError::HookRejected(e.0));
        }
        Ok(())
    }

    /// Per-identity policy. Returns the generated connection id.
    ///
    /// The session count is read here and the connection is registered later
    /// by the caller, so concurrent logins at the limit may both pass.
    pub fn validate_identity(
        &self,
        identity: &Identity,
        remote_addr: &str,
    ) -> Result<String, Rejected> {
        let connection_id = new_connection_id();
        let reject = |error: AdmissionError| Rejected {
            connection_id: connection_id.clone(),
            error,
        };
        let user = identity.username.as_str();

        if !identity.home_dir.is_absolute() {
            warn!(
                connection_id = %connection_id,
                user = %user,
                home_dir = %identity.home_dir.display(),
                "invalid home dir, home dir must be an absolute path, login not allowed"
            );
            return Err(reject(AdmissionError::InvalidHomeDir {
                username: user.to_string(),
                home_dir: identity.home_dir.display().to_string(),
            }));
        }
        if identity.is_protocol_denied(PROTOCOL_WEBDAV) {
            debug!(connection_id = %connection_id, user = %user, "cannot login user, protocol DAV is not allowed");
            return Err(reject(AdmissionError::ProtocolDenied {
                username: user.to_string(),
                protocol: PROTOCOL_WEBDAV.to_string(),
            }));
        }
        if !identity.is_login_method_allowed(LoginMethod::Password) {
            debug!(connection_id = %connection_id, user = %user, "cannot login user, password login method is not allowed");
            return Err(reject(AdmissionError::LoginMethodDenied {
                username: user.to_string(),
                method: LoginMethod::Password,
            }));
        }
        if identity.max_sessions > 0 {
            let active = self.registry.active_sessions(user);
            if active >= identity.max_sessions {
                debug!(
                    connection_id = %connection_id,
                    user = %user,
                    active,
                    max_sessions = identity.max_sessions,
                    "authentication refused, too many open sessions"
                );
                return Err(reject(AdmissionError::TooManySessions { active }));
            }
        }
        if self.quota_tracking && identity.has_overlapped_mapped_paths() {
            debug!(
                connection_id = %connection_id,
                user = %user,
                "cannot login user, overlapping mapped folders are allowed only with quota tracking disabled"
            );
            return Err(reject(AdmissionError::OverlappingMappedPaths));
        }
        if !identity.is_login_from_addr_allowed(remote_addr) {
            debug!(connection_id = %connection_id, user = %user, remote_addr = %remote_addr, "cannot login user, remote address is not allowed");
            return Err(reject(AdmissionError::AddressNotAllowed {
                username: user.to_string(),
                address: remote_addr.to_string(),
            }));
        }
        Ok(connection_id)
    }
}
