// SPDX-License-Identifier: AGPL-3.0-only
//! Error taxonomy of the gate. Every class maps onto exactly one HTTP status.

use crate::identity::LoginMethod;
use axum::http::StatusCode;
use thiserror::Error;

/// Body sent for every connection-level rejection.
pub const CONNECTION_DENIED: &str = "connection denied";
/// Body sent with the 401 challenge.
pub const UNAUTHORIZED: &str = "Unauthorized";
/// Body sent when a panic was recovered; details only go to the log.
pub const GENERIC_FAILURE: &str = "internal failure";

/// TLS client certificate could not be trusted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TrustError {
    #[error("TLS connection cannot be verified: unable to get verification chain")]
    ChainUnverifiable,
    #[error("client certificate has been revoked")]
    CertificateRevoked,
}

/// Credentials were missing or did not match.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("missing or malformed basic credentials")]
    MissingCredentials,
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("user {0:?} not found")]
    UserNotFound(String),
    #[error("identity provider failure: {0}")]
    Provider(String),
}

/// An authenticated identity is not allowed to open a session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmissionError {
    #[error(
        "cannot login user {username:?} with invalid home dir {home_dir:?}: home dir must be an absolute path"
    )]
    InvalidHomeDir { username: String, home_dir: String },
    #[error("protocol {protocol} is not allowed for user {username:?}")]
    ProtocolDenied { username: String, protocol: String },
    #[error("{method} login method is not allowed for user {username:?}")]
    LoginMethodDenied {
        username: String,
        method: LoginMethod,
    },
    #[error("too many open sessions: {active}")]
    TooManySessions { active: usize },
    #[error("overlapping mapped folders are allowed only with quota tracking disabled")]
    OverlappingMappedPaths,
    #[error("login for user {username:?} is not allowed from this address: {address}")]
    AddressNotAllowed { username: String, address: String },
}

/// Connection-level rejection, decided before any credential is looked at.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("connection refused, configured limit reached")]
    LimitReached,
    #[error("connection refused, source address {0} is banned")]
    Banned(String),
    #[error("connection refused by post-connect hook: {0}")]
    HookRejected(String),
}

impl ConnectionError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ConnectionError::LimitReached => StatusCode::SERVICE_UNAVAILABLE,
            ConnectionError::Banned(_) | ConnectionError::HookRejected(_) => StatusCode::FORBIDDEN,
        }
    }

    /// Short label used for metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            ConnectionError::LimitReached => "limit",
            ConnectionError::Banned(_) => "banned",
            ConnectionError::HookRejected(_) => "hook",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GateError {
    #[error(transparent)]
    Trust(#[from] TrustError),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Admission(#[from] AdmissionError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error("{0}")]
    Internal(String),
}

impl GateError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GateError::Trust(_) => StatusCode::FORBIDDEN,
            GateError::Auth(_) => StatusCode::UNAUTHORIZED,
            GateError::Admission(_) => StatusCode::FORBIDDEN,
            GateError::Connection(err) => err.status_code(),
            GateError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// True when the identity provider had no record for the user.
    pub fn is_user_not_found(&self) -> bool {
        matches!(self, GateError::Auth(AuthError::UserNotFound(_)))
    }
}
