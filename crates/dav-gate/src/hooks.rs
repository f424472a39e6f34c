// SPDX-License-Identifier: AGPL-3.0-only
//! External notification points around a connection.

use crate::error::GateError;
use crate::identity::{Identity, LoginMethod};
use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct HookError(pub String);

#[async_trait]
pub trait Hooks: Send + Sync {
    /// Runs before any credential is inspected. An error rejects the
    /// connection.
    async fn post_connect(&self, ip: &str, protocol: &str) -> Result<(), HookError>;

    /// Runs after every login attempt with its outcome. Failures are only
    /// logged by implementations.
    async fn post_login(
        &self,
        identity: &Identity,
        method: LoginMethod,
        ip: &str,
        protocol: &str,
        outcome: Option<&GateError>,
    );
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

#[async_trait]
impl Hooks for NoopHooks {
    async fn post_connect(&self, _ip: &str, _protocol: &str) -> Result<(), HookError> {
        Ok(())
    }

    async fn post_login(
        &self,
        _identity: &Identity,
        _method: LoginMethod,
        _ip: &str,
        _protocol: &str,
        _outcome: Option<&GateError>,
    ) {
    }
}
