// SPDX-License-Identifier: AGPL-3.0-only
//! Reporting of every login attempt: metrics, ban events, audit log and the
//! post-login hook.

use crate::PROTOCOL_WEBDAV;
use crate::defender::{Defender, HostEvent};
use crate::error::{ConnectionError, GateError};
use crate::hooks::Hooks;
use crate::identity::{Identity, LoginMethod};
use std::sync::Arc;
use tracing::warn;

/// Counters the gate updates. Every method defaults to a no-op so sinks only
/// implement what they export.
pub trait GateMetrics: Send + Sync {
    fn login_attempt(&self, _method: LoginMethod) {}

    fn login_result(&self, _method: LoginMethod, _outcome: Option<&GateError>) {}

    fn connection_rejected(&self, _err: &ConnectionError) {}

    fn connections_active(&self, _count: usize) {}

    fn request_completed(&self, _method: &str, _status: u16) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl GateMetrics for NoopMetrics {}

#[derive(Clone)]
pub struct OutcomeReporter {
    defender: Arc<dyn Defender>,
    metrics: Arc<dyn GateMetrics>,
    hooks: Arc<dyn Hooks>,
}

impl OutcomeReporter {
    pub fn new(
        defender: Arc<dyn Defender>,
        metrics: Arc<dyn GateMetrics>,
        hooks: Arc<dyn Hooks>,
    ) -> Self {
        Self {
            defender,
            metrics,
            hooks,
        }
    }

    pub fn metrics(&self) -> &Arc<dyn GateMetrics> {
        &self.metrics
    }

    /// Record one login attempt. `outcome` is `None` on success.
    pub async fn report(&self, identity: &Identity, ip: &str, outcome: Option<&GateError>) {
        let method = LoginMethod::Password;
        self.metrics.login_attempt(method);
        if let Some(err) = outcome {
            warn!(
                target: "usg_dav_gate::audit",
                username = %identity.username,
                ip = %ip,
                method = %method,
                protocol = PROTOCOL_WEBDAV,
                error = %err,
                "login failed"
            );
            let event = if err.is_user_not_found() {
                HostEvent::UserNotFound
            } else {
                HostEvent::LoginFailed
            };
            self.defender.add_event(ip, event);
        }
        self.metrics.login_result(method, outcome);
        self.hooks
            .post_login(identity, method, ip, PROTOCOL_WEBDAV, outcome)
            .await;
    }
}
