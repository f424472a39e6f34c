// SPDX-License-Identifier: AGPL-3.0-only
//! Hooks that run external executables.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};
use usg_dav_gate::{GateError, HookError, Hooks, Identity, LoginMethod};

const ACTION_CONNECT: &str = "connect";
const ACTION_LOGIN: &str = "login";

/// Runs `post_connect` and `post_login` executables with the event passed
/// through `USG_DAV_*` environment variables.
#[derive(Debug, Clone)]
pub struct CommandHooks {
    post_connect: Option<PathBuf>,
    post_login: Option<PathBuf>,
    timeout: Duration,
}

impl CommandHooks {
    pub fn new(post_connect: Option<PathBuf>, post_login: Option<PathBuf>, timeout: Duration) -> Self {
        Self {
            post_connect,
            post_login,
            timeout,
        }
    }

    async fn run(&self, program: &Path, env: Vec<(&'static str, String)>) -> Result<(), HookError> {
        let mut command = Command::new(program);
        command
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        let status = match tokio::time::timeout(self.timeout, command.status()).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                return Err(HookError(format!("unable to run {}: {e}", program.display())));
            }
            Err(_) => {
                return Err(HookError(format!(
                    "{} timed out after {:?}",
                    program.display(),
                    self.timeout
                )));
            }
        };
        if status.success() {
            Ok(())
        } else {
            Err(HookError(format!("{} exited with {status}", program.display())))
        }
    }
}

fn connect_env(ip: &str, protocol: &str) -> Vec<(&'static str, String)> {
    vec![
        ("USG_DAV_ACTION", ACTION_CONNECT.to_string()),
        ("USG_DAV_IP", ip.to_string()),
        ("USG_DAV_PROTOCOL", protocol.to_string()),
    ]
}

fn login_env(
    identity: &Identity,
    method: LoginMethod,
    ip: &str,
    protocol: &str,
    outcome: Option<&GateError>,
) -> Vec<(&'static str, String)> {
    vec![
        ("USG_DAV_ACTION", ACTION_LOGIN.to_string()),
        ("USG_DAV_IP", ip.to_string()),
        ("USG_DAV_PROTOCOL", protocol.to_string()),
        ("USG_DAV_USERNAME", identity.username.clone()),
        ("USG_DAV_LOGIN_METHOD", method.as_str().to_string()),
        (
            "USG_DAV_STATUS",
            if outcome.is_none() { "1" } else { "0" }.to_string(),
        ),
    ]
}

#[async_trait]
impl Hooks for CommandHooks {
    async fn post_connect(&self, ip: &str, protocol: &str) -> Result<(), HookError> {
        let Some(program) = &self.post_connect else {
            return Ok(());
        };
        let result = self.run(program, connect_env(ip, protocol)).await;
        if let Err(e) = &result {
            debug!(peer = %ip, error = %e, "post-connect hook rejected connection");
        }
        result
    }

    async fn post_login(
        &self,
        identity: &Identity,
        method: LoginMethod,
        ip: &str,
        protocol: &str,
        outcome: Option<&GateError>,
    ) {
        let Some(program) = &self.post_login else {
            return;
        };
        let env = login_env(identity, method, ip, protocol, outcome);
        if let Err(e) = self.run(program, env).await {
            warn!(user = %identity.username, peer = %ip, error = %e, "post-login hook failed");
        }
    }
}
