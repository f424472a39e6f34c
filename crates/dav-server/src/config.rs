// SPDX-License-Identifier: AGPL-3.0-only
use crate::listener::{ListenerLimits, MIN_HEADER_BYTES};
use anyhow::{Result, bail};
use clap::{Parser, ValueEnum};
use ipnet::IpNet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use usg_dav_gate::{DefenderConfig, GateConfig, UsersCacheConfig};

/// Log output format.
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum LogFormat {
    /// Human-readable text format (default).
    #[default]
    Text,
    /// JSON structured logging for log aggregation (ELK, Loki).
    Json,
}

/// TLS client certificate policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum ClientAuth {
    /// No client certificate is requested.
    #[default]
    None,
    /// A client certificate chaining to --client-ca is mandatory.
    Require,
}

#[derive(Parser, Debug)]
#[command(
    name = "usg-dav",
    version,
    about = "WebDAV gate with TLS client revocation checks and admission control"
)]
pub struct Args {
    /// Listen address for WebDAV.
    #[arg(long, default_value = "0.0.0.0:8090")]
    pub listen: SocketAddr,

    /// Listen address for HTTP health checks and Prometheus metrics (e.g., 127.0.0.1:8080).
    #[arg(long)]
    pub listen_http: Option<SocketAddr>,

    /// Log output format: text or json.
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    /// Server certificate (PEM). TLS is enabled when both --tls-cert and --tls-key are set.
    #[arg(long)]
    pub tls_cert: Option<PathBuf>,

    /// Server private key (PEM).
    #[arg(long)]
    pub tls_key: Option<PathBuf>,

    /// Client CA bundles (PEM, repeatable).
    #[arg(long, value_name = "CA_PEM", num_args = 0..)]
    pub client_ca: Vec<PathBuf>,

    /// Certificate revocation lists (PEM or DER, repeatable). Reloaded on SIGHUP.
    #[arg(long, value_name = "CRL", num_args = 0..)]
    pub tls_crl: Vec<PathBuf>,

    /// Client certificate policy.
    #[arg(long, value_enum, default_value_t = ClientAuth::None)]
    pub client_auth: ClientAuth,

    /// JSON file with the identities allowed to log in.
    #[arg(long)]
    pub identities: PathBuf,

    /// Maximum concurrent WebDAV connections (0 = unlimited).
    #[arg(long, default_value_t = 0)]
    pub max_connections: usize,

    /// Maximum cached credentials (0 = unbounded).
    #[arg(long, default_value_t = 50)]
    pub users_cache_max_size: usize,

    /// Cached credential lifetime in minutes (0 = never expire).
    #[arg(long, default_value_t = 0)]
    pub users_cache_expiration_minutes: u64,

    /// Quota tracking is active; identities with overlapping mapped folders are refused.
    #[arg(long, default_value_t = false)]
    pub quota_tracking: bool,

    /// Connections arrive through a PROXY protocol aware balancer; X-Real-IP and
    /// X-Forwarded-For are ignored.
    #[arg(long, default_value_t = false)]
    pub proxy_protocol: bool,

    /// Realm sent in the Basic authentication challenge.
    #[arg(long, default_value = "USG WebDAV")]
    pub realm: String,

    /// Executable run for every new connection; a non-zero exit rejects it.
    #[arg(long)]
    pub post_connect_hook: Option<PathBuf>,

    /// Executable run after every login attempt.
    #[arg(long)]
    pub post_login_hook: Option<PathBuf>,

    /// Timeout for hook executables in seconds.
    #[arg(long, default_value_t = 30)]
    pub hook_timeout_secs: u64,

    // ==================== Listener ====================

    /// Seconds a client may take to send the request headers. Also bounds the
    /// wait for the next request on a keep-alive connection.
    #[arg(long, default_value_t = 30)]
    pub read_header_timeout_secs: u64,

    /// Seconds without any traffic before a connection is closed (0 = never).
    #[arg(long, default_value_t = 120)]
    pub idle_timeout_secs: u64,

    /// Largest request head accepted, in bytes.
    #[arg(long, default_value_t = 64 * 1024)]
    pub max_header_bytes: usize,

    // ==================== Defender ====================

    /// Ban source addresses that keep failing to log in.
    #[arg(long, default_value_t = false)]
    pub defender_enabled: bool,

    /// Ban duration in minutes.
    #[arg(long, default_value_t = 30)]
    pub defender_ban_time_minutes: u64,

    /// Window in minutes during which failures add up.
    #[arg(long, default_value_t = 30)]
    pub defender_observation_minutes: u64,

    /// Score that triggers a ban.
    #[arg(long, default_value_t = 15)]
    pub defender_threshold: u32,

    /// Score added by a failed login for an existing user.
    #[arg(long, default_value_t = 1)]
    pub defender_score_invalid: u32,

    /// Score added by a login for an unknown user.
    #[arg(long, default_value_t = 2)]
    pub defender_score_user_not_found: u32,

    /// Networks that are never banned (CIDR, repeatable).
    #[arg(long, value_name = "CIDR", num_args = 0..)]
    pub defender_safe_list: Vec<IpNet>,

    /// OpenTelemetry OTLP endpoint URL (e.g., http://jaeger:4317). Enables distributed tracing.
    #[arg(long)]
    pub otlp_endpoint: Option<String>,

    /// Service name for OpenTelemetry traces (default: usg-dav).
    #[arg(long, default_value = "usg-dav")]
    pub otel_service_name: String,
}

impl Args {
    /// Cross-option checks clap cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.tls_cert.is_some() != self.tls_key.is_some() {
            bail!("--tls-cert and --tls-key must be given together");
        }
        if self.client_auth == ClientAuth::Require {
            if !self.tls_enabled() {
                bail!("--client-auth require needs --tls-cert and --tls-key");
            }
            if self.client_ca.is_empty() {
                bail!("--client-auth require needs at least one --client-ca");
            }
        }
        if !self.tls_crl.is_empty() && self.client_auth != ClientAuth::Require {
            bail!("--tls-crl is only meaningful with --client-auth require");
        }
        if self.read_header_timeout_secs == 0 {
            bail!("--read-header-timeout-secs must be greater than zero");
        }
        if self.max_header_bytes < MIN_HEADER_BYTES {
            bail!("--max-header-bytes must be at least {MIN_HEADER_BYTES}");
        }
        Ok(())
    }

    pub fn tls_enabled(&self) -> bool {
        self.tls_cert.is_some() && self.tls_key.is_some()
    }

    pub fn gate_config(&self) -> GateConfig {
        GateConfig {
            realm: self.realm.clone(),
            proxy_protocol: self.proxy_protocol,
            quota_tracking: self.quota_tracking,
            max_connections: self.max_connections,
            users_cache: UsersCacheConfig {
                expiration: Duration::from_secs(self.users_cache_expiration_minutes * 60),
                max_size: self.users_cache_max_size,
            },
            tls: self.tls_enabled(),
        }
    }

    pub fn defender_config(&self) -> DefenderConfig {
        DefenderConfig {
            enabled: self.defender_enabled,
            ban_time: Duration::from_secs(self.defender_ban_time_minutes * 60),
            observation_time: Duration::from_secs(self.defender_observation_minutes * 60),
            threshold: self.defender_threshold,
            score_invalid: self.defender_score_invalid,
            score_user_not_found: self.defender_score_user_not_found,
            safe_list: self.defender_safe_list.clone(),
            ..DefenderConfig::default()
        }
    }

    pub fn hook_timeout(&self) -> Duration {
        Duration::from_secs(self.hook_timeout_secs)
    }

    pub fn listener_limits(&self) -> ListenerLimits {
        ListenerLimits {
            read_header_timeout: Duration::from_secs(self.read_header_timeout_secs),
            idle_timeout: (self.idle_timeout_secs > 0)
                .then(|| Duration::from_secs(self.idle_timeout_secs)),
            max_header_bytes: self.max_header_bytes,
        }
    }
}
