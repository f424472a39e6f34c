// SPDX-License-Identifier: AGPL-3.0-only
mod config;
mod handler;
mod hooks;
mod http;
mod listener;
mod metrics;
mod provider;
mod telemetry;
mod tls;

use crate::config::{Args, LogFormat};
use crate::handler::ReadOnlyHandler;
use crate::hooks::CommandHooks;
use crate::http::{ServerState, serve_http};
use crate::metrics::PrometheusMetrics;
use crate::provider::StaticIdentityProvider;
use crate::telemetry::{TelemetryConfig, init_telemetry, shutdown_telemetry};
use crate::tls::{TlsSettings, build_tls_config};
use anyhow::{Context, Result};
use axum::Router;
use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{Request, Response};
use axum_server::Handle;
use axum_server::tls_rustls::{RustlsAcceptor, RustlsConfig};
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{SignalKind, signal};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};
use usg_dav_gate::{
    CrlStore, DavGate, GateServices, LocalFilesystemFactory, MemoryDefender, RevocationAuthority,
    TrustVerifier,
};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);
const DEFENDER_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args)?;
    args.validate()?;

    let provider = Arc::new(StaticIdentityProvider::load(&args.identities)?);
    if provider.is_empty() {
        warn!(path = %args.identities.display(), "no identities configured; every login will fail");
    }
    let defender = Arc::new(MemoryDefender::new(args.defender_config()));
    let hooks = Arc::new(CommandHooks::new(
        args.post_connect_hook.clone(),
        args.post_login_hook.clone(),
        args.hook_timeout(),
    ));
    let gate = Arc::new(DavGate::new(
        args.gate_config(),
        GateServices {
            provider,
            fs_factory: Arc::new(LocalFilesystemFactory),
            defender: defender.clone(),
            hooks,
            metrics: Arc::new(PrometheusMetrics),
            handler: Arc::new(ReadOnlyHandler),
        },
    ));

    let state = ServerState::new().with_gate(Arc::clone(gate.registry()), defender.clone());
    if let Some(addr) = args.listen_http {
        let state = state.clone();
        tokio::spawn(async move {
            if let Err(err) = serve_http(addr, state).await {
                error!(error = %err, "health server stopped");
            }
        });
    }
    tokio::spawn(defender_cleanup(defender));

    let app = Router::new()
        .fallback(dav_entry)
        .with_state(Arc::clone(&gate))
        .layer(TraceLayer::new_for_http());

    let handle = Handle::new();
    tokio::spawn(shutdown_on_signal(handle.clone(), state.clone()));
    let limits = args.listener_limits();

    if let (Some(cert), Some(key)) = (args.tls_cert.as_ref(), args.tls_key.as_ref()) {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
        let crls = if args.tls_crl.is_empty() {
            None
        } else {
            let store = Arc::new(CrlStore::load(&args.tls_crl).context("loading CRLs")?);
            tokio::spawn(watch_sighup(Arc::clone(&store)));
            Some(store)
        };
        let trust = TrustVerifier::new(crls.map(|s| s as Arc<dyn RevocationAuthority>));
        let config = build_tls_config(TlsSettings {
            cert,
            key,
            client_ca: &args.client_ca,
            client_auth: args.client_auth,
            trust,
        })?;

        info!(addr = %args.listen, client_auth = ?args.client_auth, "WebDAV listening (TLS)");
        state.set_ready(true);
        let acceptor = RustlsAcceptor::new(RustlsConfig::from_config(Arc::new(config)))
            .acceptor(limits.acceptor());
        let mut server = axum_server::bind(args.listen).acceptor(acceptor).handle(handle);
        limits.apply(server.http_builder());
        server
            .serve(app.into_make_service_with_connect_info::<SocketAddr>())
            .await
            .context("WebDAV TLS listener")?;
    } else {
        warn!("TLS not configured; credentials travel in clear text");
        info!(addr = %args.listen, "WebDAV listening");
        state.set_ready(true);
        let mut server = axum_server::bind(args.listen)
            .acceptor(limits.acceptor())
            .handle(handle);
        limits.apply(server.http_builder());
        server
            .serve(app.into_make_service_with_connect_info::<SocketAddr>())
            .await
            .context("WebDAV listener")?;
    }

    info!("WebDAV listener stopped");
    state.set_alive(false);
    shutdown_telemetry();
    Ok(())
}

fn init_tracing(args: &Args) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = match args.log_format {
        LogFormat::Text => tracing_subscriber::fmt::layer()
            .with_timer(UtcTime::rfc_3339())
            .boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_timer(UtcTime::rfc_3339())
            .boxed(),
    };
    let otel_layer = match &args.otlp_endpoint {
        Some(endpoint) => Some(init_telemetry(&TelemetryConfig::new(
            endpoint.clone(),
            args.otel_service_name.clone(),
            args.tls_enabled(),
        ))?),
        None => None,
    };
    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(filter)
        .with(otel_layer)
        .try_init()?;
    Ok(())
}

async fn dav_entry(
    State(gate): State<Arc<DavGate>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request<Body>,
) -> Response<Body> {
    gate.serve(request, peer).await
}

/// Reload the CRL files on every SIGHUP. A failed reload keeps the previous set.
async fn watch_sighup(store: Arc<CrlStore>) {
    match signal(SignalKind::hangup()) {
        Ok(mut stream) => {
            while stream.recv().await.is_some() {
                match store.reload() {
                    Ok(count) => info!(count, "reloaded certificate revocation lists after SIGHUP"),
                    Err(err) => warn!(error = %err, "failed to reload CRLs on SIGHUP"),
                }
            }
        }
        Err(err) => warn!(error = %err, "failed to install SIGHUP handler"),
    }
}

async fn defender_cleanup(defender: Arc<MemoryDefender>) {
    let mut interval = tokio::time::interval(DEFENDER_CLEANUP_INTERVAL);
    loop {
        interval.tick().await;
        defender.cleanup();
    }
}

async fn shutdown_on_signal(handle: Handle, state: ServerState) {
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(err) => {
            warn!(error = %err, "failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            state.set_ready(false);
            handle.graceful_shutdown(Some(DRAIN_TIMEOUT));
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
    info!("shutdown requested, draining connections");
    state.set_ready(false);
    handle.graceful_shutdown(Some(DRAIN_TIMEOUT));
}
