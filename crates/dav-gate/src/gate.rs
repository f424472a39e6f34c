// SPDX-License-Identifier: AGPL-3.0-only
//! Request entry point tying admission, authentication and the WebDAV engine
//! together.

use crate::PROTOCOL_WEBDAV;
use crate::admission::AdmissionController;
use crate::auth::{Authenticator, UsersCacheConfig};
use crate::cache::CredentialCache;
use crate::defender::Defender;
use crate::error::{CONNECTION_DENIED, GENERIC_FAILURE, GateError, UNAUTHORIZED};
use crate::fs::FilesystemFactory;
use crate::hooks::Hooks;
use crate::identity::IdentityProvider;
use crate::outcome::{GateMetrics, OutcomeReporter};
use crate::preprocess::{maybe_rewrite, multistatus_head_response};
use crate::registry::{BaseConnection, Connection, ConnectionRegistry, DavBackend};
use async_trait::async_trait;
use axum::body::Body;
use axum::http::header::{CONTENT_TYPE, HOST, USER_AGENT, WWW_AUTHENTICATE, X_CONTENT_TYPE_OPTIONS};
use axum::http::{HeaderMap, HeaderValue, Request, Response, StatusCode};
use futures::FutureExt;
use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Once};
use std::time::Instant;
use tracing::{debug, error, info};

const X_REAL_IP: &str = "x-real-ip";
const X_FORWARDED_FOR: &str = "x-forwarded-for";

thread_local! {
    static PANIC_BACKTRACE: RefCell<Option<Backtrace>> = const { RefCell::new(None) };
}

static PANIC_CAPTURE: Once = Once::new();

/// Chain a panic hook that records the backtrace of the panicking thread
/// before it unwinds. The previous hook still runs.
pub fn install_panic_capture() {
    PANIC_CAPTURE.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            PANIC_BACKTRACE.with(|slot| *slot.borrow_mut() = Some(Backtrace::force_capture()));
            previous(info);
        }));
    });
}

/// Backtrace recorded by the last panic on this thread.
fn take_panic_backtrace() -> Option<Backtrace> {
    PANIC_BACKTRACE.with(|slot| slot.borrow_mut().take())
}

/// The WebDAV engine behind the gate. It only ever sees admitted requests.
#[async_trait]
pub trait DavHandler: Send + Sync {
    async fn serve(&self, request: Request<Body>, connection: Arc<dyn DavBackend>)
    -> Response<Body>;
}

#[derive(Debug, Clone)]
pub struct GateConfig {
    pub realm: String,
    /// Source addresses come from the transport; forwarding headers are
    /// ignored.
    pub proxy_protocol: bool,
    pub quota_tracking: bool,
    /// Zero disables the limit.
    pub max_connections: usize,
    pub users_cache: UsersCacheConfig,
    /// Only used for the scheme of access log URIs.
    pub tls: bool,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            realm: "USG WebDAV".to_string(),
            proxy_protocol: false,
            quota_tracking: false,
            max_connections: 0,
            users_cache: UsersCacheConfig::default(),
            tls: false,
        }
    }
}

/// External collaborators of the gate.
#[derive(Clone)]
pub struct GateServices {
    pub provider: Arc<dyn IdentityProvider>,
    pub fs_factory: Arc<dyn FilesystemFactory>,
    pub defender: Arc<dyn Defender>,
    pub hooks: Arc<dyn Hooks>,
    pub metrics: Arc<dyn GateMetrics>,
    pub handler: Arc<dyn DavHandler>,
}

pub struct DavGate {
    config: GateConfig,
    registry: Arc<ConnectionRegistry>,
    admission: AdmissionController,
    authenticator: Authenticator,
    reporter: OutcomeReporter,
    provider: Arc<dyn IdentityProvider>,
    fs_factory: Arc<dyn FilesystemFactory>,
    metrics: Arc<dyn GateMetrics>,
    handler: Arc<dyn DavHandler>,
}

impl DavGate {
    pub fn new(config: GateConfig, services: GateServices) -> Self {
        install_panic_capture();
        let registry = Arc::new(ConnectionRegistry::new(config.max_connections));
        let cache = Arc::new(CredentialCache::new());
        let reporter = OutcomeReporter::new(
            Arc::clone(&services.defender),
            Arc::clone(&services.metrics),
            Arc::clone(&services.hooks),
        );
        let admission = AdmissionController::new(
            Arc::clone(&registry),
            services.defender,
            services.hooks,
            config.quota_tracking,
        );
        let authenticator = Authenticator::new(
            Arc::clone(&services.provider),
            cache,
            Arc::clone(&services.fs_factory),
            reporter.clone(),
            config.users_cache,
        );
        Self {
            config,
            registry,
            admission,
            authenticator,
            reporter,
            provider: services.provider,
            fs_factory: services.fs_factory,
            metrics: services.metrics,
            handler: services.handler,
        }
    }

    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<CredentialCache> {
        self.authenticator.cache()
    }

    /// Handle one request. Never panics: a panic below this point becomes a
    /// 500 with a generic body.
    pub async fn serve(&self, request: Request<Body>, peer: SocketAddr) -> Response<Body> {
        let method = request.method().to_string();
        let response = match AssertUnwindSafe(self.dispatch(request, peer))
            .catch_unwind()
            .await
        {
            Ok(response) => response,
            Err(panic) => {
                // The catch point is on the same thread as the panic, so the
                // hook's backtrace is still in the slot.
                let backtrace = take_panic_backtrace().unwrap_or_else(Backtrace::force_capture);
                error!(
                    panic = %panic_message(&*panic),
                    backtrace = %backtrace,
                    "panic while serving request"
                );
                plain_error(StatusCode::INTERNAL_SERVER_ERROR, GENERIC_FAILURE)
            }
        };
        self.metrics
            .request_completed(&method, response.status().as_u16());
        self.metrics.connections_active(self.registry.len());
        response
    }

    async fn dispatch(&self, mut request: Request<Body>, peer: SocketAddr) -> Response<Body> {
        let started = Instant::now();
        let remote_addr = self.remote_address(request.headers(), peer);
        let ip = ip_from_remote_address(&remote_addr).to_string();

        if let Err(e) = self.admission.check_connection(&ip).await {
            self.metrics.connection_rejected(&e);
            return plain_error(e.status_code(), CONNECTION_DENIED);
        }

        let authenticated = match self.authenticator.authenticate(request.headers(), &ip).await {
            Ok(authenticated) => authenticated,
            Err(e) => {
                debug!(ip = %ip, error = %e, "authentication failed");
                return self.unauthorized();
            }
        };
        let identity = authenticated.identity;

        let connection_id = match self.admission.validate_identity(&identity, &remote_addr) {
            Ok(id) => id,
            Err(rejected) => {
                let err = GateError::from(rejected.error);
                self.reporter.report(&identity, &ip, Some(&err)).await;
                return plain_error(err.status_code(), &err.to_string());
            }
        };

        let fs = match self.fs_factory.open(&identity, &connection_id).await {
            Ok(fs) => fs,
            Err(e) => {
                let err = GateError::Internal(e.to_string());
                self.reporter.report(&identity, &ip, Some(&err)).await;
                return plain_error(err.status_code(), &err.to_string());
            }
        };
        self.reporter.report(&identity, &ip, None).await;

        let base = Arc::new(BaseConnection::new(
            connection_id.clone(),
            PROTOCOL_WEBDAV,
            identity,
            fs,
            remote_addr.clone(),
        ));
        let _guard = self.registry.register(Arc::clone(&base));
        self.metrics.connections_active(self.registry.len());

        if let Err(e) = self.provider.update_last_login(base.identity()).await {
            debug!(connection_id = %connection_id, error = %e, "unable to update last login");
        }

        let connection = Arc::new(Connection::new(base, authenticated.lock_system));
        let access = AccessRecord::new(&request, &remote_addr, &connection_id, self.config.tls);
        let response = if maybe_rewrite(&mut request, connection.as_ref()).await {
            multistatus_head_response()
        } else {
            self.handler.serve(request, connection).await
        };
        access.emit(response.status(), started);
        response
    }

    fn remote_address(&self, headers: &HeaderMap, peer: SocketAddr) -> String {
        if self.config.proxy_protocol {
            return peer.to_string();
        }
        forwarded_address(headers).unwrap_or_else(|| peer.to_string())
    }

    fn unauthorized(&self) -> Response<Body> {
        let mut response = plain_error(StatusCode::UNAUTHORIZED, UNAUTHORIZED);
        let challenge = HeaderValue::from_str(&format!("Basic realm=\"{}\"", self.config.realm))
            .unwrap_or_else(|_| HeaderValue::from_static("Basic realm=\"WebDAV\""));
        response.headers_mut().insert(WWW_AUTHENTICATE, challenge);
        response
    }
}

/// `X-Real-IP`, else the first `X-Forwarded-For` entry.
fn forwarded_address(headers: &HeaderMap) -> Option<String> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };
    if let Some(real_ip) = header(X_REAL_IP) {
        return Some(real_ip.to_string());
    }
    let forwarded = header(X_FORWARDED_FOR)?;
    let first = forwarded.split(',').next().unwrap_or(forwarded).trim();
    (!first.is_empty()).then(|| first.to_string())
}

/// Host part of `host:port`, `[v6]:port`, or the input unchanged when it has
/// no port.
pub fn ip_from_remote_address(remote_addr: &str) -> &str {
    if let Some(rest) = remote_addr.strip_prefix('[') {
        return match rest.split_once("]:") {
            Some((host, _)) => host,
            None => remote_addr,
        };
    }
    match remote_addr.rsplit_once(':') {
        Some((host, _)) if !host.contains(':') => host,
        _ => remote_addr,
    }
}

fn plain_error(status: StatusCode, message: &str) -> Response<Body> {
    let mut response = Response::new(Body::from(format!("{message}\n")));
    *response.status_mut() = status;
    let headers = response.headers_mut();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    headers.insert(X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
    response
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Request fields captured before the engine consumes the request.
struct AccessRecord {
    remote_addr: String,
    proto: String,
    method: String,
    user_agent: String,
    uri: String,
    request_id: String,
}

impl AccessRecord {
    fn new<B>(request: &Request<B>, remote_addr: &str, request_id: &str, tls: bool) -> Self {
        let scheme = if tls { "https" } else { "http" };
        let host = request
            .headers()
            .get(HOST)
            .and_then(|v| v.to_str().ok())
            .or_else(|| request.uri().authority().map(|a| a.as_str()))
            .unwrap_or_default();
        let path = request
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        Self {
            remote_addr: remote_addr.to_string(),
            proto: format!("{:?}", request.version()),
            method: request.method().to_string(),
            user_agent: request
                .headers()
                .get(USER_AGENT)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string(),
            uri: format!("{scheme}://{host}{path}"),
            request_id: request_id.to_string(),
        }
    }

    fn emit(&self, status: StatusCode, started: Instant) {
        info!(
            target: "usg_dav_gate::access",
            remote_addr = %self.remote_addr,
            proto = %self.proto,
            method = %self.method,
            user_agent = %self.user_agent,
            uri = %self.uri,
            request_id = %self.request_id,
            status = status.as_u16(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "request served"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::defender::HostEvent;
    use crate::identity::Identity;
    use crate::testing::{
        MockFsFactory, MockHandler, MockProvider, RecordingDefender, RecordingHooks,
        RecordingMetrics, basic_value,
    };
    use axum::body::to_bytes;
    use axum::http::header::AUTHORIZATION;

    struct Fixture {
        gate: DavGate,
        provider: Arc<MockProvider>,
        fs_factory: Arc<MockFsFactory>,
        defender: Arc<RecordingDefender>,
        hooks: Arc<RecordingHooks>,
        metrics: Arc<RecordingMetrics>,
        handler: Arc<MockHandler>,
    }

    fn fixture(config: GateConfig) -> Fixture {
        let provider = Arc::new(MockProvider::default());
        provider.add_user("alice", "secret", Identity {
            home_dir: "/srv/alice".into(),
            ..Identity::named("alice")
        });
        let fs_factory = Arc::new(MockFsFactory::default());
        fs_factory.fs().add_dir("/docs");
        fs_factory.fs().add_file("/docs/a.txt", b"hello");
        let defender = Arc::new(RecordingDefender::default());
        let hooks = Arc::new(RecordingHooks::default());
        let metrics = Arc::new(RecordingMetrics::default());
        let handler = Arc::new(MockHandler::default());
        let gate = DavGate::new(config, GateServices {
            provider: provider.clone(),
            fs_factory: fs_factory.clone(),
            defender: defender.clone(),
            hooks: hooks.clone(),
            metrics: metrics.clone(),
            handler: handler.clone(),
        });
        Fixture {
            gate,
            provider,
            fs_factory,
            defender,
            hooks,
            metrics,
            handler,
        }
    }

    fn peer() -> SocketAddr {
        "10.0.0.1:40000".parse().unwrap()
    }

    fn authed(method: &str, uri: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(AUTHORIZATION, basic_value("alice", "secret"))
            .body(Body::empty())
            .unwrap()
    }

    async fn body_string(response: Response<Body>) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    // ==================== Address Resolution Tests ====================

    #[test]
    fn ip_from_remote_address_forms() {
        assert_eq!(ip_from_remote_address("10.0.0.1:80"), "10.0.0.1");
        assert_eq!(ip_from_remote_address("10.0.0.1"), "10.0.0.1");
        assert_eq!(ip_from_remote_address("[2001:db8::1]:443"), "2001:db8::1");
        assert_eq!(ip_from_remote_address("2001:db8::1"), "2001:db8::1");
        assert_eq!(ip_from_remote_address("[broken"), "[broken");
    }

    #[test]
    fn forwarded_headers_precedence() {
        let mut headers = HeaderMap::new();
        assert_eq!(forwarded_address(&headers), None);
        headers.insert(X_FORWARDED_FOR, "203.0.113.5, 10.0.0.2".parse().unwrap());
        assert_eq!(forwarded_address(&headers).as_deref(), Some("203.0.113.5"));
        headers.insert(X_REAL_IP, "198.51.100.7".parse().unwrap());
        assert_eq!(forwarded_address(&headers).as_deref(), Some("198.51.100.7"));
    }

    #[tokio::test]
    async fn forwarded_address_drives_ban_check() {
        let f = fixture(GateConfig::default());
        f.defender.ban("203.0.113.5");
        let mut request = authed("GET", "/docs/a.txt");
        request
            .headers_mut()
            .insert(X_FORWARDED_FOR, "203.0.113.5, 10.0.0.2".parse().unwrap());
        let response = f.gate.serve(request, peer()).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn proxy_protocol_ignores_forwarding_headers() {
        let f = fixture(GateConfig {
            proxy_protocol: true,
            ..Default::default()
        });
        f.defender.ban("203.0.113.5");
        let mut request = authed("GET", "/docs/a.txt");
        request
            .headers_mut()
            .insert(X_REAL_IP, "203.0.113.5".parse().unwrap());
        let response = f.gate.serve(request, peer()).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    // ==================== Connection Level Tests ====================

    #[tokio::test]
    async fn connection_limit_returns_503() {
        let f = fixture(GateConfig {
            max_connections: 1,
            ..Default::default()
        });
        let fs = f.fs_factory.fs();
        let _held = f.gate.registry().register(Arc::new(BaseConnection::new(
            "DAV_held",
            PROTOCOL_WEBDAV,
            Identity::named("bob"),
            fs,
            "10.0.0.3:1",
        )));
        let response = f.gate.serve(authed("GET", "/docs"), peer()).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body_string(response).await, "connection denied\n");
        assert_eq!(f.metrics.rejected(), vec!["limit"]);
        assert_eq!(f.provider.calls(), 0);
    }

    #[tokio::test]
    async fn banned_source_returns_403() {
        let f = fixture(GateConfig::default());
        f.defender.ban("10.0.0.1");
        let response = f.gate.serve(authed("GET", "/docs"), peer()).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(body_string(response).await, "connection denied\n");
        assert_eq!(f.hooks.connects(), 0);
    }

    #[tokio::test]
    async fn post_connect_rejection_returns_403() {
        let f = fixture(GateConfig::default());
        f.hooks.reject_connect(true);
        let response = f.gate.serve(authed("GET", "/docs"), peer()).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(f.provider.calls(), 0);
    }

    // ==================== Authentication Tests ====================

    #[tokio::test]
    async fn missing_credentials_get_challenge() {
        let f = fixture(GateConfig {
            realm: "Test Realm".into(),
            ..Default::default()
        });
        let request = Request::builder().uri("/docs").body(Body::empty()).unwrap();
        let response = f.gate.serve(request, peer()).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            response.headers().get(WWW_AUTHENTICATE).unwrap(),
            "Basic realm=\"Test Realm\""
        );
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "text/plain; charset=utf-8"
        );
        assert_eq!(body_string(response).await, "Unauthorized\n");
        assert_eq!(f.metrics.attempts(), 0);
    }

    #[tokio::test]
    async fn wrong_password_reported_once_and_challenged() {
        let f = fixture(GateConfig::default());
        let request = Request::builder()
            .uri("/docs")
            .header(AUTHORIZATION, basic_value("alice", "bad"))
            .body(Body::empty())
            .unwrap();
        let response = f.gate.serve(request, peer()).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(f.metrics.attempts(), 1);
        assert_eq!(
            f.defender.events(),
            vec![("10.0.0.1".to_string(), HostEvent::LoginFailed)]
        );
        assert_eq!(f.handler.served().len(), 0);
    }

    // ==================== Admission Tests ====================

    #[tokio::test]
    async fn admission_failure_returns_403_with_reason() {
        let f = fixture(GateConfig::default());
        f.provider.add_user("rel", "pw", Identity::named("rel"));
        let request = Request::builder()
            .uri("/")
            .header(AUTHORIZATION, basic_value("rel", "pw"))
            .body(Body::empty())
            .unwrap();
        let response = f.gate.serve(request, peer()).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let body = body_string(response).await;
        assert!(body.contains("home dir must be an absolute path"));
        assert_eq!(f.metrics.attempts(), 1);
        assert_eq!(f.metrics.results(), vec![false]);
        assert_eq!(f.hooks.logins().len(), 1);
    }

    #[tokio::test]
    async fn filesystem_failure_returns_500() {
        let f = fixture(GateConfig::default());
        f.fs_factory.fail_open(true);
        let response = f.gate.serve(authed("GET", "/docs/a.txt"), peer()).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(f.metrics.results(), vec![false]);
        assert!(f.gate.registry().is_empty());
    }

    // ==================== Dispatch Tests ====================

    #[tokio::test]
    async fn admitted_request_reaches_handler_and_is_unregistered() {
        let f = fixture(GateConfig::default());
        let response = f.gate.serve(authed("GET", "/docs/a.txt"), peer()).await;
        assert_eq!(response.status(), StatusCode::OK);
        let served = f.handler.served();
        assert_eq!(served.len(), 1);
        assert_eq!(served[0].method, "GET");
        assert!(served[0].connection_id.starts_with("DAV_"));
        assert!(f.gate.registry().is_empty());
        assert_eq!(f.metrics.results(), vec![true]);
        assert_eq!(f.provider.last_logins(), 1);
        assert_eq!(f.metrics.requests(), vec![("GET".to_string(), 200)]);
    }

    #[tokio::test]
    async fn head_on_directory_answered_by_gate() {
        let f = fixture(GateConfig::default());
        let response = f.gate.serve(authed("HEAD", "/docs"), peer()).await;
        assert_eq!(response.status(), StatusCode::MULTI_STATUS);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "text/xml; charset=utf-8"
        );
        assert_eq!(body_string(response).await, "");
        assert!(f.handler.served().is_empty());
        assert!(f.gate.registry().is_empty());
    }

    #[tokio::test]
    async fn get_on_directory_forwarded_as_propfind() {
        let f = fixture(GateConfig::default());
        f.gate.serve(authed("GET", "/docs/"), peer()).await;
        let served = f.handler.served();
        assert_eq!(served[0].method, "PROPFIND");
        assert_eq!(served[0].depth.as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn cached_sessions_share_lock_system() {
        let f = fixture(GateConfig::default());
        f.gate.serve(authed("GET", "/docs/a.txt"), peer()).await;
        f.gate.serve(authed("GET", "/docs/a.txt"), peer()).await;
        let served = f.handler.served();
        assert_eq!(f.provider.calls(), 1);
        assert!(Arc::ptr_eq(&served[0].lock_system, &served[1].lock_system));
        assert_ne!(served[0].connection_id, served[1].connection_id);
    }

    #[tokio::test]
    async fn handler_panic_becomes_generic_500_and_cleans_registry() {
        let f = fixture(GateConfig::default());
        let response = f.gate.serve(authed("GET", "/panic"), peer()).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body_string(response).await, "internal failure\n");
        assert!(f.gate.registry().is_empty());
        assert_eq!(f.metrics.requests(), vec![("GET".to_string(), 500)]);
        // The backtrace recorded at the panic site was consumed by the log record.
        assert!(take_panic_backtrace().is_none());
    }

    // ==================== Panic Backtrace Tests ====================

    #[inline(never)]
    async fn failing_engine_call() {
        panic!("engine failure inside the handler");
    }

    #[tokio::test]
    async fn panic_backtrace_points_at_panicking_frame() {
        install_panic_capture();
        let result = AssertUnwindSafe(failing_engine_call()).catch_unwind().await;
        assert!(result.is_err());

        let backtrace = take_panic_backtrace()
            .expect("panic hook records a backtrace")
            .to_string();
        assert!(backtrace.contains("failing_engine_call"), "{backtrace}");
    }

    #[test]
    fn no_backtrace_without_panic() {
        install_panic_capture();
        assert!(take_panic_backtrace().is_none());
    }
}
