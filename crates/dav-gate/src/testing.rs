// SPDX-License-Identifier: AGPL-3.0-only
//! In-memory collaborators shared by the unit tests.

use crate::defender::{Defender, HostEvent};
use crate::error::{ConnectionError, GateError};
use crate::fs::{FileInfo, FileReader, Filesystem, FilesystemFactory, FsError, clean_path};
use crate::gate::DavHandler;
use crate::hooks::{HookError, Hooks};
use crate::identity::{Identity, IdentityProvider, LoginMethod, ProviderError};
use crate::lock::LockHandle;
use crate::outcome::GateMetrics;
use crate::registry::DavBackend;
use async_trait::async_trait;
use axum::body::Body;
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, Request, Response, StatusCode};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::io::Cursor;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

pub fn basic_value(username: &str, password: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!("{username}:{password}")))
}

pub fn basic_header(username: &str, password: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(AUTHORIZATION, basic_value(username, password).parse().unwrap());
    headers
}

// ==================== Identity Provider ====================

#[derive(Default)]
pub struct MockProvider {
    users: Mutex<HashMap<String, (String, Identity)>>,
    calls: AtomicUsize,
    last_logins: AtomicUsize,
}

impl MockProvider {
    pub fn add_user(&self, username: &str, password: &str, identity: Identity) {
        self.users
            .lock()
            .insert(username.to_string(), (password.to_string(), identity));
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_logins(&self) -> usize {
        self.last_logins.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IdentityProvider for MockProvider {
    async fn check_credentials(
        &self,
        username: &str,
        password: &str,
        _ip: &str,
        _protocol: &str,
    ) -> Result<Identity, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.users.lock().get(username) {
            Some((expected, identity)) if expected == password => Ok(identity.clone()),
            Some(_) => Err(ProviderError::InvalidCredentials),
            None => Err(ProviderError::NotFound(username.to_string())),
        }
    }

    async fn update_last_login(&self, _identity: &Identity) -> Result<(), ProviderError> {
        self.last_logins.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ==================== Filesystem ====================

/// Directories map to `None`, files to their content. `/` always exists.
#[derive(Default)]
pub struct MockFs {
    entries: Mutex<HashMap<String, Option<Vec<u8>>>>,
    closes: AtomicUsize,
    root_checks: AtomicUsize,
    fail_root_check: AtomicBool,
}

impl MockFs {
    pub fn add_dir(&self, path: &str) {
        self.entries.lock().insert(clean_path(path), None);
    }

    pub fn add_file(&self, path: &str, content: &[u8]) {
        self.entries
            .lock()
            .insert(clean_path(path), Some(content.to_vec()));
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn root_checks(&self) -> usize {
        self.root_checks.load(Ordering::SeqCst)
    }

    pub fn set_fail_root_check(&self, fail: bool) {
        self.fail_root_check.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl Filesystem for MockFs {
    fn name(&self) -> &str {
        "mock"
    }

    async fn stat(&self, path: &str) -> Result<FileInfo, FsError> {
        let path = clean_path(path);
        if path == "/" {
            return Ok(FileInfo {
                name: "/".into(),
                size: 0,
                is_dir: true,
                modified: None,
            });
        }
        let entries = self.entries.lock();
        let entry = entries.get(&path).ok_or_else(|| FsError::NotFound(path.clone()))?;
        Ok(FileInfo {
            name: path.rsplit('/').next().unwrap_or_default().to_string(),
            size: entry.as_ref().map_or(0, |c| c.len() as u64),
            is_dir: entry.is_none(),
            modified: None,
        })
    }

    async fn open(&self, path: &str) -> Result<FileReader, FsError> {
        let path = clean_path(path);
        match self.entries.lock().get(&path) {
            Some(Some(content)) => Ok(Box::new(Cursor::new(content.clone()))),
            Some(None) => Err(FsError::InvalidPath(path)),
            None => Err(FsError::NotFound(path)),
        }
    }

    async fn check_root_path(&self, _username: &str, _uid: u32, _gid: u32) -> bool {
        self.root_checks.fetch_add(1, Ordering::SeqCst);
        !self.fail_root_check.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Hands out the same [`MockFs`] for every open.
#[derive(Default)]
pub struct MockFsFactory {
    fs: Arc<MockFs>,
    fail_open: AtomicBool,
}

impl MockFsFactory {
    pub fn fs(&self) -> Arc<MockFs> {
        Arc::clone(&self.fs)
    }

    pub fn fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::SeqCst);
    }

    pub fn fail_root_check(&self, fail: bool) {
        self.fs.set_fail_root_check(fail);
    }

    pub fn root_checks(&self) -> usize {
        self.fs.root_checks()
    }

    pub fn closed(&self) -> usize {
        self.fs.close_count()
    }
}

#[async_trait]
impl FilesystemFactory for MockFsFactory {
    async fn open(
        &self,
        _identity: &Identity,
        _connection_id: &str,
    ) -> Result<Arc<dyn Filesystem>, FsError> {
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(FsError::Unavailable("mock storage offline".into()));
        }
        Ok(self.fs.clone())
    }
}

// ==================== Defender / Hooks / Metrics ====================

#[derive(Default)]
pub struct RecordingDefender {
    events: Mutex<Vec<(String, HostEvent)>>,
    banned: Mutex<HashSet<String>>,
}

impl RecordingDefender {
    pub fn ban(&self, ip: &str) {
        self.banned.lock().insert(ip.to_string());
    }

    pub fn events(&self) -> Vec<(String, HostEvent)> {
        self.events.lock().clone()
    }
}

impl Defender for RecordingDefender {
    fn is_banned(&self, ip: &str) -> bool {
        self.banned.lock().contains(ip)
    }

    fn add_event(&self, ip: &str, event: HostEvent) {
        self.events.lock().push((ip.to_string(), event));
    }
}

#[derive(Default)]
pub struct RecordingHooks {
    connects: AtomicUsize,
    reject_connect: AtomicBool,
    logins: Mutex<Vec<(String, Option<String>)>>,
}

impl RecordingHooks {
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn reject_connect(&self, reject: bool) {
        self.reject_connect.store(reject, Ordering::SeqCst);
    }

    /// `(username, error text)` per post-login call.
    pub fn logins(&self) -> Vec<(String, Option<String>)> {
        self.logins.lock().clone()
    }
}

#[async_trait]
impl Hooks for RecordingHooks {
    async fn post_connect(&self, _ip: &str, _protocol: &str) -> Result<(), HookError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.reject_connect.load(Ordering::SeqCst) {
            return Err(HookError("rejected by test hook".into()));
        }
        Ok(())
    }

    async fn post_login(
        &self,
        identity: &Identity,
        _method: LoginMethod,
        _ip: &str,
        _protocol: &str,
        outcome: Option<&GateError>,
    ) {
        self.logins
            .lock()
            .push((identity.username.clone(), outcome.map(|e| e.to_string())));
    }
}

#[derive(Default)]
pub struct RecordingMetrics {
    attempts: AtomicUsize,
    results: Mutex<Vec<bool>>,
    rejected: Mutex<Vec<&'static str>>,
    requests: Mutex<Vec<(String, u16)>>,
}

impl RecordingMetrics {
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// One entry per reported result, true on success.
    pub fn results(&self) -> Vec<bool> {
        self.results.lock().clone()
    }

    pub fn rejected(&self) -> Vec<&'static str> {
        self.rejected.lock().clone()
    }

    pub fn requests(&self) -> Vec<(String, u16)> {
        self.requests.lock().clone()
    }
}

impl GateMetrics for RecordingMetrics {
    fn login_attempt(&self, _method: LoginMethod) {
        self.attempts.fetch_add(1, Ordering::SeqCst);
    }

    fn login_result(&self, _method: LoginMethod, outcome: Option<&GateError>) {
        self.results.lock().push(outcome.is_none());
    }

    fn connection_rejected(&self, err: &ConnectionError) {
        self.rejected.lock().push(err.reason());
    }

    fn request_completed(&self, method: &str, status: u16) {
        self.requests.lock().push((method.to_string(), status));
    }
}

// ==================== WebDAV Engine ====================

#[derive(Clone)]
pub struct ServedRequest {
    pub method: String,
    pub depth: Option<String>,
    pub connection_id: String,
    pub lock_system: LockHandle,
}

/// Records what reached the engine. A request for `/panic` panics.
#[derive(Default)]
pub struct MockHandler {
    served: Mutex<Vec<ServedRequest>>,
}

impl MockHandler {
    pub fn served(&self) -> Vec<ServedRequest> {
        self.served.lock().clone()
    }
}

#[async_trait]
impl DavHandler for MockHandler {
    async fn serve(
        &self,
        request: Request<Body>,
        connection: Arc<dyn DavBackend>,
    ) -> Response<Body> {
        if request.uri().path() == "/panic" {
            panic!("engine failure");
        }
        self.served.lock().push(ServedRequest {
            method: request.method().to_string(),
            depth: request
                .headers()
                .get("depth")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
            connection_id: connection.id().to_string(),
            lock_system: Arc::clone(connection.lock_system()),
        });
        let mut response = Response::new(Body::from("ok"));
        *response.status_mut() = StatusCode::OK;
        response
    }
}
