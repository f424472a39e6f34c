// SPDX-License-Identifier: AGPL-3.0-only
//! Active connection registry and the per-request connection object.

use crate::fs::{FileInfo, FileReader, Filesystem, FsError};
use crate::identity::Identity;
use crate::lock::LockHandle;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;
use tracing::debug;

/// Protocol-independent part of a connection.
pub struct BaseConnection {
    id: String,
    protocol: &'static str,
    identity: Arc<Identity>,
    fs: Arc<dyn Filesystem>,
    created_at: SystemTime,
    remote_addr: String,
}

impl BaseConnection {
    pub fn new(
        id: impl Into<String>,
        protocol: &'static str,
        identity: Identity,
        fs: Arc<dyn Filesystem>,
        remote_addr: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            protocol,
            identity: Arc::new(identity),
            fs,
            created_at: SystemTime::now(),
            remote_addr: remote_addr.into(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn protocol(&self) -> &'static str {
        self.protocol
    }

    pub fn identity(&self) -> &Arc<Identity> {
        &self.identity
    }

    pub fn username(&self) -> &str {
        &self.identity.username
    }

    pub fn fs(&self) -> &Arc<dyn Filesystem> {
        &self.fs
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }
}

/// What the WebDAV engine is allowed to do with a connection.
#[async_trait]
pub trait DavBackend: Send + Sync {
    fn id(&self) -> &str;

    fn identity(&self) -> &Identity;

    async fn stat(&self, path: &str) -> Result<FileInfo, FsError>;

    async fn open(&self, path: &str) -> Result<FileReader, FsError>;

    fn lock_system(&self) -> &LockHandle;
}

/// A WebDAV connection: the registered base plus the lock registry shared by
/// every session of the same cached identity.
#[derive(Clone)]
pub struct Connection {
    base: Arc<BaseConnection>,
    lock_system: LockHandle,
}

impl Connection {
    pub fn new(base: Arc<BaseConnection>, lock_system: LockHandle) -> Self {
        Self { base, lock_system }
    }

    pub fn base(&self) -> &Arc<BaseConnection> {
        &self.base
    }
}

#[async_trait]
impl DavBackend for Connection {
    fn id(&self) -> &str {
        self.base.id()
    }

    fn identity(&self) -> &Identity {
        self.base.identity()
    }

    async fn stat(&self, path: &str) -> Result<FileInfo, FsError> {
        self.base.fs().stat(path).await
    }

    async fn open(&self, path: &str) -> Result<FileReader, FsError> {
        self.base.fs().open(path).await
    }

    fn lock_system(&self) -> &LockHandle {
        &self.lock_system
    }
}

pub struct ConnectionRegistry {
    connections: RwLock<HashMap<String, Arc<BaseConnection>>>,
    /// Zero disables the limit.
    max_connections: usize,
}

impl ConnectionRegistry {
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            max_connections,
        }
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    pub fn is_new_connection_allowed(&self) -> bool {
        self.max_connections == 0 || self.len() < self.max_connections
    }

    pub fn add(&self, conn: Arc<BaseConnection>) {
        debug!(connection_id = %conn.id(), user = %conn.username(), "connection added");
        self.connections.write().insert(conn.id().to_string(), conn);
    }

    /// Remove and close. Removing an unknown id is a no-op.
    pub fn remove(&self, id: &str) {
        let removed = self.connections.write().remove(id);
        if let Some(conn) = removed {
            conn.fs().close();
            debug!(connection_id = %id, user = %conn.username(), "connection removed");
        }
    }

    /// Register for the lifetime of the returned guard.
    pub fn register(self: &Arc<Self>, conn: Arc<BaseConnection>) -> ConnectionGuard {
        let id = conn.id().to_string();
        self.add(conn);
        ConnectionGuard {
            registry: Arc::clone(self),
            id,
        }
    }

    pub fn active_sessions(&self, username: &str) -> usize {
        self.connections
            .read()
            .values()
            .filter(|c| c.username() == username)
            .count()
    }

    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, id: &str) -> Option<Arc<BaseConnection>> {
        self.connections.read().get(id).cloned()
    }
}

/// Removes its connection from the registry when dropped, whether the request
/// finished, failed, panicked or was cancelled.
pub struct ConnectionGuard {
    registry: Arc<ConnectionRegistry>,
    id: String,
}

impl ConnectionGuard {
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.registry.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PROTOCOL_WEBDAV;
    use crate::lock::MemLockSystem;
    use crate::testing::MockFs;

    fn conn(id: &str, user: &str, fs: Arc<MockFs>) -> Arc<BaseConnection> {
        Arc::new(BaseConnection::new(
            id,
            PROTOCOL_WEBDAV,
            Identity::named(user),
            fs,
            "10.0.0.1:1234",
        ))
    }

    #[test]
    fn limit_counts_registered_connections() {
        let registry = ConnectionRegistry::new(2);
        assert!(registry.is_new_connection_allowed());
        registry.add(conn("a", "alice", Arc::new(MockFs::default())));
        registry.add(conn("b", "alice", Arc::new(MockFs::default())));
        assert!(!registry.is_new_connection_allowed());
        registry.remove("a");
        assert!(registry.is_new_connection_allowed());
    }

    #[test]
    fn zero_limit_is_unlimited() {
        let registry = ConnectionRegistry::new(0);
        for i in 0..10 {
            registry.add(conn(&format!("c{i}"), "alice", Arc::new(MockFs::default())));
        }
        assert!(registry.is_new_connection_allowed());
    }

    #[test]
    fn active_sessions_per_user() {
        let registry = ConnectionRegistry::new(0);
        registry.add(conn("a", "alice", Arc::new(MockFs::default())));
        registry.add(conn("b", "alice", Arc::new(MockFs::default())));
        registry.add(conn("c", "bob", Arc::new(MockFs::default())));
        assert_eq!(registry.active_sessions("alice"), 2);
        assert_eq!(registry.active_sessions("bob"), 1);
        assert_eq!(registry.active_sessions("carol"), 0);
    }

    #[test]
    fn remove_closes_filesystem() {
        let registry = ConnectionRegistry::new(0);
        let fs = Arc::new(MockFs::default());
        registry.add(conn("a", "alice", fs.clone()));
        registry.remove("a");
        registry.remove("a");
        assert_eq!(fs.close_count(), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn guard_removes_on_drop() {
        let registry = Arc::new(ConnectionRegistry::new(0));
        {
            let guard = registry.register(conn("a", "alice", Arc::new(MockFs::default())));
            assert_eq!(guard.id(), "a");
            assert!(registry.get("a").is_some());
        }
        assert!(registry.get("a").is_none());
    }

    #[test]
    fn guard_removes_on_panic() {
        let registry = Arc::new(ConnectionRegistry::new(0));
        let inner = Arc::clone(&registry);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _guard = inner.register(conn("a", "alice", Arc::new(MockFs::default())));
            panic!("handler blew up");
        }));
        assert!(result.is_err());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn connection_delegates_to_filesystem() {
        let fs = Arc::new(MockFs::default());
        fs.add_dir("/docs");
        let base = conn("a", "alice", fs);
        let connection = Connection::new(base, MemLockSystem::new_handle());
        assert_eq!(DavBackend::id(&connection), "a");
        assert_eq!(connection.identity().username, "alice");
        assert!(connection.stat("/docs").await.unwrap().is_dir);
        assert!(connection.stat("/missing").await.is_err());
    }
}
