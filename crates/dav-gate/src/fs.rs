// SPDX-License-Identifier: AGPL-3.0-only
//! Filesystem capability handed to each connection, and the local backend.

use crate::identity::{FsProvider, Identity};
use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use thiserror::Error;
use tokio::io::AsyncRead;
use tracing::{debug, warn};

pub type FileReader = Box<dyn AsyncRead + Send + Unpin>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub name: String,
    pub size: u64,
    pub is_dir: bool,
    pub modified: Option<SystemTime>,
}

#[derive(Debug, Error)]
pub enum FsError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid path: {0}")]
    InvalidPath(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("filesystem unavailable: {0}")]
    Unavailable(String),
}

/// Per-connection view of an identity's storage. Paths are WebDAV paths
/// relative to the identity's root, always starting with `/`.
#[async_trait]
pub trait Filesystem: Send + Sync {
    fn name(&self) -> &str;

    async fn stat(&self, path: &str) -> Result<FileInfo, FsError>;

    async fn open(&self, path: &str) -> Result<FileReader, FsError>;

    /// Make sure the root exists and is owned by `uid`/`gid` when those are
    /// nonzero. Returns false when that could not be done.
    async fn check_root_path(&self, username: &str, uid: u32, gid: u32) -> bool;

    fn close(&self) {}
}

/// Opens a [`Filesystem`] for an identity. One connection id, one handle.
#[async_trait]
pub trait FilesystemFactory: Send + Sync {
    async fn open(
        &self,
        identity: &Identity,
        connection_id: &str,
    ) -> Result<std::sync::Arc<dyn Filesystem>, FsError>;
}

/// Lexically clean a WebDAV path: collapse `//`, resolve `.` and `..`, and
/// always return an absolute path.
pub fn clean_path(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            s => parts.push(s),
        }
    }
    format!("/{}", parts.join("/"))
}

pub struct LocalFilesystem {
    root: PathBuf,
    connection_id: String,
}

impl LocalFilesystem {
    pub fn new(root: impl Into<PathBuf>, connection_id: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            connection_id: connection_id.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let cleaned = clean_path(path);
        let relative = cleaned.trim_start_matches('/');
        if relative.is_empty() {
            self.root.clone()
        } else {
            self.root.join(relative)
        }
    }
}

fn map_io(path: &str, err: io::Error) -> FsError {
    if err.kind() == io::ErrorKind::NotFound {
        FsError::NotFound(path.to_string())
    } else {
        FsError::Io(err)
    }
}

#[async_trait]
impl Filesystem for LocalFilesystem {
    fn name(&self) -> &str {
        FsProvider::Local.as_str()
    }

    async fn stat(&self, path: &str) -> Result<FileInfo, FsError> {
        let full = self.resolve(path);
        let meta = tokio::fs::metadata(&full)
            .await
            .map_err(|e| map_io(path, e))?;
        let name = full
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "/".to_string());
        Ok(FileInfo {
            name,
            size: meta.len(),
            is_dir: meta.is_dir(),
            modified: meta.modified().ok(),
        })
    }

    async fn open(&self, path: &str) -> Result<FileReader, FsError> {
        let full = self.resolve(path);
        let file = tokio::fs::File::open(&full)
            .await
            .map_err(|e| map_io(path, e))?;
        Ok(Box::new(file))
    }

    async fn check_root_path(&self, username: &str, uid: u32, gid: u32) -> bool {
        if let Err(e) = tokio::fs::create_dir_all(&self.root).await {
            warn!(
                user = %username,
                root = %self.root.display(),
                error = %e,
                "unable to create root path"
            );
            return false;
        }
        if uid == 0 && gid == 0 {
            return true;
        }
        set_owner(&self.root, username, uid, gid)
    }

    fn close(&self) {
        debug!(connection_id = %self.connection_id, "local filesystem closed");
    }
}

#[cfg(unix)]
fn set_owner(root: &Path, username: &str, uid: u32, gid: u32) -> bool {
    let uid = (uid != 0).then_some(uid);
    let gid = (gid != 0).then_some(gid);
    match std::os::unix::fs::chown(root, uid, gid) {
        Ok(()) => true,
        Err(e) => {
            warn!(user = %username, root = %root.display(), error = %e, "unable to set root path owner");
            false
        }
    }
}

#[cfg(not(unix))]
fn set_owner(_root: &Path, _username: &str, _uid: u32, _gid: u32) -> bool {
    true
}

/// Serves identities whose storage is a local directory.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFilesystemFactory;

#[async_trait]
impl FilesystemFactory for LocalFilesystemFactory {
    async fn open(
        &self,
        identity: &Identity,
        connection_id: &str,
    ) -> Result<std::sync::Arc<dyn Filesystem>, FsError> {
        match identity.fs_provider {
            FsProvider::Local => {
                if !identity.home_dir.is_absolute() {
                    return Err(FsError::InvalidPath(identity.home_dir.display().to_string()));
                }
                Ok(std::sync::Arc::new(LocalFilesystem::new(
                    identity.home_dir.clone(),
                    connection_id,
                )))
            }
            other => Err(FsError::Unavailable(format!(
                "{} storage is not supported by this server",
                other.as_str()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    #[test]
    fn clean_path_normalizes() {
        assert_eq!(clean_path(""), "/");
        assert_eq!(clean_path("/"), "/");
        assert_eq!(clean_path("docs"), "/docs");
        assert_eq!(clean_path("/docs//sub/"), "/docs/sub");
        assert_eq!(clean_path("/docs/./sub/../file"), "/docs/file");
        assert_eq!(clean_path("/../../etc/passwd"), "/etc/passwd");
    }

    #[tokio::test]
    async fn stat_and_open_under_root() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("docs")).unwrap();
        std::fs::write(dir.path().join("docs/a.txt"), b"hello").unwrap();
        let fs = LocalFilesystem::new(dir.path(), "DAV_test");

        let info = fs.stat("/docs").await.unwrap();
        assert!(info.is_dir);
        assert_eq!(info.name, "docs");

        let info = fs.stat("/docs/a.txt").await.unwrap();
        assert!(!info.is_dir);
        assert_eq!(info.size, 5);

        let mut reader = fs.open("/docs/a.txt").await.unwrap();
        let mut body = String::new();
        reader.read_to_string(&mut body).await.unwrap();
        assert_eq!(body, "hello");
    }

    #[tokio::test]
    async fn stat_missing_is_not_found() {
        let dir = TempDir::new().unwrap();
        let fs = LocalFilesystem::new(dir.path(), "DAV_test");
        assert!(matches!(fs.stat("/nope").await, Err(FsError::NotFound(_))));
    }

    #[tokio::test]
    async fn traversal_stays_under_root() {
        let dir = TempDir::new().unwrap();
        let fs = LocalFilesystem::new(dir.path().join("home"), "DAV_test");
        assert_eq!(fs.resolve("/../../etc"), dir.path().join("home").join("etc"));
        assert_eq!(fs.resolve("/"), dir.path().join("home"));
    }

    #[tokio::test]
    async fn check_root_path_creates_missing_root() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("alice");
        let fs = LocalFilesystem::new(&root, "DAV_test");
        assert!(fs.check_root_path("alice", 0, 0).await);
        assert!(root.is_dir());
    }

    #[tokio::test]
    async fn factory_rejects_remote_providers() {
        let identity = Identity {
            home_dir: "/srv/alice".into(),
            fs_provider: FsProvider::S3,
            ..Identity::named("alice")
        };
        let result = LocalFilesystemFactory.open(&identity, "DAV_x").await;
        assert!(matches!(result, Err(FsError::Unavailable(_))));
    }

    #[tokio::test]
    async fn factory_opens_local_home() {
        let dir = TempDir::new().unwrap();
        let identity = Identity {
            home_dir: dir.path().to_path_buf(),
            ..Identity::named("alice")
        };
        let fs = LocalFilesystemFactory.open(&identity, "DAV_x").await.unwrap();
        assert_eq!(fs.name(), "local");
        assert!(fs.stat("/").await.unwrap().is_dir);
    }
}
