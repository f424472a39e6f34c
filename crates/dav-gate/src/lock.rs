// SPDX-License-Identifier: AGPL-3.0-only
//! In-memory WebDAV lock registry.
//!
//! One instance is created per successful full verification and handed back
//! on cache hits, so every session of the same cached identity shares the
//! same lock state.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use uuid::Uuid;

/// Shared handle to a lock registry.
pub type LockHandle = Arc<MemLockSystem>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockDetails {
    /// Cleaned absolute path of the locked resource.
    pub root: String,
    pub owner: String,
    /// Depth 0 locks cover only `root`, otherwise descendants are locked too.
    pub zero_depth: bool,
    /// `None` means the lock never expires.
    pub duration: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockError {
    #[error("resource is locked")]
    Locked,
    #[error("no such lock")]
    NoSuchLock,
}

#[derive(Debug, Clone)]
struct ActiveLock {
    details: LockDetails,
    expires_at: Option<Instant>,
}

impl ActiveLock {
    fn expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    fn covers(&self, path: &str) -> bool {
        let root = self.details.root.as_str();
        root == path || (!self.details.zero_depth && is_descendant(root, path))
    }
}

#[derive(Debug, Default)]
pub struct MemLockSystem {
    locks: Mutex<HashMap<String, ActiveLock>>,
}

impl MemLockSystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_handle() -> LockHandle {
        Arc::new(Self::new())
    }

    /// Create a lock and return its token.
    pub fn lock(&self, details: LockDetails) -> Result<String, LockError> {
        let now = Instant::now();
        let mut locks = self.locks.lock();
        locks.retain(|_, l| !l.expired(now));

        let conflict = locks.values().any(|held| {
            held.covers(&details.root)
                || (!details.zero_depth && is_descendant(&details.root, &held.details.root))
        });
        if conflict {
            return Err(LockError::Locked);
        }

        let token = format!("opaquelocktoken:{}", Uuid::new_v4());
        let expires_at = details.duration.map(|d| now + d);
        locks.insert(
            token.clone(),
            ActiveLock {
                details,
                expires_at,
            },
        );
        Ok(token)
    }

    pub fn refresh(&self, token: &str, duration: Option<Duration>) -> Result<LockDetails, LockError> {
        let now = Instant::now();
        let mut locks = self.locks.lock();
        locks.retain(|_, l| !l.expired(now));
        let held = locks.get_mut(token).ok_or(LockError::NoSuchLock)?;
        held.details.duration = duration;
        held.expires_at = duration.map(|d| now + d);
        Ok(held.details.clone())
    }

    pub fn unlock(&self, token: &str) -> Result<(), LockError> {
        let now = Instant::now();
        let mut locks = self.locks.lock();
        locks.retain(|_, l| !l.expired(now));
        locks.remove(token).map(|_| ()).ok_or(LockError::NoSuchLock)
    }

    /// True when some live lock covers `path`.
    pub fn is_locked(&self, path: &str) -> bool {
        let now = Instant::now();
        self.locks
            .lock()
            .values()
            .any(|held| !held.expired(now) && held.covers(path))
    }

    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.locks.lock().values().filter(|l| !l.expired(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn is_descendant(root: &str, path: &str) -> bool {
    if root == "/" {
        return path != "/";
    }
    path.len() > root.len() && path.starts_with(root) && path.as_bytes()[root.len()] == b'/'
}
