// SPDX-License-Identifier: AGPL-3.0-only
//! Bounded, expiring cache of verified credentials.

use crate::identity::Identity;
use crate::lock::LockHandle;
use lru::LruCache;
use parking_lot::Mutex;
use std::time::SystemTime;

/// A previously verified identity together with the password that proved it.
#[derive(Debug, Clone)]
pub struct CachedCredential {
    pub identity: Identity,
    pub password: String,
    pub lock_system: LockHandle,
    /// `None` means the entry never expires.
    pub expiration: Option<SystemTime>,
}

impl CachedCredential {
    pub fn is_expired(&self) -> bool {
        self.expiration
            .is_some_and(|exp| exp <= SystemTime::now())
    }

    pub fn username(&self) -> &str {
        &self.identity.username
    }
}

/// Keyed by username. Eviction picks expired entries first, then the least
/// recently used ones.
pub struct CredentialCache {
    entries: Mutex<LruCache<String, CachedCredential>>,
}

impl Default for CredentialCache {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialCache {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(LruCache::unbounded()),
        }
    }

    /// Returns the entry when present and unexpired. An expired entry is
    /// dropped on the way out.
    pub fn get(&self, username: &str) -> Option<CachedCredential> {
        let mut entries = self.entries.lock();
        let expired = entries.get(username)?.is_expired();
        if expired {
            entries.pop(username);
            return None;
        }
        entries.get(username).cloned()
    }

    /// Insert or replace an entry, then shrink to `max_size` when it is
    /// nonzero.
    pub fn put(&self, credential: CachedCredential, max_size: usize) {
        let mut entries = self.entries.lock();
        entries.put(credential.identity.username.clone(), credential);
        if max_size == 0 || entries.len() <= max_size {
            return;
        }

        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, c)| c.is_expired())
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            entries.pop(&key);
        }
        while entries.len() > max_size {
            if entries.pop_lru().is_none() {
                break;
            }
        }
    }

    pub fn remove(&self, username: &str) -> Option<CachedCredential> {
        self.entries.lock().pop(username)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}
