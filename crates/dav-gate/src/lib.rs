// SPDX-License-Identifier: AGPL-3.0-only
//! Authentication, TLS trust and admission gate for WebDAV requests.
//!
//! Every inbound request passes through the [`DavGate`] before any file
//! operation is attempted:
//!
//! - the TLS client certificate is checked against the configured
//!   revocation authority at handshake time ([`TrustVerifier`]);
//! - the connection is admitted (global limit, ban list, post-connect hook);
//! - HTTP Basic credentials are resolved to an [`Identity`], served from the
//!   [`CredentialCache`] when possible;
//! - per-identity policy is enforced (home dir, protocol, login method,
//!   session quota, mapped folder overlap, source address);
//! - directory GET/HEAD requests are rewritten into shallow listings.
//!
//! Collaborators that live outside this crate (identity store, filesystem
//! backends, ban list, hooks, metrics, the WebDAV engine itself) are reached
//! through the traits re-exported here.

pub mod admission;
pub mod auth;
pub mod cache;
pub mod defender;
pub mod error;
pub mod fs;
pub mod gate;
pub mod hooks;
pub mod identity;
pub mod lock;
pub mod outcome;
pub mod preprocess;
pub mod registry;
pub mod revocation;
pub mod trust;

#[cfg(test)]
mod testing;

pub use admission::{AdmissionController, Rejected, new_connection_id};
pub use auth::{Authenticated, Authenticator, BasicCredentials, UsersCacheConfig, basic_credentials};
pub use cache::{CachedCredential, CredentialCache};
pub use defender::{Defender, DefenderConfig, HostEvent, MemoryDefender};
pub use error::{
    AdmissionError, AuthError, CONNECTION_DENIED, ConnectionError, GENERIC_FAILURE, GateError,
    TrustError, UNAUTHORIZED,
};
pub use fs::{
    FileInfo, FileReader, Filesystem, FilesystemFactory, FsError, LocalFilesystem,
    LocalFilesystemFactory, clean_path,
};
pub use gate::{DavGate, DavHandler, GateConfig, GateServices, ip_from_remote_address};
pub use hooks::{HookError, Hooks, NoopHooks};
pub use identity::{FsProvider, Identity, IdentityProvider, LoginMethod, ProviderError, VirtualFolder};
pub use lock::{LockDetails, LockError, LockHandle, MemLockSystem};
pub use outcome::{GateMetrics, NoopMetrics, OutcomeReporter};
pub use preprocess::{maybe_rewrite, multistatus_head_response};
pub use registry::{BaseConnection, Connection, ConnectionGuard, ConnectionRegistry, DavBackend};
pub use revocation::{CrlStore, RevocationError};
pub use trust::{PeerTlsState, RevocationAuthority, TrustVerifier, subject_name};

/// Protocol tag used for connection ids, hooks and audit records.
pub const PROTOCOL_WEBDAV: &str = "DAV";
