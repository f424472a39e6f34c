// SPDX-License-Identifier: AGPL-3.0-only
//! CRL-backed revocation authority.

use crate::trust::RevocationAuthority;
use parking_lot::RwLock;
use rustls::pki_types::CertificateDer;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};
use x509_parser::prelude::{ASN1Time, CertificateRevocationList, FromDer, X509Certificate};

#[derive(Debug, Error)]
pub enum RevocationError {
    #[error("unable to read CRL {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid CRL {path}: {reason}")]
    Parse { path: PathBuf, reason: String },
}

/// Revocation lists loaded from disk. Each file may hold PEM or DER data.
#[derive(Debug, Default)]
pub struct CrlStore {
    paths: Vec<PathBuf>,
    crls: RwLock<Vec<Vec<u8>>>,
}

impl CrlStore {
    pub fn load(paths: &[PathBuf]) -> Result<Self, RevocationError> {
        let crls = read_all(paths)?;
        info!(count = crls.len(), "loaded certificate revocation lists");
        Ok(Self {
            paths: paths.to_vec(),
            crls: RwLock::new(crls),
        })
    }

    /// Build from raw DER lists. Such a store has nothing to reload.
    pub fn from_der(crls: Vec<Vec<u8>>) -> Result<Self, RevocationError> {
        for der in &crls {
            validate(Path::new("<memory>"), der)?;
        }
        Ok(Self {
            paths: Vec::new(),
            crls: RwLock::new(crls),
        })
    }

    /// Re-read every configured file. On failure the previous lists stay in
    /// place.
    pub fn reload(&self) -> Result<usize, RevocationError> {
        let crls = read_all(&self.paths)?;
        let count = crls.len();
        *self.crls.write() = crls;
        info!(count, "reloaded certificate revocation lists");
        Ok(count)
    }

    pub fn len(&self) -> usize {
        self.crls.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn read_all(paths: &[PathBuf]) -> Result<Vec<Vec<u8>>, RevocationError> {
    let mut out = Vec::new();
    for path in paths {
        out.extend(read_file(path)?);
    }
    Ok(out)
}

fn read_file(path: &Path) -> Result<Vec<Vec<u8>>, RevocationError> {
    let data = std::fs::read(path).map_err(|source| RevocationError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let pem: Vec<Vec<u8>> = rustls_pemfile::crls(&mut data.as_slice())
        .map(|r| r.map(|crl| crl.as_ref().to_vec()))
        .collect::<Result<_, _>>()
        .map_err(|e| RevocationError::Parse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

    let crls = if pem.is_empty() { vec![data] } else { pem };
    for der in &crls {
        validate(path, der)?;
    }
    Ok(crls)
}

fn validate(path: &Path, der: &[u8]) -> Result<(), RevocationError> {
    CertificateRevocationList::from_der(der)
        .map(|_| ())
        .map_err(|e| RevocationError::Parse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
}

impl RevocationAuthority for CrlStore {
    fn is_revoked(
        &self,
        leaf: Option<&CertificateDer<'_>>,
        anchor: Option<&CertificateDer<'_>>,
    ) -> bool {
        let (Some(leaf), Some(anchor)) = (leaf, anchor) else {
            warn!("revocation check without leaf or issuing certificate");
            return true;
        };
        let Ok((_, leaf)) = X509Certificate::from_der(leaf.as_ref()) else {
            warn!("unable to parse client certificate for revocation check");
            return true;
        };
        let Ok((_, ca)) = X509Certificate::from_der(anchor.as_ref()) else {
            warn!("unable to parse issuing certificate for revocation check");
            return true;
        };

        let now = ASN1Time::now();
        let crls = self.crls.read();
        for der in crls.iter() {
            let Ok((_, crl)) = CertificateRevocationList::from_der(der) else {
                continue;
            };
            if crl.next_update().is_some_and(|next| next < now) {
                debug!(issuer = %crl.issuer(), "skipping expired CRL");
                continue;
            }
            if crl.verify_signature(ca.public_key()).is_err() {
                continue;
            }
            if crl
                .iter_revoked_certificates()
                .any(|revoked| revoked.raw_serial() == leaf.raw_serial())
            {
                return true;
            }
        }
        false
    }
}
