// SPDX-License-Identifier: AGPL-3.0-only
//! Revocation check over the verified chains of a TLS client certificate.

use crate::error::TrustError;
use rustls::pki_types::CertificateDer;
use std::sync::Arc;
use tracing::{debug, warn};
use x509_parser::prelude::{FromDer, X509Certificate};

/// Answers whether a leaf certificate was revoked by the given anchor.
///
/// Implementations must fail closed: a missing leaf or anchor is revoked.
pub trait RevocationAuthority: Send + Sync {
    fn is_revoked(
        &self,
        leaf: Option<&CertificateDer<'_>>,
        anchor: Option<&CertificateDer<'_>>,
    ) -> bool;
}

/// What the handshake left behind about the client.
#[derive(Debug, Clone, Default)]
pub struct PeerTlsState {
    pub peer_certificates: Vec<CertificateDer<'static>>,
    /// Each chain runs leaf first, trust anchor last.
    pub verified_chains: Vec<Vec<CertificateDer<'static>>>,
}

#[derive(Clone, Default)]
pub struct TrustVerifier {
    authority: Option<Arc<dyn RevocationAuthority>>,
}

impl TrustVerifier {
    pub fn new(authority: Option<Arc<dyn RevocationAuthority>>) -> Self {
        Self { authority }
    }

    pub fn disabled() -> Self {
        Self { authority: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.authority.is_some()
    }

    /// Reject when no chain could be built, or when the leaf is revoked under
    /// any of the chains. Without an authority every state is accepted.
    pub fn verify(&self, state: &PeerTlsState) -> Result<(), TrustError> {
        let Some(authority) = &self.authority else {
            return Ok(());
        };

        if state.verified_chains.is_empty() {
            warn!("TLS connection cannot be verified: unable to get verification chain");
            return Err(TrustError::ChainUnverifiable);
        }

        for chain in &state.verified_chains {
            let leaf = chain.first();
            let anchor = chain.last();
            if let Some(leaf) = leaf {
                debug!(subject = %subject_name(leaf), "checking revocation for client certificate");
            }
            if authority.is_revoked(leaf, anchor) {
                let subject = leaf.map(subject_name).unwrap_or_default();
                debug!(subject = %subject, "client certificate revoked");
                return Err(TrustError::CertificateRevoked);
            }
        }
        Ok(())
    }
}

/// Subject DN of a certificate, or an empty string when it does not parse.
pub fn subject_name(cert: &CertificateDer<'_>) -> String {
    X509Certificate::from_der(cert.as_ref())
        .map(|(_, parsed)| parsed.subject().to_string())
        .unwrap_or_default()
}
