// SPDX-License-Identifier: AGPL-3.0-only
//! rustls server configuration with client certificate revocation checks.

use crate::config::ClientAuth;
use crate::metrics::metrics;
use anyhow::{Context, Result, bail};
use rustls::client::danger::HandshakeSignatureValid;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, UnixTime};
use rustls::server::WebPkiClientVerifier;
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{CertificateError, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};
use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use usg_dav_gate::{PeerTlsState, TrustError, TrustVerifier};
use x509_parser::prelude::{FromDer, X509Certificate};

/// Delegates chain and signature validation to webpki, then runs the
/// revocation check over every chain that ends in a configured anchor.
pub struct RevocationCheckingVerifier {
    inner: Arc<dyn ClientCertVerifier>,
    anchors: Vec<CertificateDer<'static>>,
    trust: TrustVerifier,
}

impl fmt::Debug for RevocationCheckingVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RevocationCheckingVerifier")
            .field("anchors", &self.anchors.len())
            .field("revocation", &self.trust.is_enabled())
            .finish()
    }
}

impl RevocationCheckingVerifier {
    pub fn new(
        inner: Arc<dyn ClientCertVerifier>,
        anchors: Vec<CertificateDer<'static>>,
        trust: TrustVerifier,
    ) -> Self {
        Self {
            inner,
            anchors,
            trust,
        }
    }

    /// Chains from the presented path to each anchor that issued one of its
    /// certificates. Leaf first, anchor last.
    fn verified_chains(
        &self,
        presented: &[CertificateDer<'static>],
    ) -> Vec<Vec<CertificateDer<'static>>> {
        let mut chains = Vec::new();
        for anchor in &self.anchors {
            let Ok((_, parsed_anchor)) = X509Certificate::from_der(anchor.as_ref()) else {
                continue;
            };
            for (i, cert) in presented.iter().enumerate() {
                if cert == anchor {
                    chains.push(presented[..=i].to_vec());
                    break;
                }
                let Ok((_, parsed)) = X509Certificate::from_der(cert.as_ref()) else {
                    break;
                };
                if parsed.issuer().as_raw() == parsed_anchor.subject().as_raw() {
                    let mut chain = presented[..=i].to_vec();
                    chain.push(anchor.clone());
                    chains.push(chain);
                    break;
                }
            }
        }
        chains
    }
}

fn failure_reason(err: &TrustError) -> &'static str {
    match err {
        TrustError::ChainUnverifiable => "chain_unverifiable",
        TrustError::CertificateRevoked => "revoked",
    }
}

fn to_rustls_error(err: &TrustError) -> rustls::Error {
    match err {
        TrustError::ChainUnverifiable => {
            rustls::Error::InvalidCertificate(CertificateError::UnknownIssuer)
        }
        TrustError::CertificateRevoked => {
            rustls::Error::InvalidCertificate(CertificateError::Revoked)
        }
    }
}

impl ClientCertVerifier for RevocationCheckingVerifier {
    fn offer_client_auth(&self) -> bool {
        self.inner.offer_client_auth()
    }

    fn client_auth_mandatory(&self) -> bool {
        self.inner.client_auth_mandatory()
    }

    fn root_hint_subjects(&self) -> &[rustls::DistinguishedName] {
        self.inner.root_hint_subjects()
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> std::result::Result<ClientCertVerified, rustls::Error> {
        if let Err(e) = self.inner.verify_client_cert(end_entity, intermediates, now) {
            metrics()
                .tls_verification_failures_total
                .with_label_values(&["untrusted"])
                .inc();
            return Err(e);
        }

        let mut presented = Vec::with_capacity(intermediates.len() + 1);
        presented.push(end_entity.clone().into_owned());
        presented.extend(intermediates.iter().map(|c| c.clone().into_owned()));

        let state = PeerTlsState {
            verified_chains: self.verified_chains(&presented),
            peer_certificates: presented,
        };
        self.trust.verify(&state).map_err(|err| {
            metrics()
                .tls_verification_failures_total
                .with_label_values(&[failure_reason(&err)])
                .inc();
            to_rustls_error(&err)
        })?;
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

pub struct TlsSettings<'a> {
    pub cert: &'a Path,
    pub key: &'a Path,
    pub client_ca: &'a [PathBuf],
    pub client_auth: ClientAuth,
    pub trust: TrustVerifier,
}

pub fn build_tls_config(settings: TlsSettings<'_>) -> Result<ServerConfig> {
    let certs = load_certs(settings.cert)?;
    let key = load_key(settings.key)?;
    let builder = ServerConfig::builder_with_protocol_versions(&[
        &rustls::version::TLS12,
        &rustls::version::TLS13,
    ]);

    let mut config = match settings.client_auth {
        ClientAuth::None => builder
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .context("building TLS config")?,
        ClientAuth::Require => {
            let mut roots = RootCertStore::empty();
            let mut anchors = Vec::new();
            for path in settings.client_ca {
                for ca in load_certs(path)? {
                    roots
                        .add(ca.clone())
                        .with_context(|| format!("adding client CA from {}", path.display()))?;
                    anchors.push(ca);
                }
            }
            let inner = WebPkiClientVerifier::builder(roots.into())
                .build()
                .context("building client verifier")?;
            let verifier = RevocationCheckingVerifier::new(inner, anchors, settings.trust);
            builder
                .with_client_cert_verifier(Arc::new(verifier))
                .with_single_cert(certs, key)
                .context("building TLS config")?
        }
    };

    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(config)
}

pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(
        File::open(path).with_context(|| format!("opening certificate {}", path.display()))?,
    );
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
        .collect::<Result<_, _>>()
        .with_context(|| format!("reading certificates from {}", path.display()))?;
    if certs.is_empty() {
        bail!("no certificates found in {}", path.display());
    }
    Ok(certs)
}

pub fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(
        File::open(path).with_context(|| format!("opening private key {}", path.display()))?,
    );
    if let Some(key) = rustls_pemfile::private_key(&mut reader)
        .with_context(|| format!("reading private key {}", path.display()))?
    {
        Ok(key)
    } else {
        bail!("no private key found in {}", path.display());
    }
}
