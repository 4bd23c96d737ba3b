//! Certificate material for server and client authentication
//!
//! Loads PEM roots and optional client identity with `rustls-pemfile` and
//! builds the rustls client configuration. When no root CA is configured the
//! platform store is used; an empty trust store is an error, never a reason
//! to fall back to an unauthenticated channel.

use super::TransportError;
use rumqttc::tokio_rustls::rustls::{
    pki_types::{CertificateDer, PrivateKeyDer},
    ClientConfig, RootCertStore,
};
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};

/// Where a PEM document comes from
#[derive(Debug, Clone, PartialEq)]
pub enum PemSource {
    File(PathBuf),
    Inline(String),
}

impl PemSource {
    fn read(&self) -> Result<Vec<u8>, TransportError> {
        match self {
            PemSource::File(path) => std::fs::read(path).map_err(|e| {
                TransportError::tls_config(format!("cannot read {}: {e}", path.display()))
            }),
            PemSource::Inline(pem) => Ok(pem.as_bytes().to_vec()),
        }
    }

    fn describe(&self) -> String {
        match self {
            PemSource::File(path) => path.display().to_string(),
            PemSource::Inline(_) => "inline PEM".to_string(),
        }
    }
}

/// Root and client certificate configuration
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrustConfig {
    /// Root CA bundle; `None` selects the platform trust store
    pub root_ca: Option<PemSource>,
    /// Client certificate chain for mutual TLS
    pub client_cert: Option<PemSource>,
    /// Private key matching `client_cert`
    pub client_key: Option<PemSource>,
}

impl TrustConfig {
    /// Trust only the given root CA PEM text
    pub fn with_root_ca_pem<S: Into<String>>(pem: S) -> Self {
        Self {
            root_ca: Some(PemSource::Inline(pem.into())),
            ..Default::default()
        }
    }

    /// Add a client identity from PEM text
    pub fn client_identity_pem<C: Into<String>, K: Into<String>>(mut self, cert: C, key: K) -> Self {
        self.client_cert = Some(PemSource::Inline(cert.into()));
        self.client_key = Some(PemSource::Inline(key.into()));
        self
    }

    /// Build the rustls client configuration
    pub fn build_client_config(&self) -> Result<Arc<ClientConfig>, TransportError> {
        let roots = self.root_store()?;
        let builder = ClientConfig::builder().with_root_certificates(roots);

        let config = match (&self.client_cert, &self.client_key) {
            (Some(cert), Some(key)) => {
                let chain = load_certs(cert)?;
                let key = load_private_key(key)?;
                builder
                    .with_client_auth_cert(chain, key)
                    .map_err(|e| TransportError::tls_config(format!("client identity: {e}")))?
            }
            (None, None) => builder.with_no_client_auth(),
            (Some(_), None) => {
                return Err(TransportError::tls_config(
                    "client certificate configured without a private key",
                ))
            }
            (None, Some(_)) => {
                return Err(TransportError::tls_config(
                    "client private key configured without a certificate",
                ))
            }
        };

        Ok(Arc::new(config))
    }

    fn root_store(&self) -> Result<RootCertStore, TransportError> {
        let mut roots = RootCertStore::empty();

        match &self.root_ca {
            Some(source) => {
                for cert in load_certs(source)? {
                    roots.add(cert).map_err(|e| {
                        TransportError::tls_config(format!(
                            "invalid root certificate in {}: {e}",
                            source.describe()
                        ))
                    })?;
                }
            }
            None => match rustls_native_certs::load_native_certs() {
                Ok(certs) => {
                    let (added, ignored) = roots.add_parsable_certificates(certs);
                    debug!(added, ignored, "Loaded platform trust store");
                }
                Err(e) => warn!("Failed to load platform trust store: {}", e),
            },
        }

        if roots.is_empty() {
            return Err(TransportError::NoTrustAnchors);
        }
        Ok(roots)
    }
}

fn load_certs(source: &PemSource) -> Result<Vec<CertificateDer<'static>>, TransportError> {
    let bytes = source.read()?;
    let mut reader = BufReader::new(bytes.as_slice());
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| {
            TransportError::tls_config(format!("malformed PEM in {}: {e}", source.describe()))
        })?;

    if certs.is_empty() {
        return Err(TransportError::tls_config(format!(
            "no certificates found in {}",
            source.describe()
        )));
    }
    Ok(certs)
}

fn load_private_key(source: &PemSource) -> Result<PrivateKeyDer<'static>, TransportError> {
    let bytes = source.read()?;
    let mut reader = BufReader::new(bytes.as_slice());
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| {
            TransportError::tls_config(format!("malformed key in {}: {e}", source.describe()))
        })?
        .ok_or_else(|| {
            TransportError::tls_config(format!("no private key found in {}", source.describe()))
        })
}
