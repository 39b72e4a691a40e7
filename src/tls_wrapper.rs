use std::sync::Arc;
use std::time::SystemTime;

use rustls::client::{ServerCertVerified, ServerCertVerifier};
use rustls::{Certificate, ClientConfig, RootCertStore, ServerName};
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use crate::config::TrustPolicy;

#[derive(Debug, thiserror::Error)]
pub enum TlsSetupError {
    #[error("unable to load platform certificates: {0}")]
    NativeCerts(#[source] std::io::Error),
    #[error("invalid trust anchor: {0}")]
    TrustAnchor(#[source] rustls::Error),
    #[error("invalid TLS server name {0:?}")]
    ServerName(String),
}

/// TLS client side of the tunnel, built once per trust policy
pub struct TlsWrapper {
    config: Arc<ClientConfig>,
    verifies_peer: bool,
}

impl TlsWrapper {
    pub fn new(policy: &TrustPolicy) -> Result<Self, TlsSetupError> {
        let builder = ClientConfig::builder().with_safe_defaults();

        let config = if policy.verify_certificate {
            builder
                .with_root_certificates(Self::root_store(policy)?)
                .with_no_client_auth()
        } else {
            warn!("TLS certificate verification disabled, only use for testing");
            builder
                .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate))
                .with_no_client_auth()
        };

        Ok(Self {
            config: Arc::new(config),
            verifies_peer: policy.verify_certificate,
        })
    }

    fn root_store(policy: &TrustPolicy) -> Result<RootCertStore, TlsSetupError> {
        let mut root_store = RootCertStore::empty();

        if policy.use_native_roots {
            let native_certs =
                rustls_native_certs::load_native_certs().map_err(TlsSetupError::NativeCerts)?;
            let (added, ignored) = root_store.add_parsable_certificates(
                &native_certs.into_iter().map(|c| c.0).collect::<Vec<_>>(),
            );
            debug!(added, ignored, "loaded platform trust anchors");
        }

        for der in &policy.extra_root_certificates {
            root_store
                .add(&Certificate(der.clone()))
                .map_err(TlsSetupError::TrustAnchor)?;
        }

        Ok(root_store)
    }

    pub fn verifies_peer(&self) -> bool {
        self.verifies_peer
    }

    pub fn connector(&self) -> TlsConnector {
        TlsConnector::from(self.config.clone())
    }

    pub fn server_name(name: &str) -> Result<ServerName, TlsSetupError> {
        ServerName::try_from(name).map_err(|_| TlsSetupError::ServerName(name.to_string()))
    }
}

/// Whether a failed handshake was caused by the certificate not matching the
/// expected host.
pub fn is_identity_mismatch(err: &std::io::Error) -> bool {
    matches!(
        err.get_ref().and_then(|inner| inner.downcast_ref::<rustls::Error>()),
        Some(rustls::Error::InvalidCertificate(
            rustls::CertificateError::NotValidForName
        ))
    )
}

/// Verifier installed when the caller opts out of certificate checks
struct AcceptAnyCertificate;

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}
