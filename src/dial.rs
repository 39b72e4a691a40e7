use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::{TransportConfig, TrustPolicy, DEFAULT_UPGRADE_PROTOCOL};
use crate::credentials::{CredentialError, CredentialProvider, NoCredentials};
use crate::handshake::{read_response_head, HandshakeError, UpgradeRequest, UpgradeResponse};
use crate::target::TargetAddress;
use crate::tls_wrapper::{is_identity_mismatch, TlsSetupError, TlsWrapper};
use crate::transport::{TunnelConnection, TunnelStream};

/// Dial step that ran out of time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialStage {
    Connect,
    TlsHandshake,
    ResponseHeader,
}

impl std::fmt::Display for DialStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DialStage::Connect => write!(f, "connect"),
            DialStage::TlsHandshake => write!(f, "TLS handshake"),
            DialStage::ResponseHeader => write!(f, "response header"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DialError {
    #[error("URL {url:?} has no host")]
    MissingHost { url: String },
    #[error(transparent)]
    Credentials(#[from] CredentialError),
    #[error("TLS setup failed: {0}")]
    TlsSetup(#[from] TlsSetupError),
    #[error("{stage} with {addr} timed out after {after:?}")]
    Timeout {
        stage: DialStage,
        addr: String,
        after: Duration,
    },
    #[error("unable to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("TLS handshake with {addr} failed: {source}")]
    TlsHandshake {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("certificate presented by {addr} is not valid for {host}")]
    TlsIdentity {
        addr: String,
        host: String,
        #[source]
        source: io::Error,
    },
    #[error("unable to send upgrade request to {addr}: {source}")]
    Write {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("unable to read upgrade response from {addr}: {source}")]
    Read {
        addr: String,
        #[source]
        source: HandshakeError,
    },
    #[error("{addr} refused the upgrade: {status} {reason}")]
    UpgradeRejected {
        addr: String,
        status: u16,
        reason: String,
    },
}

/// Opens tunnels by sending an HTTP upgrade request and keeping the socket
pub struct Dialer {
    transport: TransportConfig,
    trust: TrustPolicy,
    credentials: Arc<dyn CredentialProvider>,
    protocol: String,
}

impl Dialer {
    pub fn new(transport: TransportConfig, trust: TrustPolicy) -> Self {
        Self {
            transport,
            trust,
            credentials: Arc::new(NoCredentials),
            protocol: DEFAULT_UPGRADE_PROTOCOL.to_string(),
        }
    }

    pub fn with_credentials(mut self, credentials: Arc<dyn CredentialProvider>) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = protocol.into();
        self
    }

    pub async fn dial(&self, url: &Url) -> Result<TunnelConnection, DialError> {
        let target = TargetAddress::from_url(url)?;
        let addr = target.host_port().to_string();

        let mut request = UpgradeRequest::new(url, &self.protocol);
        if let Some(credential) = self.credentials.credential(url).await? {
            debug!(?credential, "attaching credential to upgrade request");
            request = request.with_credential(&credential);
        }

        let tcp = self.connect(&addr).await?;
        let remote_addr = tcp.peer_addr().map_err(|source| DialError::Connect {
            addr: addr.clone(),
            source,
        })?;
        debug!(%remote_addr, "transport connected");

        let mut stream = if target.is_encrypted() {
            self.tls_handshake(&target, tcp).await?
        } else {
            TunnelStream::Plain(tcp)
        };

        if let Err(source) = write_request(&mut stream, &request).await {
            warn!(%remote_addr, error = %source, "error writing upgrade request");
            return Err(DialError::Write { addr, source });
        }

        let (head, leftover) = match with_timeout(
            self.transport.response_header_timeout,
            read_response_head(&mut stream, self.transport.max_response_header_bytes),
        )
        .await
        {
            Some(Ok(read)) => read,
            Some(Err(source)) => {
                warn!(%remote_addr, error = %source, "error reading upgrade response");
                return Err(DialError::Read { addr, source });
            }
            None => {
                return Err(DialError::Timeout {
                    stage: DialStage::ResponseHeader,
                    addr,
                    after: self.transport.response_header_timeout.unwrap_or_default(),
                })
            }
        };
        let response = UpgradeResponse::parse(&head)
            .map_err(|source| DialError::Read { addr: addr.clone(), source })?;
        debug!(status = response.status, headers = ?response.headers, "response headers");

        if !response.accepts_upgrade(&self.protocol) {
            if let Err(err) = stream.shutdown().await {
                debug!(error = %err, "closing rejected connection");
            }
            return Err(DialError::UpgradeRejected {
                addr,
                status: response.status,
                reason: response.reason,
            });
        }

        info!(%remote_addr, tls = stream.is_tls(), "tunnel established");
        Ok(TunnelConnection::new(stream, leftover, remote_addr, response))
    }

    async fn connect(&self, addr: &str) -> Result<TcpStream, DialError> {
        let after = self.transport.connect_timeout;
        let tcp = match tokio::time::timeout(after, TcpStream::connect(addr)).await {
            Ok(Ok(tcp)) => tcp,
            Ok(Err(source)) => {
                return Err(DialError::Connect {
                    addr: addr.to_string(),
                    source,
                })
            }
            Err(_) => {
                return Err(DialError::Timeout {
                    stage: DialStage::Connect,
                    addr: addr.to_string(),
                    after,
                })
            }
        };

        if self.transport.tcp_nodelay {
            if let Err(err) = tcp.set_nodelay(true) {
                debug!(error = %err, "unable to set TCP_NODELAY");
            }
        }
        if let Some(idle) = self.transport.tcp_keepalive {
            let keepalive = TcpKeepalive::new().with_time(idle);
            if let Err(err) = SockRef::from(&tcp).set_tcp_keepalive(&keepalive) {
                debug!(error = %err, "unable to enable TCP keepalive");
            }
        }
        Ok(tcp)
    }

    async fn tls_handshake(
        &self,
        target: &TargetAddress,
        tcp: TcpStream,
    ) -> Result<TunnelStream, DialError> {
        let addr = target.host_port().to_string();
        let wrapper = TlsWrapper::new(&self.trust)?;
        let server_name = TlsWrapper::server_name(target.tls_server_name())?;

        let handshake = wrapper.connector().connect(server_name, tcp);
        match with_timeout(self.transport.tls_handshake_timeout, handshake).await {
            Some(Ok(tls)) => Ok(TunnelStream::Tls(Box::new(tls))),
            Some(Err(source)) if wrapper.verifies_peer() && is_identity_mismatch(&source) => {
                Err(DialError::TlsIdentity {
                    addr,
                    host: target.host_only().to_string(),
                    source,
                })
            }
            Some(Err(source)) => Err(DialError::TlsHandshake { addr, source }),
            None => Err(DialError::Timeout {
                stage: DialStage::TlsHandshake,
                addr,
                after: self.transport.tls_handshake_timeout.unwrap_or_default(),
            }),
        }
    }
}

async fn write_request(stream: &mut TunnelStream, request: &UpgradeRequest) -> io::Result<()> {
    stream.write_all(&request.to_bytes()).await?;
    stream.flush().await
}

/// `None` when `limit` elapsed first
async fn with_timeout<F: Future>(limit: Option<Duration>, fut: F) -> Option<F::Output> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut).await.ok(),
        None => Some(fut.await),
    }
}
