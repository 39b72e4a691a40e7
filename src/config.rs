use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use url::Url;

/// Protocol token sent in the `Upgrade` header and used as the request method.
pub const DEFAULT_UPGRADE_PROTOCOL: &str = "rsync";

/// Top-level configuration for one tunnel session
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    pub url: Url,
    pub upgrade_protocol: String,
    pub transport: TransportConfig,
    pub trust: TrustPolicy,
    pub bridge: BridgeConfig,
}

impl TunnelConfig {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            upgrade_protocol: DEFAULT_UPGRADE_PROTOCOL.to_string(),
            transport: TransportConfig::default(),
            trust: TrustPolicy::default(),
            bridge: BridgeConfig::default(),
        }
    }
}

/// Limits and socket options applied while dialing the tunnel
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub connect_timeout: Duration,
    pub tls_handshake_timeout: Option<Duration>,
    pub response_header_timeout: Option<Duration>,
    pub max_response_header_bytes: usize,
    pub tcp_nodelay: bool,
    pub tcp_keepalive: Option<Duration>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            tls_handshake_timeout: Some(Duration::from_secs(30)),
            response_header_timeout: Some(Duration::from_secs(30)),
            max_response_header_bytes: 8 * 1024,
            tcp_nodelay: true,
            tcp_keepalive: Some(Duration::from_secs(60)),
        }
    }
}

/// Controls whether the peer certificate and its identity are checked.
///
/// The expected identity is not stored here: it is always the bare host of
/// the target URL.
#[derive(Debug, Clone)]
pub struct TrustPolicy {
    pub verify_certificate: bool,
    pub use_native_roots: bool,
    /// DER-encoded certificates trusted in addition to the platform store.
    pub extra_root_certificates: Vec<Vec<u8>>,
}

impl TrustPolicy {
    pub fn insecure() -> Self {
        Self {
            verify_certificate: false,
            ..Self::default()
        }
    }

    pub fn with_root_certificate(mut self, der: Vec<u8>) -> Self {
        self.extra_root_certificates.push(der);
        self
    }
}

impl Default for TrustPolicy {
    fn default() -> Self {
        Self {
            verify_certificate: true,
            use_native_roots: true,
            extra_root_certificates: Vec::new(),
        }
    }
}

/// Local bridge listener behavior
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub bind_address: IpAddr,
    pub accept_timeout: Option<Duration>,
    pub idle_timeout: Option<Duration>,
    pub chunk_size: usize,
    /// How long the bridge may keep running once the tool has exited.
    pub drain_timeout: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            accept_timeout: None,
            idle_timeout: None,
            chunk_size: 16 * 1024,
            drain_timeout: Duration::from_secs(5),
        }
    }
}

/// External synchronization tool invocation.
///
/// `{port}` and `{endpoint}` in any argument are replaced with the bridge
/// port and `host:port` respectively.
#[derive(Debug, Clone)]
pub struct ToolConfig {
    pub program: String,
    pub args: Vec<String>,
}

impl ToolConfig {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            program: "rsync".to_string(),
            args: Vec::new(),
        }
    }
}
