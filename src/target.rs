//! Host/port resolution for the dial target.

use url::Url;

use crate::dial::DialError;

pub const HTTPS_DEFAULT_PORT: u16 = 443;
pub const HTTP_DEFAULT_PORT: u16 = 80;

/// Where to dial and which identity to expect from the peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetAddress {
    scheme: String,
    host_port: String,
    host_only: String,
}

impl TargetAddress {
    pub fn from_url(url: &Url) -> Result<Self, DialError> {
        let host = url.host_str().ok_or_else(|| DialError::MissingHost {
            url: url.to_string(),
        })?;

        // `Url` drops ports equal to the scheme default, which resolves to the
        // same pair anyway.
        let authority = match url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };

        let (host_port, host_only) = resolve_host_port(url.scheme(), &authority);
        Ok(Self {
            scheme: url.scheme().to_string(),
            host_port,
            host_only,
        })
    }

    /// `host:port` string handed to the connector
    pub fn host_port(&self) -> &str {
        &self.host_port
    }

    /// Host without port, brackets kept for IPv6 literals
    pub fn host_only(&self) -> &str {
        &self.host_only
    }

    pub fn is_encrypted(&self) -> bool {
        is_encrypted_scheme(&self.scheme)
    }

    /// Name presented to TLS: IPv6 literals lose their brackets.
    pub fn tls_server_name(&self) -> &str {
        self.host_only
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(&self.host_only)
    }
}

pub fn is_encrypted_scheme(scheme: &str) -> bool {
    scheme.eq_ignore_ascii_case("https")
}

pub fn default_port(scheme: &str) -> u16 {
    if is_encrypted_scheme(scheme) {
        HTTPS_DEFAULT_PORT
    } else {
        HTTP_DEFAULT_PORT
    }
}

/// Split an authority into the dialable `host:port` and the bare host.
///
/// A `:` only counts as a port separator when it comes after the last `]`,
/// so IPv6 literals without a port keep their colons.
pub fn resolve_host_port(scheme: &str, host: &str) -> (String, String) {
    let last_colon = host.rfind(':');
    let last_bracket = host.rfind(']');

    match (last_colon, last_bracket) {
        (Some(colon), Some(bracket)) if colon > bracket => {
            (host.to_string(), host[..colon].to_string())
        }
        (Some(colon), None) => (host.to_string(), host[..colon].to_string()),
        _ => (
            format!("{}:{}", host, default_port(scheme)),
            host.to_string(),
        ),
    }
}
