//! HTTP/1.1 framing for the upgrade handshake.
//!
//! Only the request head and the response head are ever exchanged over HTTP.
//! Everything after the blank line that ends the response head belongs to the
//! tunnel, so the reader hands those bytes back instead of dropping them.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt};
use url::{Position, Url};

use crate::credentials::Credential;

pub const SWITCHING_PROTOCOLS: u16 = 101;

const READ_CHUNK: usize = 512;

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("I/O error while reading response: {0}")]
    Io(#[from] io::Error),
    #[error("connection closed after {received} bytes, before the response header ended")]
    ClosedBeforeHeader { received: usize },
    #[error("response header exceeds {limit} bytes")]
    HeaderTooLarge { limit: usize },
    #[error("malformed response: {0}")]
    Malformed(String),
}

/// Request head asking the server to switch the connection to `protocol`
#[derive(Debug, Clone)]
pub struct UpgradeRequest {
    method: String,
    target: String,
    host: String,
    protocol: String,
    authorization: Option<String>,
}

impl UpgradeRequest {
    pub fn new(url: &Url, protocol: &str) -> Self {
        let target = match &url[Position::BeforePath..Position::AfterQuery] {
            "" => "/".to_string(),
            path => path.to_string(),
        };
        let host = match (url.host_str(), url.port()) {
            (Some(host), Some(port)) => format!("{}:{}", host, port),
            (Some(host), None) => host.to_string(),
            (None, _) => String::new(),
        };

        Self {
            method: protocol.to_ascii_uppercase(),
            target,
            host,
            protocol: protocol.to_string(),
            authorization: None,
        }
    }

    pub fn with_credential(mut self, credential: &Credential) -> Self {
        self.authorization = Some(credential.authorization_value());
        self
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut head = format!(
            "{} {} HTTP/1.1\r\nHost: {}\r\nUser-Agent: rsync-tunnel/{}\r\n",
            self.method,
            self.target,
            self.host,
            env!("CARGO_PKG_VERSION"),
        );
        if let Some(authorization) = &self.authorization {
            head.push_str(&format!("Authorization: {}\r\n", authorization));
        }
        head.push_str("Connection: Upgrade\r\n");
        head.push_str(&format!("Upgrade: {}\r\n\r\n", self.protocol));
        head.into_bytes()
    }
}

/// Parsed response head
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeResponse {
    pub version: String,
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
}

impl UpgradeResponse {
    pub fn parse(head: &[u8]) -> Result<Self, HandshakeError> {
        let text = std::str::from_utf8(head)
            .map_err(|_| HandshakeError::Malformed("response header is not UTF-8".into()))?;
        let mut lines = text.split('\n').map(|line| line.trim_end_matches('\r'));

        let status_line = lines
            .next()
            .filter(|line| !line.is_empty())
            .ok_or_else(|| HandshakeError::Malformed("empty status line".into()))?;
        let mut parts = status_line.splitn(3, ' ');
        let version = parts.next().unwrap_or_default();
        if !version.starts_with("HTTP/") {
            return Err(HandshakeError::Malformed(format!(
                "bad status line {:?}",
                status_line
            )));
        }
        let status = parts
            .next()
            .filter(|code| code.len() == 3)
            .and_then(|code| code.parse::<u16>().ok())
            .ok_or_else(|| {
                HandshakeError::Malformed(format!("bad status code in {:?}", status_line))
            })?;
        let reason = parts.next().unwrap_or_default().to_string();

        let mut headers = Vec::new();
        for line in lines {
            if line.is_empty() {
                break;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| HandshakeError::Malformed(format!("bad header line {:?}", line)))?;
            let name = name.trim();
            if name.is_empty() {
                return Err(HandshakeError::Malformed(format!("bad header line {:?}", line)));
            }
            headers.push((name.to_string(), value.trim().to_string()));
        }

        Ok(Self {
            version: version.to_string(),
            status,
            reason,
            headers,
        })
    }

    /// First header value matching `name`, case-insensitively
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Whether the server agreed to switch to `protocol`.
    ///
    /// Requires status 101. An `Upgrade` header, when present, must name the
    /// requested protocol.
    pub fn accepts_upgrade(&self, protocol: &str) -> bool {
        if self.status != SWITCHING_PROTOCOLS {
            return false;
        }
        match self.header("Upgrade") {
            Some(offered) => offered
                .split(',')
                .any(|p| p.trim().eq_ignore_ascii_case(protocol)),
            None => true,
        }
    }
}

/// Read one response head from `reader`.
///
/// Returns the head (terminator included) and whatever was read past it.
pub async fn read_response_head<R>(
    reader: &mut R,
    max_bytes: usize,
) -> Result<(Vec<u8>, Vec<u8>), HandshakeError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(READ_CHUNK);
    let mut chunk = [0u8; READ_CHUNK];
    let mut scan_from = 0;

    loop {
        if let Some(end) = find_header_end(&buf, scan_from) {
            let leftover = buf.split_off(end);
            return Ok((buf, leftover));
        }
        if buf.len() >= max_bytes {
            return Err(HandshakeError::HeaderTooLarge { limit: max_bytes });
        }
        // A terminator may straddle the chunk boundary by up to three bytes.
        scan_from = buf.len().saturating_sub(3);

        let want = READ_CHUNK.min(max_bytes - buf.len());
        let n = reader.read(&mut chunk[..want]).await?;
        if n == 0 {
            return Err(HandshakeError::ClosedBeforeHeader { received: buf.len() });
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Index just past the first blank line ending the head (CRLF or bare LF),
/// looking at terminators that start at or after `from`.
fn find_header_end(buf: &[u8], from: usize) -> Option<usize> {
    (from..buf.len()).find_map(|i| {
        if buf[i..].starts_with(b"\r\n\r\n") {
            Some(i + 4)
        } else if buf[i..].starts_with(b"\n\n") {
            Some(i + 2)
        } else {
            None
        }
    })
}
