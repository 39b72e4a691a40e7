//! Pluggable credentials for the upgrade request.

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use url::Url;

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("credentials unavailable for {target}: {reason}")]
    Unavailable { target: String, reason: String },
}

#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    Basic { username: String, password: String },
    Bearer(String),
}

impl Credential {
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Credential::Basic {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Value for the `Authorization` header
    pub fn authorization_value(&self) -> String {
        match self {
            Credential::Basic { username, password } => {
                let raw = format!("{}:{}", username, password);
                format!("Basic {}", general_purpose::STANDARD.encode(raw))
            }
            Credential::Bearer(token) => format!("Bearer {}", token),
        }
    }
}

// Keeps secrets out of logs.
impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credential::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .finish_non_exhaustive(),
            Credential::Bearer(_) => f.write_str("Bearer(..)"),
        }
    }
}

/// Supplies the credential attached to an upgrade request, if any
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn credential(&self, target: &Url) -> Result<Option<Credential>, CredentialError>;
}

/// Sends no `Authorization` header
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCredentials;

#[async_trait]
impl CredentialProvider for NoCredentials {
    async fn credential(&self, _target: &Url) -> Result<Option<Credential>, CredentialError> {
        Ok(None)
    }
}

/// Always sends the same credential
#[derive(Debug, Clone)]
pub struct StaticCredentials(pub Credential);

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn credential(&self, _target: &Url) -> Result<Option<Credential>, CredentialError> {
        Ok(Some(self.0.clone()))
    }
}

/// Uses `user:password@` from the target URL when present
#[derive(Debug, Default, Clone, Copy)]
pub struct UrlCredentials;

#[async_trait]
impl CredentialProvider for UrlCredentials {
    async fn credential(&self, target: &Url) -> Result<Option<Credential>, CredentialError> {
        if target.username().is_empty() {
            return Ok(None);
        }
        let username = decode_userinfo(target, target.username())?;
        let password = decode_userinfo(target, target.password().unwrap_or_default())?;
        Ok(Some(Credential::basic(username, password)))
    }
}

// `Url` keeps userinfo percent-encoded.
fn decode_userinfo(target: &Url, raw: &str) -> Result<String, CredentialError> {
    urlencoding::decode(raw)
        .map(|decoded| decoded.into_owned())
        .map_err(|err| CredentialError::Unavailable {
            target: target.host_str().unwrap_or_default().to_string(),
            reason: format!("userinfo is not valid UTF-8: {}", err),
        })
}
