use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use url::Url;

use crate::config::{ToolConfig, TrustPolicy, TunnelConfig};
use crate::credentials::{Credential, CredentialProvider, StaticCredentials, UrlCredentials};

/// Tool arguments used when nothing follows `--`
pub const DEFAULT_TOOL_ARGS: &[&str] = &["rsync://{endpoint}/flamenco/"];

#[derive(Parser, Debug)]
#[command(name = "rsync-tunnel")]
#[command(about = "Run rsync through an HTTP-upgraded tunnel")]
#[command(version)]
pub struct Cli {
    /// Increase verbosity (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// URL to connect to
    #[arg(long, default_value = "http://localhost:8084/")]
    pub url: Url,

    /// Skip verification of the HTTPS certificate. Only use for testing.
    #[arg(long)]
    pub insecure: bool,

    /// Extra trusted root certificate (DER), may be repeated
    #[arg(long = "ca-cert", value_name = "FILE")]
    pub ca_certs: Vec<PathBuf>,

    /// Seconds allowed for the TCP connect
    #[arg(long, value_name = "SECS", default_value_t = 30)]
    pub connect_timeout: u64,

    /// Seconds allowed for the TLS handshake and the upgrade response
    #[arg(long, value_name = "SECS", default_value_t = 30)]
    pub handshake_timeout: u64,

    /// Seconds to wait for rsync to connect to the bridge (default: no limit)
    #[arg(long, value_name = "SECS")]
    pub accept_timeout: Option<u64>,

    /// rsync executable
    #[arg(long, value_name = "PATH", default_value = "rsync")]
    pub rsync: String,

    /// Username for Basic authentication
    #[arg(long, requires = "password")]
    pub user: Option<String>,

    /// Password for Basic authentication
    #[arg(long, requires = "user")]
    pub password: Option<String>,

    /// Arguments for rsync; `{port}` and `{endpoint}` name the bridge
    #[arg(last = true, value_name = "RSYNC_ARGS")]
    pub tool_args: Vec<String>,
}

impl Cli {
    pub fn tunnel_config(&self) -> Result<TunnelConfig> {
        let mut config = TunnelConfig::new(self.url.clone());

        config.transport.connect_timeout = Duration::from_secs(self.connect_timeout);
        let handshake = Some(Duration::from_secs(self.handshake_timeout));
        config.transport.tls_handshake_timeout = handshake;
        config.transport.response_header_timeout = handshake;
        config.bridge.accept_timeout = self.accept_timeout.map(Duration::from_secs);

        let mut trust = if self.insecure {
            TrustPolicy::insecure()
        } else {
            TrustPolicy::default()
        };
        for path in &self.ca_certs {
            let der = std::fs::read(path)
                .with_context(|| format!("reading CA certificate {}", path.display()))?;
            trust = trust.with_root_certificate(der);
        }
        config.trust = trust;

        Ok(config)
    }

    pub fn tool_config(&self) -> ToolConfig {
        let args = if self.tool_args.is_empty() {
            DEFAULT_TOOL_ARGS.iter().map(|arg| arg.to_string()).collect()
        } else {
            self.tool_args.clone()
        };
        ToolConfig::new(self.rsync.clone(), args)
    }

    /// `--user`/`--password` when given, otherwise whatever the URL carries
    pub fn credentials(&self) -> Arc<dyn CredentialProvider> {
        match (&self.user, &self.password) {
            (Some(user), Some(password)) => {
                Arc::new(StaticCredentials(Credential::basic(user, password)))
            }
            _ => Arc::new(UrlCredentials),
        }
    }
}
