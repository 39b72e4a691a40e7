use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{debug, info, info_span, warn, Instrument};

use crate::bridge::{BridgeError, BridgeListener, BridgeReport};
use crate::config::TunnelConfig;
use crate::credentials::{CredentialProvider, UrlCredentials};
use crate::dial::{DialError, Dialer};
use crate::supervisor::{ProcessOutcome, ToolError, ToolRunner};
use crate::transport::TunnelConnection;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("dial: {0}")]
    Dial(#[from] DialError),
    #[error("bridge: {0}")]
    Bridge(#[from] BridgeError),
    #[error(transparent)]
    Tool(#[from] ToolError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Dialing,
    Bridging,
    RunningTool,
    Closing,
    Done,
    Failed,
}

/// What a successful session did
#[derive(Debug)]
pub struct SessionReport {
    pub remote_addr: SocketAddr,
    pub tool: ProcessOutcome,
    pub bridge: BridgeReport,
}

/// One dial, one bridge, one tool run, one close.
///
/// Nothing is retried; the caller decides whether to run another session.
pub struct TunnelSession {
    config: TunnelConfig,
    tool: Arc<dyn ToolRunner>,
    credentials: Arc<dyn CredentialProvider>,
    state: SessionState,
}

impl TunnelSession {
    pub fn new(config: TunnelConfig, tool: Arc<dyn ToolRunner>) -> Self {
        Self {
            config,
            tool,
            credentials: Arc::new(UrlCredentials),
            state: SessionState::Idle,
        }
    }

    pub fn with_credentials(mut self, credentials: Arc<dyn CredentialProvider>) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub async fn run(&mut self) -> Result<SessionReport, SessionError> {
        let span = info_span!("session", url = %self.config.url);
        self.run_inner().instrument(span).await
    }

    async fn run_inner(&mut self) -> Result<SessionReport, SessionError> {
        self.transition(SessionState::Dialing);
        let dialer = Dialer::new(self.config.transport.clone(), self.config.trust.clone())
            .with_protocol(self.config.upgrade_protocol.clone())
            .with_credentials(self.credentials.clone());

        let mut tunnel = match dialer.dial(&self.config.url).await {
            Ok(tunnel) => tunnel,
            Err(err) => {
                self.transition(SessionState::Failed);
                return Err(err.into());
            }
        };

        let result = self.bridge_and_run(&mut tunnel).await;

        self.transition(SessionState::Closing);
        release(&mut tunnel).await;

        match &result {
            Ok(report) => {
                info!(totals = %report.bridge.totals, "Done");
                self.transition(SessionState::Done);
            }
            Err(err) => {
                debug!(error = %err, "session failed");
                self.transition(SessionState::Failed);
            }
        }
        result
    }

    async fn bridge_and_run(
        &mut self,
        tunnel: &mut TunnelConnection,
    ) -> Result<SessionReport, SessionError> {
        self.transition(SessionState::Bridging);
        let remote_addr = tunnel.remote_addr();
        let bridge = BridgeListener::bind(&self.config.bridge).await?;
        let endpoint = bridge.local_addr();
        let progress = bridge.progress();
        let drain = self.config.bridge.drain_timeout;

        // The port is bound before the tool starts, so it never races the listener.
        self.transition(SessionState::RunningTool);
        let runner = self.tool.clone();
        let serve = bridge.serve(tunnel);
        let tool = runner.run(endpoint);
        tokio::pin!(serve);
        tokio::pin!(tool);

        let (tool_result, bridge_result) = tokio::select! {
            tool_result = &mut tool => {
                let bridge_result = if tool_result.is_err() && !progress.has_peer() {
                    // A failed tool that never connected will not connect later.
                    Err(BridgeError::NoPeer)
                } else {
                    match tokio::time::timeout(drain, &mut serve).await {
                        Ok(result) => result,
                        Err(_) if progress.has_peer() => Err(BridgeError::DrainTimeout(drain)),
                        Err(_) => Err(BridgeError::NoPeer),
                    }
                };
                (tool_result, bridge_result)
            }
            bridge_result = &mut serve => {
                if let Err(err) = &bridge_result {
                    warn!(error = %err, "bridge failed while the tool was running");
                }
                ((&mut tool).await, bridge_result)
            }
        };

        match (tool_result, bridge_result) {
            (Err(tool_err), Err(bridge_err)) => {
                warn!(error = %bridge_err, "bridge failed as well");
                Err(tool_err.into())
            }
            (Err(tool_err), Ok(_)) => Err(tool_err.into()),
            (Ok(_), Err(bridge_err)) => Err(bridge_err.into()),
            (Ok(tool), Ok(bridge)) => Ok(SessionReport {
                remote_addr,
                tool,
                bridge,
            }),
        }
    }

    fn transition(&mut self, next: SessionState) {
        debug!(from = ?self.state, to = ?next, "session state");
        self.state = next;
    }
}

/// Close the tunnel, logging instead of failing. Returns whether it closed cleanly.
pub(crate) async fn release(tunnel: &mut TunnelConnection) -> bool {
    let remote_addr = tunnel.remote_addr();
    match tunnel.close().await {
        Ok(()) => {
            debug!(%remote_addr, "connection closed");
            true
        }
        Err(err) => {
            warn!(%remote_addr, error = %err, "unable to close tunnel connection");
            false
        }
    }
}

/// Run a single session to completion
pub async fn run_session(
    config: TunnelConfig,
    tool: Arc<dyn ToolRunner>,
    credentials: Arc<dyn CredentialProvider>,
) -> Result<SessionReport, SessionError> {
    TunnelSession::new(config, tool)
        .with_credentials(credentials)
        .run()
        .await
}
