//! Runs an external rsync client through an HTTP-upgraded tunnel.
//!
//! The tunnel is dialed first, then a loopback bridge is bound and the tool
//! is pointed at it. Bytes are relayed between the two until the tool exits.

pub mod bridge;
pub mod cli;
pub mod config;
pub mod credentials;
pub mod dial;
pub mod handshake;
pub mod logging;
pub mod session;
pub mod supervisor;
pub mod target;
pub mod tls_wrapper;
pub mod transport;
pub mod tunnel_stats;

#[cfg(all(test, unix))]
mod session_tests;

pub use bridge::{BridgeError, BridgeListener, BridgeReport};
pub use config::{BridgeConfig, ToolConfig, TransportConfig, TrustPolicy, TunnelConfig};
pub use credentials::{Credential, CredentialProvider};
pub use dial::{DialError, Dialer};
pub use session::{run_session, SessionError, SessionReport, SessionState, TunnelSession};
pub use supervisor::{ProcessToolRunner, ToolError, ToolRunner};
pub use transport::TunnelConnection;
