//! Runs the external synchronization tool against the bridge port.

use std::io;
use std::net::SocketAddr;
use std::process::{ExitStatus, Stdio};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::ToolConfig;

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("unable to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("error waiting for {program}: {source}")]
    Wait {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("{program} failed ({status}): {stderr}")]
    Execution {
        program: String,
        status: ExitStatus,
        stderr: String,
    },
}

/// Exit status and trimmed stderr of one tool run
#[derive(Debug, Clone)]
pub struct ProcessOutcome {
    pub status: ExitStatus,
    pub stderr: String,
}

/// Something that talks to the bridge at `endpoint` and reports how it went
#[async_trait]
pub trait ToolRunner: Send + Sync {
    async fn run(&self, endpoint: SocketAddr) -> Result<ProcessOutcome, ToolError>;
}

/// Spawns `config.program` as a child process
#[derive(Debug, Clone)]
pub struct ProcessToolRunner {
    config: ToolConfig,
}

impl ProcessToolRunner {
    pub fn new(config: ToolConfig) -> Self {
        Self { config }
    }

    /// Arguments with `{port}` and `{endpoint}` filled in
    pub fn arguments(&self, endpoint: SocketAddr) -> Vec<String> {
        let port = endpoint.port().to_string();
        let endpoint = endpoint.to_string();
        self.config
            .args
            .iter()
            .map(|arg| arg.replace("{port}", &port).replace("{endpoint}", &endpoint))
            .collect()
    }
}

#[async_trait]
impl ToolRunner for ProcessToolRunner {
    async fn run(&self, endpoint: SocketAddr) -> Result<ProcessOutcome, ToolError> {
        let program = self.config.program.clone();
        let args = self.arguments(endpoint);
        debug!(%program, ?args, "starting tool");

        let child = Command::new(&program)
            .args(&args)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ToolError::Spawn {
                program: program.clone(),
                source,
            })?;

        let output = child
            .wait_with_output()
            .await
            .map_err(|source| ToolError::Wait {
                program: program.clone(),
                source,
            })?;
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

        if !output.status.success() {
            warn!(%program, status = %output.status, %stderr, "tool failed");
            return Err(ToolError::Execution {
                program,
                status: output.status,
                stderr,
            });
        }

        info!(%program, "tool ran OK");
        Ok(ProcessOutcome {
            status: output.status,
            stderr,
        })
    }
}
