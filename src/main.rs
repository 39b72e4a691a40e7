use std::sync::Arc;

use clap::Parser;
use rsync_tunnel::cli::Cli;
use rsync_tunnel::logging::{self, STARTUP_TARGET};
use rsync_tunnel::{run_session, ProcessToolRunner};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    logging::init_logging(cli.verbose);
    info!(target: STARTUP_TARGET, version = env!("CARGO_PKG_VERSION"), "starting rsync-tunnel");

    if cli.insecure {
        warn!("potentially insecure HTTPS connection, only use for testing");
    }

    let config = match cli.tunnel_config() {
        Ok(config) => config,
        Err(err) => {
            error!("invalid configuration: {err:#}");
            std::process::exit(1);
        }
    };

    let runner = Arc::new(ProcessToolRunner::new(cli.tool_config()));
    if let Err(err) = run_session(config, runner, cli.credentials()).await {
        error!(error = %err, "session failed");
        std::process::exit(1);
    }
}
