use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Target of the startup banner, shown at every verbosity.
pub const STARTUP_TARGET: &str = "rsync_tunnel::startup";

/// Filter directive for a `-v` count: warnings by default, `-v` info, `-vv` debug.
pub fn level_directive(verbose: u8) -> String {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    format!("{level},{STARTUP_TARGET}=info")
}

/// Install the global subscriber. `RUST_LOG` wins over `verbose`.
///
/// Everything goes to stderr; stdout belongs to the tool.
pub fn init_logging(verbose: u8) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_directive(verbose)));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .try_init();
}
