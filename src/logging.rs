//! Logging setup.
//!
//! All diagnostics go to stderr through `tracing`; stdout is reserved for
//! command output such as the `list` table.

use tracing_subscriber::EnvFilter;

/// Install the global subscriber.
///
/// `RUST_LOG` wins when set. Otherwise the level is `info`, or `debug` when
/// `debug` is true.
pub fn init(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    if let Err(e) = tracing_subscriber::fmt()
        .with_target(debug)
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .try_init()
    {
        eprintln!("[WARN] Failed to initialize logging: {}", e);
    }
}
