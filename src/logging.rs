//! Tracing setup for the binary.

use std::sync::Once;

static TRACING_INIT: Once = Once::new();

/// Install the global tracing subscriber on stderr.
///
/// `RUST_LOG` wins when set; otherwise the level is `info`, or `debug` when
/// `verbose`. Only the first call has any effect.
pub fn init_tracing(verbose: bool) {
    TRACING_INIT.call_once(|| {
        let default = if verbose { "debug" } else { "info" };
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
        let _ = tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_target(false)
            .with_env_filter(filter)
            .try_init();
    });
}
