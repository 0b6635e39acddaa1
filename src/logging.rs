//! Opt-in tracing subscriber setup.
//!
//! Library code only emits `tracing` events; nothing is printed unless the
//! host (or a test) installs a subscriber. `init` reads the `TEXEL_LOG`
//! environment variable once, with the usual `EnvFilter` directive syntax.

use tracing_subscriber::EnvFilter;

/// Environment variable consulted for the log filter.
pub const LOG_ENV_VAR: &str = "TEXEL_LOG";

/// Install a global fmt subscriber filtered by `TEXEL_LOG`.
///
/// Does nothing if the variable is unset or a subscriber is already
/// installed (repeat calls in tests are harmless).
pub fn init() {
    let Ok(directives) = std::env::var(LOG_ENV_VAR) else {
        return;
    };
    let filter = EnvFilter::try_new(directives).unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
