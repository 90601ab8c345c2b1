//! Diagnostics for the rules runner and for rule code itself.
//!
//! Runner events and the `console`/`print` output of rules go through
//! `tracing`. Rule output uses the `rules::sandbox` target and carries the
//! rule identifier as the `rule` field.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing subscriber.
///
/// Reads `RUST_LOG` env var. Defaults to `warn` if unset.
/// Output: stderr, compact format.
///
/// # Example
/// ```bash
/// RUST_LOG=rules::sandbox=info rules run --user user.json --context context.json
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
