//! Diagnostic tracing.
//!
//! Diagnostics go to stderr and are filtered by `RUST_LOG` (default `warn`).
//! Product output (graph dumps, prefixed module output, the run summary) is
//! written to stdout directly and is unaffected by the filter.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global subscriber. `verbose` raises the default level to
/// `info` when `RUST_LOG` is unset.
pub fn init(verbose: bool) {
    let default = if verbose { "info" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    // try_init: a second call (tests, embedding) keeps the first subscriber
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init();
}
