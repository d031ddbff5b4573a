//! Porthole Logging
//!
//! One-call tracing setup shared by the binaries.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Install the global subscriber: env-filtered, compact output. `verbose`
/// lifts Porthole crates to debug when `RUST_LOG` is unset.
pub fn init(verbose: bool) {
    let fallback = if verbose {
        "info,porthole=debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();
}
