//! Logging initialization for kiln.
//!
//! The level passed in is only a default: a `RUST_LOG` environment variable
//! always wins.
//!
//! ```bash
//! # Per-connection events
//! RUST_LOG=kiln_core=debug kiln 8080
//!
//! # Parser and socket detail
//! RUST_LOG=kiln_core=trace kiln 8080
//! ```

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

fn filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Install a human-readable subscriber on stdout.
///
/// Returns `false` if a global subscriber was already installed, which
/// leaves the existing one in place.
pub fn init_logging(level: &str) -> bool {
    tracing_subscriber::registry()
        .with(filter(level))
        .with(tracing_subscriber::fmt::layer().with_thread_names(true))
        .try_init()
        .is_ok()
}

/// Install a JSON subscriber, one object per line.
pub fn init_logging_json(level: &str) -> bool {
    tracing_subscriber::registry()
        .with(filter(level))
        .with(tracing_subscriber::fmt::layer().json())
        .try_init()
        .is_ok()
}
