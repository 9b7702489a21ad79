//! Tracing setup for the command line tool.
//!
//! Library code only emits `tracing` events; installing a subscriber is left
//! to binaries. `RUST_LOG` takes precedence over the verbosity flag.

use std::sync::Once;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

static TRACING_INIT: Once = Once::new();

/// Installs the global subscriber once. Without `RUST_LOG`, only warnings are
/// shown, or `info` and above when `verbose` is set.
pub fn init_tracing(verbose: bool) {
    TRACING_INIT.call_once(|| {
        let filter = if std::env::var("RUST_LOG").is_ok() {
            EnvFilter::from_default_env()
        } else if verbose {
            EnvFilter::new("kiln=info")
        } else {
            EnvFilter::new("kiln=warn")
        };
        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_level(true)
                    .with_writer(std::io::stderr),
            )
            .with(filter)
            .init();
    });
}
