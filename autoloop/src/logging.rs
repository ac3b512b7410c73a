//! Tracing setup for the loop controller.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: operator-facing progress and diagnostics on
//!   stderr, filtered by `RUST_LOG`.
//!
//! - **Iteration logging (`io/iteration_log`)**: per-loop artifacts in
//!   `.autoloop/iterations/`. Always written, unaffected by `RUST_LOG`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Loop progress at info, everything else at warn.
const DEFAULT_FILTER: &str = "autoloop=info,warn";

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG` env var. Defaults to [`DEFAULT_FILTER`] if unset.
/// Output: stderr, compact format.
///
/// # Example
/// ```bash
/// RUST_LOG=autoloop=debug autoloop run
/// ```
pub fn init() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
