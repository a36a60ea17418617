//! Logging initialization.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize the tracing-based logging system.
///
/// Filtering is environment driven (`RUST_LOG`), with a default that keeps
/// the engine chatty and third-party crates quiet.
///
/// # Example
/// ```
/// ember_core::init_logging();
/// tracing::info!("render core starting");
/// ```
pub fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,ember=debug"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .init();
}
