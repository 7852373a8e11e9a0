//! Telemetry module providing tracing subscriber initialization.
//!
//! The storage layer only emits `tracing` events; binaries and test harnesses
//! decide where they go by installing one of the subscribers below.
//!
//! # Usage
//!
//! ```no_run
//! use kbstore_core::telemetry;
//!
//! fn main() {
//!     telemetry::init_dev_subscriber();
//!     // Application code...
//! }
//! ```

use tracing::Level;
use tracing_subscriber::fmt;
use tracing_subscriber::EnvFilter;

/// Default filter used when `RUST_LOG` is not set.
pub const DEFAULT_FILTER: &str = "info";

/// Initialize a simple stderr subscriber for development.
///
/// This sets up a tracing subscriber that:
/// - Outputs to stderr
/// - Shows DEBUG level and above
/// - Includes target (module path), file, and line number
///
/// Call this at application startup (not in the library).
///
/// # Panics
/// Panics if a global subscriber has already been set.
pub fn init_dev_subscriber() {
    let subscriber = fmt::Subscriber::builder()
        .with_max_level(Level::DEBUG)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .expect("Failed to set tracing subscriber");
}

/// Initialize a stderr subscriber that respects `RUST_LOG`.
///
/// Falls back to [`DEFAULT_FILTER`] when the variable is unset or invalid.
///
/// ```no_run
/// use kbstore_core::telemetry;
///
/// // RUST_LOG=kbstore_db=debug,info shows connector and map lifecycle events
/// telemetry::init_dev_subscriber_with_env_filter();
/// tracing::info!("Application started");
/// ```
pub fn init_dev_subscriber_with_env_filter() {
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(env_filter())
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .expect("Failed to set tracing subscriber");
}

/// Best-effort subscriber for tests: writes through the libtest capture and
/// silently does nothing if another test already installed one.
pub fn try_init_test_subscriber() {
    let _ = fmt::Subscriber::builder()
        .with_env_filter(env_filter())
        .with_test_writer()
        .try_init();
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}
