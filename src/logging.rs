//! Logging configuration
//!
//! Initializes tracing for the worker and its forked children.

/// Default filter when neither `RUST_LOG` nor an explicit filter is
/// given
pub const DEFAULT_LOG_FILTER: &str = "taskline=info";

/// Initializes logging with the specified filter
pub fn init_logging(filter: &str) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    // Task output goes to stdout; keep diagnostics on stderr so the
    // two streams never interleave.
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_writer(std::io::stderr)
        .try_init();
}
