//! Logging configuration using tracing
//!
//! Structured logging to stderr, filtered by the RUST_LOG environment variable.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the tracing subscriber with a default level of "warn"
///
/// # Example RUST_LOG values
/// - `RUST_LOG=info` - Show info and above
/// - `RUST_LOG=chatter_cache=debug` - Cache hits, misses and coalesced lookups
/// - `RUST_LOG=chatter_cache::lookup=trace,reqwest=debug` - Debug the Twitch client
///
/// # Errors
/// Returns an error if the subscriber has already been initialized
pub fn init() -> crate::Result<()> {
    init_with_default("warn")
}

/// Initialize with `default_level` used when RUST_LOG is unset or invalid
pub fn init_with_default(default_level: &str) -> crate::Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_ids(true)
                .with_line_number(true),
        )
        .try_init()
        .map_err(|e| crate::CacheError::Other(format!("Failed to initialize tracing: {}", e)))?;

    Ok(())
}

/// Initialize logging for tests (no-op if already initialized)
pub fn init_test() {
    let _ = init_with_default("debug");
}
