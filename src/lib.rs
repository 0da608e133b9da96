pub mod artifact; // Cross-host artifact resolution
pub mod config;
pub mod db;
pub mod schema; // Idempotent schema evolution
pub mod triage; // Stage selection, claiming and completion

use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over `fallback_filter` when set. Safe to call more than
/// once; later calls are no-ops.
pub fn init_tracing(fallback_filter: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback_filter)),
        )
        .with_writer(std::io::stderr)
        .try_init();
}
