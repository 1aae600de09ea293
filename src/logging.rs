//! # Logging
//!
//! Thin `tracing` init helper. The engine never writes to stdout directly;
//! every component emits through `tracing` spans/events so an embedder can
//! route output wherever it likes.

use tracing_subscriber::EnvFilter;

/// Installs a global `tracing` subscriber reading its filter from
/// `RUST_LOG`, falling back to `info` when unset. Safe to call more than
/// once; subsequent calls are no-ops.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
