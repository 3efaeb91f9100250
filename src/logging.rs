//! Tracing setup
//!
//! Subscriber initialization for binaries and tests embedding the engine.
//! The engine itself only emits `tracing` events and never installs a
//! global subscriber on its own.

use tracing_subscriber::EnvFilter;

/// Initialize a fmt subscriber at the given default level.
///
/// `RUST_LOG` takes precedence when set. Returns quietly if a subscriber
/// is already installed, so tests can call this repeatedly.
pub fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level.to_string()));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
