//! Tracing setup.
//!
//! Console subscriber with `RUST_LOG`-style filtering. Call once at
//! startup; library code only emits `tracing` events and never
//! installs a subscriber itself.

use tracing_subscriber::EnvFilter;

/// Initialize console tracing.
///
/// The filter comes from `RUST_LOG`, defaulting to `info`. Returns
/// quietly if a subscriber is already installed (tests).
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .try_init();
}
