//! Tracing subscriber setup for binaries and tests.

use tracing_subscriber::EnvFilter;

/// Install a fmt subscriber filtered by `RUST_LOG`, defaulting to `info`.
///
/// Returns `false` if a global subscriber was already installed.
pub fn init() -> bool {
    init_with_default("info")
}

/// Like [`init`], with a different filter when `RUST_LOG` is unset.
pub fn init_with_default(directives: &str) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directives));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .is_ok()
}
