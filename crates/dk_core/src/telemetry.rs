//! Log output for binaries embedding the core.

use tracing_subscriber::EnvFilter;

pub const DEFAULT_FILTER: &str = "dk_core=info,dk_store=info,dk_keyd=info";

/// Install a fmt subscriber filtered by `RUST_LOG`, falling back to
/// [`DEFAULT_FILTER`]. Safe to call more than once.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_target(false).try_init();
}
