//! Tracing setup for binaries and tests embedding the checks.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Default filter when `RUST_LOG` is unset.
pub const DEFAULT_DIRECTIVES: &str = "swarmcheck_check=info,swarmcheck_dht=info";

/// Install a global `fmt` subscriber filtered by `RUST_LOG`, falling back to
/// `default_directives`. Returns `false` if a subscriber was already set.
pub fn init_tracing(default_directives: &str) -> bool {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directives)))
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .is_ok()
}
