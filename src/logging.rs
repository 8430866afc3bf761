//! Tracing setup for the bundled tools and for tests.
//!
//! The library only emits `tracing` events. Embedders install their own
//! subscriber; these helpers cover the binaries in `tools/`.
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;

fn filter_for(config: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level))
}

/// Install a stderr subscriber. `RUST_LOG` overrides the configured level.
///
/// Returns false if a global subscriber was already set.
pub fn init(config: &LoggingConfig) -> bool {
    let layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .compact();
    let installed = tracing_subscriber::registry()
        .with(filter_for(config))
        .with(layer)
        .try_init()
        .is_ok();
    if installed {
        tracing::debug!(level = %config.level, "logging initialized");
    }
    installed
}

/// Initialize logging for tests (captured per test).
pub fn init_test() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
