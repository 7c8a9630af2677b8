//! Process-wide tracing/logging setup.

/// Tracing configuration (filters, output format).
pub mod tracing;

pub use crate::tracing::{LogConfig, LogFormat};

/// Initialize tracing with the default configuration.
///
/// Safe to call multiple times; subsequent calls are no-ops.
pub fn init() {
    tracing::init_with(&LogConfig::default());
}

/// Initialize tracing with an explicit configuration.
pub fn init_with(config: &LogConfig) {
    tracing::init_with(config);
}
