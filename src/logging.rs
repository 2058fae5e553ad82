//! JSON log output via `tracing-subscriber`.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::Config;

/// Install a JSON-lines subscriber at the configured level.
///
/// `RUST_LOG`, when set, overrides `LOG_LEVEL`. Returns `false` if a global
/// subscriber was already installed (tests, embedding applications).
pub fn init(config: &Config) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str()));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json())
        .try_init()
        .is_ok()
}
