//! Logging initialization shared by all binaries.

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::constants::LOG_ENV_VAR;

/// Initializes `tracing` from the `KUBEARCHIVE_LOG` environment variable,
/// defaulting to INFO. Call once, first thing in `main`.
pub fn initialize(app_name: &str) {
    let filter = EnvFilter::try_from_env(LOG_ENV_VAR)
        .unwrap_or_else(|_| EnvFilter::new(tracing::Level::INFO.to_string()));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!(app_name, "logging initialized");
}
