//! # Structured Logging
//!
//! Environment-aware tracing setup. Log level comes from `FLOCK_LOG` (falling
//! back to `RUST_LOG`, then `info`); set `FLOCK_LOG_FORMAT=json` for
//! machine-readable output.

use std::sync::OnceLock;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize the global tracing subscriber. Safe to call more than once;
/// only the first call installs a subscriber.
pub fn init_logging() {
    LOGGER_INITIALIZED.get_or_init(|| {
        let filter = EnvFilter::try_from_env("FLOCK_LOG")
            .or_else(|_| EnvFilter::try_from_default_env())
            .unwrap_or_else(|_| EnvFilter::new("info"));

        let json = std::env::var("FLOCK_LOG_FORMAT")
            .map(|v| v.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        let registry = tracing_subscriber::registry().with(filter);
        let result = if json {
            registry
                .with(fmt::layer().json().with_target(true))
                .try_init()
        } else {
            registry
                .with(fmt::layer().with_target(true).with_level(true))
                .try_init()
        };

        // Another subscriber may already be installed by the host process.
        if let Err(error) = result {
            tracing::debug!(%error, "tracing subscriber already installed");
        }
    });
}
