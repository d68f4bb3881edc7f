//! Tracing subscriber setup for hosts embedding the sync core.

use lodge_core::{ConfigError, TelemetryConfig};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Environment variable overriding the configured filter.
pub const LOG_ENV: &str = "LODGE_LOG";

/// Build the filter: `LODGE_LOG` wins over the configured directive.
pub fn env_filter(config: &TelemetryConfig) -> Result<EnvFilter, ConfigError> {
    if let Ok(filter) = EnvFilter::try_from_env(LOG_ENV) {
        return Ok(filter);
    }
    EnvFilter::try_new(&config.filter).map_err(|e| ConfigError::InvalidValue {
        field: "telemetry.filter",
        reason: e.to_string(),
    })
}

/// Install the global subscriber.
///
/// Returns `Ok(false)` when a subscriber is already installed (tests,
/// or a host that set up its own).
pub fn init_tracing(config: &TelemetryConfig) -> Result<bool, ConfigError> {
    let filter = env_filter(config)?;
    let registry = tracing_subscriber::registry().with(filter);
    let installed = if config.json {
        registry.with(fmt::layer().json()).try_init()
    } else {
        registry.with(fmt::layer()).try_init()
    };

    match installed {
        Ok(()) => {
            tracing::info!(filter = %config.filter, json = config.json, "Tracing initialized");
            Ok(true)
        }
        Err(e) => {
            tracing::debug!(error = %e, "Tracing subscriber already installed");
            Ok(false)
        }
    }
}
