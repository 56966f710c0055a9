//! Tracing setup and log-safe formatting helpers.

use crate::config::{LogFormat, LoggingConfig};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Install the global subscriber from `LOG_LEVEL` / `LOG_FORMAT`.
pub fn init_tracing() {
    let config = LoggingConfig::from_env().unwrap_or(LoggingConfig {
        level: "INFO".to_string(),
        format: LogFormat::Plain,
    });
    init_tracing_with(&config);
}

/// `RUST_LOG` takes precedence over the configured level.
pub fn init_tracing_with(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.to_lowercase()));

    let registry = tracing_subscriber::registry().with(filter);
    let result = match config.format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_current_span(true))
            .try_init(),
        LogFormat::Plain => registry.with(fmt::layer().with_target(true)).try_init(),
    };

    if result.is_err() {
        tracing::debug!("tracing subscriber already initialized");
    }
}

/// Keeps the first and last four characters of a charge id.
pub fn mask_charge_id(id: &str) -> String {
    let chars: Vec<char> = id.chars().collect();
    if chars.len() <= 8 {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}...{}", head, tail)
}
