//! Application configuration module
//! Handles environment variable loading, configuration validation, and poller settings

use std::env;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub poller: PollerConfig,
    pub gateway: GatewayConfig,
    pub logging: LoggingConfig,
}

/// Timing policy for the PIX status poller
#[derive(Debug, Clone, PartialEq)]
pub struct PollerConfig {
    /// Interval while the charge is merely pending; also the backoff base.
    pub pending_interval: Duration,
    /// Interval once the gateway reports active processing; the lower bound.
    pub processing_interval: Duration,
    /// Backoff ceiling.
    pub max_interval: Duration,
    pub growth_factor: f64,
    /// Minimum spacing between two check attempts.
    pub min_check_spacing: Duration,
    pub request_timeout: Duration,
    /// Countdown fallback when the charge carries no expiry. Display only.
    pub default_expiry: Duration,
}

/// Payments backend connection settings
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub base_url: String,
    pub api_token: Option<String>,
    pub timeout_secs: u64,
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

/// Log format options
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Plain,
}

impl AppConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if it exists
        let _ = dotenv::dotenv().ok();

        Ok(AppConfig {
            poller: PollerConfig::from_env()?,
            gateway: GatewayConfig::from_env()?,
            logging: LoggingConfig::from_env()?,
        })
    }

    /// Validate the entire configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.poller.validate()?;
        self.gateway.validate()?;
        self.logging.validate()?;

        Ok(())
    }
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            pending_interval: Duration::from_millis(5_000),
            processing_interval: Duration::from_millis(2_000),
            max_interval: Duration::from_millis(30_000),
            growth_factor: 1.5,
            min_check_spacing: Duration::from_millis(2_000),
            request_timeout: Duration::from_millis(2_000),
            default_expiry: Duration::from_secs(30 * 60),
        }
    }
}

impl PollerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(PollerConfig {
            pending_interval: env_millis("PIX_POLL_PENDING_INTERVAL_MS", defaults.pending_interval)?,
            processing_interval: env_millis(
                "PIX_POLL_PROCESSING_INTERVAL_MS",
                defaults.processing_interval,
            )?,
            max_interval: env_millis("PIX_POLL_MAX_INTERVAL_MS", defaults.max_interval)?,
            growth_factor: match env::var("PIX_POLL_GROWTH_FACTOR") {
                Ok(raw) => raw.trim().parse()?,
                Err(_) => defaults.growth_factor,
            },
            min_check_spacing: env_millis("PIX_POLL_MIN_SPACING_MS", defaults.min_check_spacing)?,
            request_timeout: env_millis("PIX_POLL_REQUEST_TIMEOUT_MS", defaults.request_timeout)?,
            default_expiry: match env::var("PIX_POLL_DEFAULT_EXPIRY_SECS") {
                Ok(raw) => Duration::from_secs(raw.trim().parse()?),
                Err(_) => defaults.default_expiry,
            },
        })
    }

    /// Lower bound of the polling interval.
    pub fn min_interval(&self) -> Duration {
        self.processing_interval
    }

    pub fn clamp(&self, interval: Duration) -> Duration {
        interval.clamp(self.min_interval(), self.max_interval)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.processing_interval.is_zero() {
            return Err(ConfigError::InvalidValue(
                "PIX_POLL_PROCESSING_INTERVAL_MS cannot be 0".to_string(),
            ));
        }

        if self.processing_interval > self.pending_interval {
            return Err(ConfigError::ValidationFailed(
                "processing interval must be <= pending interval".to_string(),
            ));
        }

        if self.pending_interval > self.max_interval {
            return Err(ConfigError::ValidationFailed(
                "pending interval must be <= max interval".to_string(),
            ));
        }

        if !self.growth_factor.is_finite() || self.growth_factor < 1.0 {
            return Err(ConfigError::InvalidValue(
                "PIX_POLL_GROWTH_FACTOR must be >= 1.0".to_string(),
            ));
        }

        if self.request_timeout.is_zero() {
            return Err(ConfigError::InvalidValue(
                "PIX_POLL_REQUEST_TIMEOUT_MS cannot be 0".to_string(),
            ));
        }

        Ok(())
    }
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(GatewayConfig {
            base_url: env::var("PAYMENTS_API_BASE_URL")
                .map_err(|_| ConfigError::MissingVariable("PAYMENTS_API_BASE_URL".to_string()))?,
            api_token: env::var("PAYMENTS_API_TOKEN")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            timeout_secs: env::var("PAYMENTS_API_TIMEOUT_SECS")
                .unwrap_or_else(|_| "10".to_string())
                .parse()
                .map_err(|_| ConfigError::InvalidValue("PAYMENTS_API_TIMEOUT_SECS".to_string()))?,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_url.is_empty() {
            return Err(ConfigError::InvalidValue(
                "PAYMENTS_API_BASE_URL".to_string(),
            ));
        }

        if !self.base_url.starts_with("http://") && !self.base_url.starts_with("https://") {
            return Err(ConfigError::InvalidValue(
                "PAYMENTS_API_BASE_URL must be a valid URL".to_string(),
            ));
        }

        if self.timeout_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "PAYMENTS_API_TIMEOUT_SECS".to_string(),
            ));
        }

        Ok(())
    }
}

impl LoggingConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(LoggingConfig {
            level: env::var("LOG_LEVEL").unwrap_or_else(|_| "INFO".to_string()),
            format: match env::var("LOG_FORMAT")
                .unwrap_or_else(|_| "plain".to_string())
                .as_str()
            {
                "json" => LogFormat::Json,
                _ => LogFormat::Plain,
            },
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["TRACE", "DEBUG", "INFO", "WARN", "ERROR"];
        if !valid_levels.contains(&self.level.to_uppercase().as_str()) {
            return Err(ConfigError::InvalidValue("LOG_LEVEL".to_string()));
        }

        Ok(())
    }
}

fn env_millis(key: &str, default: Duration) -> Result<Duration, ConfigError> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Duration::from_millis)
            .map_err(|_| ConfigError::InvalidValue(key.to_string())),
        Err(_) => Ok(default),
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVariable(String),

    #[error("Invalid value for configuration: {0}")]
    InvalidValue(String),

    #[error("Validation failed: {0}")]
    ValidationFailed(String),
}

impl From<std::num::ParseIntError> for ConfigError {
    fn from(_: std::num::ParseIntError) -> Self {
        ConfigError::InvalidValue("Failed to parse integer value".to_string())
    }
}

impl From<std::num::ParseFloatError> for ConfigError {
    fn from(_: std::num::ParseFloatError) -> Self {
        ConfigError::InvalidValue("Failed to parse float value".to_string())
    }
}
