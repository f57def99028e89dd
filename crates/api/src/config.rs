//! Application configuration

use std::env;

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Configuration shared by the API server and the sweep worker, loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    // Server
    pub bind_address: String,

    // Database
    pub database_url: String,
    pub database_max_connections: u32,
    pub run_migrations: bool,

    // Trials
    /// Trial length for features registered without an explicit `trialDays`
    pub default_trial_days: i32,

    // Sweep
    pub sweep_interval_secs: u64,
    pub sweep_batch_size: i64,
    pub enable_sweep_endpoint: bool,

    // Logging
    pub log_format: LogFormat,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:3000".to_string(),
            database_url: String::new(),
            database_max_connections: 5,
            run_migrations: true,
            default_trial_days: 14,
            sweep_interval_secs: 900,
            sweep_batch_size: 500,
            enable_sweep_endpoint: true,
            log_format: LogFormat::Pretty,
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let sweep_interval_secs = parse_or("SWEEP_INTERVAL_SECS", defaults.sweep_interval_secs);
        if sweep_interval_secs == 0 {
            return Err(ConfigError::Invalid("SWEEP_INTERVAL_SECS must be greater than 0"));
        }

        let sweep_batch_size = parse_or("SWEEP_BATCH_SIZE", defaults.sweep_batch_size);
        if !(1..=10_000).contains(&sweep_batch_size) {
            return Err(ConfigError::Invalid("SWEEP_BATCH_SIZE must be between 1 and 10000"));
        }

        let default_trial_days = parse_or("DEFAULT_TRIAL_DAYS", defaults.default_trial_days);
        if !(1..=365).contains(&default_trial_days) {
            return Err(ConfigError::Invalid("DEFAULT_TRIAL_DAYS must be between 1 and 365"));
        }

        Ok(Self {
            // Server
            bind_address: env::var("BIND_ADDRESS").unwrap_or(defaults.bind_address),

            // Database
            database_url: env::var("DATABASE_URL")
                .map_err(|_| ConfigError::Missing("DATABASE_URL"))?,
            database_max_connections: parse_or(
                "DATABASE_MAX_CONNECTIONS",
                defaults.database_max_connections,
            ),
            run_migrations: parse_or("RUN_MIGRATIONS", defaults.run_migrations),

            default_trial_days,

            sweep_interval_secs,
            sweep_batch_size,
            enable_sweep_endpoint: parse_or("ENABLE_SWEEP_ENDPOINT", defaults.enable_sweep_endpoint),

            log_format: match env::var("LOG_FORMAT").as_deref() {
                Ok("json") => LogFormat::Json,
                _ => LogFormat::Pretty,
            },
        })
    }
}

/// Parse an env var, falling back to `default` when it is unset or malformed
fn parse_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}
