use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::path::Path;
use thiserror::Error;
use tracing::{error, info};
use validator::{Validate, ValidationError};

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const DEFAULT_DATABASE_URL: &str = "sqlite://stockflow.db?mode=rwc";
const CONFIG_DIR: &str = "config";

/// Application configuration structure with validation
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Database connection URL
    #[validate(length(min = 1))]
    pub database_url: String,

    /// Application environment
    #[validate(length(min = 1))]
    pub environment: String,

    /// Logging level
    #[serde(default = "default_log_level")]
    #[validate(custom = "validate_log_level")]
    pub log_level: String,

    /// Log in JSON format (structured logging)
    #[serde(default)]
    pub log_json: bool,

    /// Whether to run database migrations on startup
    #[serde(default)]
    pub auto_migrate: bool,

    /// DB pool: max connections
    #[serde(default = "default_db_max_connections")]
    #[validate(range(min = 1))]
    pub db_max_connections: u32,

    /// DB pool: min connections
    #[serde(default = "default_db_min_connections")]
    pub db_min_connections: u32,

    /// DB timeouts (seconds)
    #[serde(default = "default_db_connect_timeout_secs")]
    pub db_connect_timeout_secs: u64,
    #[serde(default = "default_db_idle_timeout_secs")]
    pub db_idle_timeout_secs: u64,
    #[serde(default = "default_db_acquire_timeout_secs")]
    pub db_acquire_timeout_secs: u64,

    /// Capacity of the post-commit event channel
    #[serde(default = "default_event_channel_capacity")]
    #[validate(range(min = 1))]
    pub event_channel_capacity: usize,

    /// Default page size for move-history queries
    #[serde(default = "default_ledger_page_size")]
    #[validate(range(min = 1, max = 1000))]
    pub ledger_default_page_size: u64,
}

impl AppConfig {
    pub fn new(database_url: String, environment: String) -> Self {
        Self {
            database_url,
            environment,
            log_level: default_log_level(),
            log_json: false,
            auto_migrate: false,
            db_max_connections: default_db_max_connections(),
            db_min_connections: default_db_min_connections(),
            db_connect_timeout_secs: default_db_connect_timeout_secs(),
            db_idle_timeout_secs: default_db_idle_timeout_secs(),
            db_acquire_timeout_secs: default_db_acquire_timeout_secs(),
            event_channel_capacity: default_event_channel_capacity(),
            ledger_default_page_size: default_ledger_page_size(),
        }
    }

    pub fn log_level(&self) -> &str {
        &self.log_level
    }

    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }

    fn validate_additional_constraints(&self) -> Result<(), AppConfigError> {
        if self.db_min_connections > self.db_max_connections {
            return Err(AppConfigError::Invalid(format!(
                "db_min_connections ({}) exceeds db_max_connections ({})",
                self.db_min_connections, self.db_max_connections
            )));
        }
        if self.is_production() && self.database_url.starts_with("sqlite::memory") {
            return Err(AppConfigError::Invalid(
                "in-memory SQLite is not allowed in production".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("Configuration loading failed: {0}")]
    Load(#[from] ConfigError),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}
fn default_db_max_connections() -> u32 {
    10
}
fn default_db_min_connections() -> u32 {
    1
}
fn default_db_connect_timeout_secs() -> u64 {
    30
}
fn default_db_idle_timeout_secs() -> u64 {
    600
}
fn default_db_acquire_timeout_secs() -> u64 {
    8
}
fn default_event_channel_capacity() -> usize {
    1024
}
fn default_ledger_page_size() -> u64 {
    50
}

/// Validates log level values
fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if valid_levels.contains(&level.to_lowercase().as_str()) {
        Ok(())
    } else {
        let mut err = ValidationError::new("log_level");
        err.message = Some("Must be one of: trace, debug, info, warn, error".into());
        Err(err)
    }
}

/// Initializes tracing using the provided log level as the default filter
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_directive = format!("stockflow={},sea_orm=warn", level);
    let filter_directive = env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_directive);

    if json {
        let _ = fmt()
            .with_env_filter(EnvFilter::new(filter_directive))
            .json()
            .try_init();
    } else {
        let _ = fmt()
            .with_env_filter(EnvFilter::new(filter_directive))
            .try_init();
    }
}

/// Loads application configuration
///
/// Layers configuration sources in this order:
/// 1. Built-in defaults
/// 2. Default config (config/default.toml)
/// 3. Environment-specific config (config/{env}.toml)
/// 4. Environment variables (APP__*)
pub fn load_config() -> Result<AppConfig, AppConfigError> {
    // Support both RUN_ENV and APP_ENV for selecting config profile
    let run_env = env::var("RUN_ENV")
        .or_else(|_| env::var("APP_ENV"))
        .unwrap_or_else(|_| DEFAULT_ENV.to_string());
    load_config_from(Path::new(CONFIG_DIR), &run_env)
}

/// Same layering as [`load_config`] with an explicit config directory and profile.
pub fn load_config_from(config_dir: &Path, run_env: &str) -> Result<AppConfig, AppConfigError> {
    info!("Loading configuration for environment: {}", run_env);

    if !config_dir.exists() {
        info!(
            "Config directory '{}' not found; relying on built-in defaults and environment variables",
            config_dir.display()
        );
    }

    let config = Config::builder()
        .set_default("database_url", DEFAULT_DATABASE_URL)?
        .set_default("environment", run_env)?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?
        .set_default("log_json", false)?
        .add_source(File::from(config_dir.join("default")).required(false))
        .add_source(File::from(config_dir.join(run_env)).required(false))
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    let app_config: AppConfig = config.try_deserialize()?;

    app_config.validate().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    app_config.validate_additional_constraints().map_err(|e| {
        error!("Configuration constraint check failed: {}", e);
        e
    })?;

    info!("Configuration loaded successfully");
    Ok(app_config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write_profile(dir: &TempDir, name: &str, content: &str) {
        fs::write(dir.path().join(format!("{}.toml", name)), content).unwrap();
    }

    #[test]
    fn defaults_apply_without_config_files() {
        let dir = TempDir::new().unwrap();
        let cfg = load_config_from(dir.path(), "test").unwrap();

        assert_eq!(cfg.environment, "test");
        assert_eq!(cfg.log_level(), "info");
        assert_eq!(cfg.db_max_connections, 10);
        assert_eq!(cfg.ledger_default_page_size, 50);
    }

    #[test]
    fn profile_file_overrides_default_file() {
        let dir = TempDir::new().unwrap();
        write_profile(
            &dir,
            "default",
            r#"
            database_url = "postgres://localhost/default"
            log_level = "warn"
            "#,
        );
        write_profile(
            &dir,
            "staging",
            r#"
            database_url = "postgres://localhost/staging"
            db_max_connections = 4
            "#,
        );

        let cfg = load_config_from(dir.path(), "staging").unwrap();
        assert_eq!(cfg.database_url, "postgres://localhost/staging");
        assert_eq!(cfg.log_level(), "warn");
        assert_eq!(cfg.db_max_connections, 4);
    }

    #[test]
    fn invalid_log_level_is_rejected() {
        let dir = TempDir::new().unwrap();
        write_profile(&dir, "default", r#"log_level = "loud""#);

        let result = load_config_from(dir.path(), "test");
        assert!(matches!(result, Err(AppConfigError::Validation(_))));
    }

    #[test]
    fn min_connections_cannot_exceed_max() {
        let mut cfg = AppConfig::new("sqlite::memory:".into(), "test".into());
        cfg.db_min_connections = 20;
        assert!(matches!(
            cfg.validate_additional_constraints(),
            Err(AppConfigError::Invalid(_))
        ));
    }

    #[test]
    fn production_rejects_in_memory_database() {
        let cfg = AppConfig::new("sqlite::memory:".into(), "production".into());
        assert!(cfg.validate_additional_constraints().is_err());
    }
}
