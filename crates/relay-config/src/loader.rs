//! Configuration loader with layered sources.

use crate::validation::{format_validation_errors, ConfigValidator};
use crate::AppConfig;
use config::{Config, ConfigError, Environment, File};
use relay_core::RelayError;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Configuration loader with runtime refresh support.
#[derive(Clone)]
pub struct ConfigLoader {
    config: Arc<RwLock<AppConfig>>,
    config_dir: String,
}

impl ConfigLoader {
    /// Creates a new configuration loader.
    ///
    /// Configuration is loaded from multiple sources in order:
    /// 1. `config/default.toml` - Default values
    /// 2. `config/{environment}.toml` - Environment-specific overrides
    /// 3. `config/local.toml` - Local overrides
    /// 4. Environment variables with `RELAY_` prefix and `__` nesting,
    ///    e.g. `RELAY_JOBS__DRIVER__REDIS_URL`
    pub fn new(config_dir: impl Into<String>) -> Result<Self, RelayError> {
        let config_dir = config_dir.into();
        let config = Self::load_config(&config_dir)?;

        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            config_dir,
        })
    }

    /// Loads configuration from the default location (`./config`).
    pub fn from_default_location() -> Result<Self, RelayError> {
        Self::new("./config")
    }

    /// Returns the current configuration.
    pub async fn get(&self) -> AppConfig {
        self.config.read().await.clone()
    }

    /// Reloads the configuration from disk.
    ///
    /// The previous configuration stays in place if the new one is invalid.
    pub async fn reload(&self) -> Result<(), RelayError> {
        let new_config = Self::load_config(&self.config_dir)?;
        let mut config = self.config.write().await;
        *config = new_config;
        info!("Configuration reloaded successfully");
        Ok(())
    }

    /// Gets a specific configuration value by key path.
    pub async fn get_value<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        let config = self.config.read().await;
        let json = serde_json::to_value(&*config).ok()?;

        let mut current = &json;
        for part in key.split('.') {
            current = current.get(part)?;
        }

        serde_json::from_value(current.clone()).ok()
    }

    fn load_config(config_dir: &str) -> Result<AppConfig, RelayError> {
        if let Err(e) = dotenvy::dotenv() {
            debug!("No .env file found or error loading it: {}", e);
        }

        let environment =
            std::env::var("RELAY_ENVIRONMENT").unwrap_or_else(|_| "development".to_string());

        info!("Loading configuration for environment: {}", environment);

        let builder = Self::file_sources(config_dir, &environment).add_source(
            Environment::with_prefix("RELAY")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let app_config = Self::build(builder)?;
        Self::validate_config(&app_config)?;
        Ok(app_config)
    }

    fn file_sources(
        config_dir: &str,
        environment: &str,
    ) -> config::ConfigBuilder<config::builder::DefaultState> {
        let mut builder = Config::builder();

        for name in ["default", environment, "local"] {
            let path = format!("{}/{}.toml", config_dir, name);
            if Path::new(&path).exists() {
                debug!("Loading config from: {}", path);
                builder = builder.add_source(File::with_name(&path).required(false));
            }
        }

        builder
    }

    fn build(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<AppConfig, RelayError> {
        builder
            .build()
            .and_then(Config::try_deserialize)
            .map_err(config_error_to_relay_error)
    }

    fn validate_config(config: &AppConfig) -> Result<(), RelayError> {
        if let Err(errors) = ConfigValidator::validate(config) {
            return Err(RelayError::configuration(format_validation_errors(&errors)));
        }

        if config.is_production() && config.jobs.driver.allow_in_memory_fallback {
            warn!("allow_in_memory_fallback is enabled in production; jobs may be lost on restart");
        }

        Ok(())
    }
}

fn config_error_to_relay_error(err: ConfigError) -> RelayError {
    RelayError::Configuration(err.to_string())
}
