//! Application configuration structures.

use relay_core::LoggingConfig;
use relay_jobs::JobsConfig;
use serde::{Deserialize, Serialize};

/// Root application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Application name and metadata.
    #[serde(default)]
    pub app: AppMetadata,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Execution core configuration.
    #[serde(default)]
    pub jobs: JobsConfig,
}

impl AppConfig {
    /// Returns true when running with `environment = "production"`.
    pub fn is_production(&self) -> bool {
        self.app.environment.eq_ignore_ascii_case("production")
    }
}

/// Application metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppMetadata {
    /// Application name.
    #[serde(default = "default_name")]
    pub name: String,
    /// Application version.
    #[serde(default = "default_version")]
    pub version: String,
    /// Environment (development, staging, production).
    #[serde(default = "default_environment")]
    pub environment: String,
}

fn default_name() -> String {
    "relay".to_string()
}

fn default_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_environment() -> String {
    "development".to_string()
}

impl Default for AppMetadata {
    fn default() -> Self {
        Self {
            name: default_name(),
            version: default_version(),
            environment: default_environment(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.app.name, "relay");
        assert_eq!(config.app.environment, "development");
        assert!(!config.is_production());
        assert_eq!(config.jobs.worker.concurrency, 4);
        assert_eq!(config.logging.filter, "info,relay=debug");
    }

    #[test]
    fn test_partial_document_fills_defaults() {
        let config: AppConfig = serde_json::from_value(serde_json::json!({
            "app": { "environment": "Production" },
            "jobs": { "scheduler": { "region": "eu" } }
        }))
        .unwrap();

        assert!(config.is_production());
        assert_eq!(config.app.name, "relay");
        assert_eq!(config.jobs.scheduler.region, "eu");
        assert_eq!(config.jobs.scheduler.batch_size, 50);
    }
}
