//! Application Configuration
//!
//! Loaded from environment variables (a `.env` file is read first when
//! present). Exchange credentials are mandatory; everything else has a
//! sensible default.

use serde::Deserialize;

fn default_database_url() -> String {
    "sqlite://trading.db".to_string()
}

fn default_environment() -> String {
    "development".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub upbit_access_key: String,
    pub upbit_secret_key: String,

    /// Operator identifier allowed to drive the console.
    #[serde(default)]
    pub admin_user_id: Option<String>,

    /// Destination id for pushed notifications.
    #[serde(default)]
    pub notify_channel_id: Option<String>,

    #[serde(default = "default_database_url")]
    pub database_url: String,

    /// Prometheus exporter port; 0 disables the exporter.
    #[serde(default)]
    pub metrics_port: u16,

    #[serde(default = "default_environment")]
    pub environment: String,
}

impl AppConfig {
    pub fn load() -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(config::Environment::default())
            .build()?
            .try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn load_with(pairs: &[(&str, &str)]) -> Result<AppConfig, config::ConfigError> {
        let mut builder = config::Config::builder();
        for (key, value) in pairs {
            builder = builder.set_override(*key, *value).unwrap();
        }
        builder.build()?.try_deserialize()
    }

    #[test]
    fn test_defaults_applied() {
        let cfg = load_with(&[
            ("upbit_access_key", "ak"),
            ("upbit_secret_key", "sk"),
        ])
        .unwrap();

        assert_eq!(cfg.database_url, "sqlite://trading.db");
        assert_eq!(cfg.environment, "development");
        assert_eq!(cfg.metrics_port, 0);
        assert_eq!(cfg.admin_user_id, None);
    }

    #[test]
    fn test_missing_credentials_fatal() {
        assert!(load_with(&[("upbit_access_key", "ak")]).is_err());
    }
}
