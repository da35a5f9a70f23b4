//! Configuration loader for the delivery service.
//!
//! Reads a `delivery.toml` file and deserializes it into [`DeliveryConfig`].
//! [`load_config`] falls back to defaults when the file is missing or
//! malformed; [`load_config_strict`] reports the problem instead.

use std::path::{Path, PathBuf};

use delivery_types::DeliveryError;
use delivery_types::config::DeliveryConfig;
use thiserror::Error;

/// Conventional file name looked up in the working directory.
pub const CONFIG_FILE_NAME: &str = "delivery.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error(transparent)]
    Invalid(#[from] DeliveryError),
}

/// Load configuration from `path`.
///
/// - Missing file: returns [`DeliveryConfig::default()`].
/// - Unreadable, malformed, or invalid file: logs a warning and returns the default.
pub async fn load_config(path: &Path) -> DeliveryConfig {
    match load_config_strict(path).await {
        Ok(config) => config,
        Err(ConfigError::Read { source, .. }) if source.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config found at {}, using defaults", path.display());
            DeliveryConfig::default()
        }
        Err(err) => {
            tracing::warn!("{err}, using defaults");
            DeliveryConfig::default()
        }
    }
}

/// Load and validate configuration from `path`, returning any failure.
pub async fn load_config_strict(path: &Path) -> Result<DeliveryConfig, ConfigError> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
    let config = parse_config(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    config.validate()?;
    Ok(config)
}

pub fn parse_config(content: &str) -> Result<DeliveryConfig, toml::de::Error> {
    toml::from_str(content)
}

/// Render `config` as TOML.
pub fn to_toml(config: &DeliveryConfig) -> Result<String, toml::ser::Error> {
    toml::to_string_pretty(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use delivery_types::config::TunnelRole;
    use tempfile::TempDir;

    #[tokio::test]
    async fn load_config_missing_file_returns_default() {
        let tmp = TempDir::new().unwrap();
        let config = load_config(&tmp.path().join(CONFIG_FILE_NAME)).await;
        assert_eq!(config, DeliveryConfig::default());
    }

    #[tokio::test]
    async fn load_config_valid_toml_returns_parsed() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(CONFIG_FILE_NAME);
        tokio::fs::write(
            &path,
            r#"
service_uri = "broker"
sweep_interval_ms = 200

[tunnel]
role = "client"
base_directory = "/dev/shm/delivery"
address = "192.168.12.34"
data_port = 44000
control_port = 44001
"#,
        )
        .await
        .unwrap();

        let config = load_config(&path).await;
        assert_eq!(config.service_uri, "broker");
        assert_eq!(config.sweep_interval_ms, 200);
        assert_eq!(config.default_transaction_expiration_ms, 1_000);
        let tunnel = config.tunnel.unwrap();
        assert_eq!(tunnel.role, TunnelRole::Client);
        assert_eq!(tunnel.address, "192.168.12.34");
    }

    #[tokio::test]
    async fn load_config_invalid_toml_returns_default() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(CONFIG_FILE_NAME);
        tokio::fs::write(&path, "this is not { valid toml !!!")
            .await
            .unwrap();

        assert_eq!(load_config(&path).await, DeliveryConfig::default());
        assert!(matches!(
            load_config_strict(&path).await,
            Err(ConfigError::Parse { .. })
        ));
    }

    #[tokio::test]
    async fn strict_load_rejects_invalid_values() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(CONFIG_FILE_NAME);
        tokio::fs::write(
            &path,
            r#"
[tunnel]
role = "server"
base_directory = "/dev/shm/delivery"
address = "0.0.0.0"
data_port = 44000
control_port = 44001
"#,
        )
        .await
        .unwrap();

        assert!(matches!(
            load_config_strict(&path).await,
            Err(ConfigError::Invalid(DeliveryError::InvalidConfig(_)))
        ));
        assert!(load_config(&path).await.tunnel.is_none());
    }

    #[tokio::test]
    async fn strict_load_reports_missing_file() {
        let tmp = TempDir::new().unwrap();
        let err = load_config_strict(&tmp.path().join("absent.toml"))
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
        assert!(err.to_string().contains("absent.toml"));
    }

    #[test]
    fn toml_output_parses_back() {
        let config = DeliveryConfig::default();
        let rendered = to_toml(&config).unwrap();
        assert_eq!(parse_config(&rendered).unwrap(), config);
    }
}
