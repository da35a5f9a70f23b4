//! Configuration types for the delivery service.
//!
//! `DeliveryConfig` is the top-level `delivery.toml` document. The optional
//! `[tunnel]` table enables a remote-tunnel endpoint in client or server role.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DeliveryError;
use crate::message::DEFAULT_TRANSACTION_EXPIRATION_MS;

/// Well-known URI of the delivery service itself.
pub const DEFAULT_SERVICE_URI: &str = "delivery_service";

/// Top-level configuration for a delivery service instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// URI the service registers for itself.
    #[serde(default = "default_service_uri")]
    pub service_uri: String,

    /// Minimum interval between two expiration sweeps of the same registry.
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,

    /// Transaction lifetime for requests built without an explicit deadline.
    #[serde(default = "default_transaction_expiration_ms")]
    pub default_transaction_expiration_ms: i64,

    /// Remote tunnel endpoint settings. Absent means in-process only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tunnel: Option<TunnelConfig>,
}

fn default_service_uri() -> String {
    DEFAULT_SERVICE_URI.to_string()
}

fn default_sweep_interval_ms() -> u64 {
    1_000
}

fn default_transaction_expiration_ms() -> i64 {
    DEFAULT_TRANSACTION_EXPIRATION_MS
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            service_uri: default_service_uri(),
            sweep_interval_ms: default_sweep_interval_ms(),
            default_transaction_expiration_ms: default_transaction_expiration_ms(),
            tunnel: None,
        }
    }
}

impl DeliveryConfig {
    /// Check the configuration, including the tunnel section when present.
    pub fn validate(&self) -> Result<(), DeliveryError> {
        if self.service_uri.trim().is_empty() {
            return Err(DeliveryError::InvalidConfig(
                "service_uri must not be empty".to_string(),
            ));
        }
        if self.default_transaction_expiration_ms <= 0 {
            return Err(DeliveryError::InvalidConfig(format!(
                "default_transaction_expiration_ms must be positive, got {}",
                self.default_transaction_expiration_ms
            )));
        }
        if let Some(tunnel) = &self.tunnel {
            tunnel.validate()?;
        }
        Ok(())
    }
}

/// Which side of the tunnel this process plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelRole {
    Client,
    Server,
}

impl fmt::Display for TunnelRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunnelRole::Client => write!(f, "client"),
            TunnelRole::Server => write!(f, "server"),
        }
    }
}

impl FromStr for TunnelRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "client" => Ok(TunnelRole::Client),
            "server" => Ok(TunnelRole::Server),
            other => Err(format!("invalid tunnel role: '{other}'")),
        }
    }
}

/// Remote tunnel endpoint settings.
///
/// For the server role `address` is the bind address; for the client role it
/// is the server to connect to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelConfig {
    pub role: TunnelRole,
    /// Working directory of the endpoint (shared-memory media directory).
    pub base_directory: PathBuf,
    pub address: String,
    pub data_port: u16,
    pub control_port: u16,
    /// First port handed to connecting clients (server role only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clients_base_port: Option<u16>,
    /// Maximum number of connected clients (server role only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_clients: Option<u32>,
    /// Sessions allowed from a single peer address.
    #[serde(default = "default_max_connections_per_address")]
    pub max_connections_per_address: u32,
}

/// Sessions one peer address may hold at a time.
pub fn default_max_connections_per_address() -> u32 {
    3
}

impl TunnelConfig {
    /// Client-role configuration connecting to `remote_address`.
    pub fn client(
        base_directory: impl Into<PathBuf>,
        remote_address: impl Into<String>,
        data_port: u16,
        control_port: u16,
    ) -> Self {
        Self {
            role: TunnelRole::Client,
            base_directory: base_directory.into(),
            address: remote_address.into(),
            data_port,
            control_port,
            clients_base_port: None,
            max_clients: None,
            max_connections_per_address: default_max_connections_per_address(),
        }
    }

    /// Server-role configuration bound to `local_address`.
    pub fn server(
        base_directory: impl Into<PathBuf>,
        local_address: impl Into<String>,
        data_port: u16,
        control_port: u16,
        clients_base_port: u16,
        max_clients: u32,
    ) -> Self {
        Self {
            role: TunnelRole::Server,
            base_directory: base_directory.into(),
            address: local_address.into(),
            data_port,
            control_port,
            clients_base_port: Some(clients_base_port),
            max_clients: Some(max_clients),
            max_connections_per_address: default_max_connections_per_address(),
        }
    }

    pub fn validate(&self) -> Result<(), DeliveryError> {
        if self.address.trim().is_empty() {
            return Err(DeliveryError::InvalidConfig(
                "tunnel address must not be empty".to_string(),
            ));
        }
        if self.data_port == 0 || self.control_port == 0 {
            return Err(DeliveryError::InvalidConfig(format!(
                "tunnel ports must be non-zero (data {}, control {})",
                self.data_port, self.control_port
            )));
        }
        if self.max_connections_per_address == 0 {
            return Err(DeliveryError::InvalidConfig(
                "max_connections_per_address must be at least 1".to_string(),
            ));
        }
        if self.role == TunnelRole::Server {
            match (self.clients_base_port, self.max_clients) {
                (Some(port), Some(count)) if port != 0 && count > 0 => {}
                _ => {
                    return Err(DeliveryError::InvalidConfig(
                        "server role requires non-zero clients_base_port and max_clients"
                            .to_string(),
                    ));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delivery_config_default_values() {
        let config = DeliveryConfig::default();
        assert_eq!(config.service_uri, "delivery_service");
        assert_eq!(config.sweep_interval_ms, 1_000);
        assert_eq!(config.default_transaction_expiration_ms, 1_000);
        assert!(config.tunnel.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_delivery_config_deserialize_with_defaults() {
        let config: DeliveryConfig = toml::from_str("").unwrap();
        assert_eq!(config, DeliveryConfig::default());
    }

    #[test]
    fn test_delivery_config_deserialize_server_tunnel() {
        let toml_str = r#"
sweep_interval_ms = 250

[tunnel]
role = "server"
base_directory = "/run/shm/delivery"
address = "0.0.0.0"
data_port = 44000
control_port = 44001
clients_base_port = 55000
max_clients = 10
"#;
        let config: DeliveryConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.sweep_interval_ms, 250);
        let tunnel = config.tunnel.as_ref().unwrap();
        assert_eq!(tunnel.role, TunnelRole::Server);
        assert_eq!(tunnel.max_clients, Some(10));
        assert_eq!(tunnel.max_connections_per_address, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_server_tunnel_requires_client_settings() {
        let mut tunnel = TunnelConfig::server("/tmp/d", "0.0.0.0", 44000, 44001, 55000, 10);
        assert!(tunnel.validate().is_ok());
        tunnel.max_clients = None;
        assert!(matches!(
            tunnel.validate(),
            Err(DeliveryError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_client_tunnel_rejects_zero_port() {
        let tunnel = TunnelConfig::client("/tmp/d", "192.168.12.34", 0, 44001);
        assert!(tunnel.validate().is_err());
    }

    #[test]
    fn test_tunnel_rejects_zero_connections_per_address() {
        let mut tunnel = TunnelConfig::client("/tmp/d", "192.168.12.34", 44000, 44001);
        tunnel.max_connections_per_address = 0;
        assert!(matches!(
            tunnel.validate(),
            Err(DeliveryError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_tunnel_role_parse() {
        assert_eq!("SERVER".parse::<TunnelRole>().unwrap(), TunnelRole::Server);
        assert!("peer".parse::<TunnelRole>().is_err());
    }

    #[test]
    fn test_empty_service_uri_is_invalid() {
        let config = DeliveryConfig {
            service_uri: " ".to_string(),
            ..DeliveryConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
