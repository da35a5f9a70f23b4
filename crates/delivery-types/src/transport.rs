//! Transport kinds and tunnel metadata.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DeliveryError;

/// The delivery strategy connecting a participant to the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportType {
    /// The service talking to itself. Exactly one exists per service.
    Loopback,
    /// In-process participant; messages are passed by value, never serialized.
    Local,
    /// Participant reached through a remote tunnel endpoint.
    RemoteTunnel,
}

impl TransportType {
    /// Stable numeric code (loopback = 0, local = 1, remote tunnel = 2).
    pub fn numeric_value(&self) -> u8 {
        match self {
            TransportType::Loopback => 0,
            TransportType::Local => 1,
            TransportType::RemoteTunnel => 2,
        }
    }
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportType::Loopback => write!(f, "loopback"),
            TransportType::Local => write!(f, "local"),
            TransportType::RemoteTunnel => write!(f, "remote_tunnel"),
        }
    }
}

impl FromStr for TransportType {
    type Err = DeliveryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "loopback" => Ok(TransportType::Loopback),
            "local" => Ok(TransportType::Local),
            "remote_tunnel" | "remote-tunnel" | "tunnel" => Ok(TransportType::RemoteTunnel),
            other => Err(DeliveryError::UnsupportedTransportType(format!(
                "'{other}' is not a transport type"
            ))),
        }
    }
}

impl TryFrom<u8> for TransportType {
    type Error = DeliveryError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(TransportType::Loopback),
            1 => Ok(TransportType::Local),
            2 => Ok(TransportType::RemoteTunnel),
            other => Err(DeliveryError::UnsupportedTransportType(format!(
                "numeric transport type {other}"
            ))),
        }
    }
}

/// Routing metadata for a destination behind a remote tunnel.
///
/// Carried on messages as the `subscriber_transport_uri` and
/// `subscriber_aeron_session_id` headers and on tunnel subscriptions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TunnelHeaders {
    pub subscriber_transport_uri: String,
    pub subscriber_aeron_session_id: String,
}

impl TunnelHeaders {
    pub fn new(transport_uri: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            subscriber_transport_uri: transport_uri.into(),
            subscriber_aeron_session_id: session_id.into(),
        }
    }
}
