//! Remote tunnel endpoint collaborator and the inbound bridge.
//!
//! The endpoint owns connections and sessions; the core only asks it to start
//! in a role, send payloads, and close. Payloads are JSON-encoded messages.

use std::sync::{Arc, Weak};

use delivery_types::config::TunnelConfig;
use delivery_types::message::header;
use delivery_types::{DeliveryError, Message};
use tracing::{debug, warn};

use crate::stats::{Stats, counter};
use crate::transport::Transport;

/// A messaging endpoint connecting this process to remote peers.
pub trait TunnelEndpoint: Send + Sync {
    /// Start in the configured role, forwarding received payloads to `inbound`.
    fn start(
        &self,
        config: &TunnelConfig,
        inbound: Arc<dyn TunnelInbound>,
    ) -> Result<(), DeliveryError>;

    /// Send `payload` to one session, or to every connected session when `None`.
    fn send(&self, session_id: Option<&str>, payload: String) -> Result<(), DeliveryError>;

    fn close(&self);
}

/// Callback invoked by the endpoint for every payload received from a peer.
pub trait TunnelInbound: Send + Sync {
    fn on_payload(&self, session_id: &str, payload: &str);
}

pub fn encode_message(message: &Message) -> Result<String, DeliveryError> {
    serde_json::to_string(message)
        .map_err(|e| DeliveryError::Tunnel(format!("failed to encode message: {e}")))
}

pub fn decode_message(payload: &str) -> Result<Message, DeliveryError> {
    serde_json::from_str(payload)
        .map_err(|e| DeliveryError::InvalidMessage(format!("failed to decode tunnel payload: {e}")))
}

/// Feeds decoded tunnel payloads into the tunnel transport.
pub(crate) struct TunnelBridge {
    transport_uri: String,
    transport: Weak<dyn Transport>,
}

impl TunnelBridge {
    pub(crate) fn new(transport: &Arc<dyn Transport>) -> Self {
        Self {
            transport_uri: transport.client_uri().to_string(),
            transport: Arc::downgrade(transport),
        }
    }

    fn record_failure(stats: &Stats, err: &DeliveryError, session_id: &str) {
        stats.increment(counter::ERRORS_COUNT);
        stats.increment(counter::DELIVER_ERRORS_COUNT);
        warn!(session_id, error = %err, "dropping tunnel payload");
    }
}

impl TunnelInbound for TunnelBridge {
    fn on_payload(&self, session_id: &str, payload: &str) {
        let Some(transport) = self.transport.upgrade() else {
            debug!(session_id, "tunnel transport gone, payload ignored");
            return;
        };
        transport.stats().increment(counter::TUNNEL_INBOUND_COUNT);

        let mut message = match decode_message(payload) {
            Ok(message) => message,
            Err(err) => {
                Self::record_failure(transport.stats(), &err, session_id);
                return;
            }
        };
        // The session is whatever the endpoint says, never what the peer claims.
        message.set_header(header::SUBSCRIBER_AERON_SESSION_ID, session_id);
        message.set_header(header::SUBSCRIBER_TRANSPORT_URI, self.transport_uri.as_str());

        // `deliver` counts and logs its own failures.
        if let Err(err) = transport.deliver(message) {
            debug!(session_id, error = %err, "tunnel payload rejected");
        }
    }
}
