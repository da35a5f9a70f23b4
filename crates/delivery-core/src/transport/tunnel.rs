use std::sync::{Arc, Weak};

use delivery_types::transport::TransportType;
use delivery_types::{DeliveryError, Message, MimeType};
use tracing::debug;

use super::{Transport, TransportCore};
use crate::participant::MailboxSender;
use crate::service::DeliveryService;
use crate::stats::{Stats, counter};
use crate::subscription::{SubscriptionId, SubscriptionMatcher};
use crate::tunnel::{TunnelEndpoint, encode_message};

/// Transport for participants reached through a remote tunnel.
///
/// Requests arriving from the tunnel carry the remote session in their tunnel
/// headers; the transaction subscription keeps those headers so the response
/// goes back to the same session. Without an attached endpoint, routed
/// messages fall back to the local mailbox.
pub struct TunnelTransport {
    core: TransportCore,
    self_ref: Weak<TunnelTransport>,
    mailbox: MailboxSender,
    endpoint: Option<Arc<dyn TunnelEndpoint>>,
}

impl TunnelTransport {
    pub(crate) fn new(
        client_uri: &str,
        service: Weak<DeliveryService>,
        mailbox: MailboxSender,
        endpoint: Option<Arc<dyn TunnelEndpoint>>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            core: TransportCore::new(client_uri, service),
            self_ref: self_ref.clone(),
            mailbox,
            endpoint,
        })
    }

    fn owner(&self) -> Result<Arc<dyn Transport>, DeliveryError> {
        let owner: Arc<dyn Transport> = self.self_ref.upgrade().ok_or_else(|| {
            DeliveryError::ServiceStopped(format!("transport for {} dropped", self.client_uri()))
        })?;
        Ok(owner)
    }

    pub fn has_endpoint(&self) -> bool {
        self.endpoint.is_some()
    }

    /// Session a routed message should go to, `None` for every session.
    ///
    /// Only responses are pinned to a session, and only when their tunnel
    /// headers name this transport.
    fn target_session(&self, message: &Message) -> Option<String> {
        if message.mime_type() != Some(MimeType::Response) {
            return None;
        }
        message
            .tunnel_headers()
            .filter(|headers| headers.subscriber_transport_uri == self.client_uri())
            .map(|headers| headers.subscriber_aeron_session_id)
    }
}

impl Transport for TunnelTransport {
    fn transport_type(&self) -> TransportType {
        TransportType::RemoteTunnel
    }

    fn client_uri(&self) -> &str {
        self.core.client_uri()
    }

    fn stats(&self) -> &Stats {
        self.core.stats()
    }

    fn deliver_publish(&self, message: Message) -> Result<(), DeliveryError> {
        self.core.publish(message)
    }

    fn deliver_request(&self, message: Message) -> Result<String, DeliveryError> {
        let tunnel_headers = message.tunnel_headers();
        self.core.request(message, self.owner()?, tunnel_headers)
    }

    fn deliver_response(&self, message: Message) -> Result<(), DeliveryError> {
        self.core.response(message)
    }

    fn deliver_back_to_client(&self, message: Message) -> Result<(), DeliveryError> {
        let Some(endpoint) = &self.endpoint else {
            return self.core.track(
                "deliver_back_to_client",
                counter::DELIVER_BACK_TO_CLIENT_COUNT,
                counter::DELIVER_BACK_TO_CLIENT_ERRORS_COUNT,
                || self.mailbox.push(message),
            );
        };
        self.core.track(
            "deliver_back_to_client",
            counter::TUNNEL_OUTBOUND_COUNT,
            counter::DELIVER_BACK_TO_CLIENT_ERRORS_COUNT,
            || {
                let session = self.target_session(&message);
                let payload = encode_message(&message)?;
                debug!(
                    uri = %self.client_uri(),
                    session = session.as_deref().unwrap_or("*"),
                    "sending message through tunnel"
                );
                endpoint.send(session.as_deref(), payload)
            },
        )
    }

    fn subscribe(
        &self,
        matcher: Arc<SubscriptionMatcher>,
        expiration_epoch_ms: Option<i64>,
        description: Option<String>,
    ) -> Result<SubscriptionId, DeliveryError> {
        self.core
            .subscribe(self.owner()?, matcher, expiration_epoch_ms, description)
    }

    fn unsubscribe(&self, matcher: &SubscriptionMatcher) -> Result<(), DeliveryError> {
        self.core.unsubscribe(matcher)
    }
}
