use std::sync::{Arc, Weak};

use delivery_types::transport::TransportType;
use delivery_types::{DeliveryError, Message};

use super::{Transport, TransportCore};
use crate::service::DeliveryService;
use crate::stats::{Stats, counter};
use crate::subscription::{SubscriptionId, SubscriptionMatcher};

/// The service's own transport.
///
/// Every delivery path short-circuits to
/// [`DeliveryService::process_message_from_loopback_transport`]. The loopback
/// cannot hold subscriptions of its own; the service registers its default
/// subscriptions directly.
pub struct LoopbackTransport {
    core: TransportCore,
}

impl LoopbackTransport {
    pub(crate) fn new(service_uri: &str, service: Weak<DeliveryService>) -> Arc<Self> {
        Arc::new(Self {
            core: TransportCore::new(service_uri, service),
        })
    }

    fn hand_to_service(
        &self,
        operation: &'static str,
        ok_counter: &'static str,
        message: Message,
    ) -> Result<(), DeliveryError> {
        self.core
            .track(operation, ok_counter, counter::DELIVER_ERRORS_COUNT, || {
                self.core
                    .service()?
                    .process_message_from_loopback_transport(message);
                Ok(())
            })
    }
}

impl Transport for LoopbackTransport {
    fn transport_type(&self) -> TransportType {
        TransportType::Loopback
    }

    fn client_uri(&self) -> &str {
        self.core.client_uri()
    }

    fn stats(&self) -> &Stats {
        self.core.stats()
    }

    fn deliver_publish(&self, message: Message) -> Result<(), DeliveryError> {
        self.hand_to_service("deliver_publish", counter::DELIVER_PUBLISH_COUNT, message)
    }

    fn deliver_request(&self, message: Message) -> Result<String, DeliveryError> {
        let transaction_id = message.transaction_id().unwrap_or_default().to_string();
        self.hand_to_service("deliver_request", counter::DELIVER_REQUEST_COUNT, message)?;
        Ok(transaction_id)
    }

    fn deliver_response(&self, message: Message) -> Result<(), DeliveryError> {
        self.hand_to_service("deliver_response", counter::DELIVER_RESPONSE_COUNT, message)
    }

    fn deliver_back_to_client(&self, message: Message) -> Result<(), DeliveryError> {
        self.hand_to_service(
            "deliver_back_to_client",
            counter::DELIVER_BACK_TO_CLIENT_COUNT,
            message,
        )
    }

    fn subscribe(
        &self,
        matcher: Arc<SubscriptionMatcher>,
        _expiration_epoch_ms: Option<i64>,
        _description: Option<String>,
    ) -> Result<SubscriptionId, DeliveryError> {
        Err(DeliveryError::NotSupported(format!(
            "loopback transport cannot subscribe {}",
            matcher.name()
        )))
    }

    fn unsubscribe(&self, matcher: &SubscriptionMatcher) -> Result<(), DeliveryError> {
        Err(DeliveryError::NotSupported(format!(
            "loopback transport cannot unsubscribe {}",
            matcher.name()
        )))
    }
}
