use std::sync::{Arc, Weak};

use delivery_types::transport::TransportType;
use delivery_types::{DeliveryError, Message};

use super::{Transport, TransportCore};
use crate::participant::MailboxSender;
use crate::service::DeliveryService;
use crate::stats::{Stats, counter};
use crate::subscription::{SubscriptionId, SubscriptionMatcher};

/// Transport for a participant living in this process.
///
/// Messages are passed by value; routed messages land in the participant's
/// mailbox.
pub struct LocalTransport {
    core: TransportCore,
    self_ref: Weak<LocalTransport>,
    mailbox: MailboxSender,
}

impl LocalTransport {
    pub(crate) fn new(
        client_uri: &str,
        service: Weak<DeliveryService>,
        mailbox: MailboxSender,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            core: TransportCore::new(client_uri, service),
            self_ref: self_ref.clone(),
            mailbox,
        })
    }

    fn owner(&self) -> Result<Arc<dyn Transport>, DeliveryError> {
        let owner: Arc<dyn Transport> = self.self_ref.upgrade().ok_or_else(|| {
            DeliveryError::ServiceStopped(format!("transport for {} dropped", self.client_uri()))
        })?;
        Ok(owner)
    }
}

impl Transport for LocalTransport {
    fn transport_type(&self) -> TransportType {
        TransportType::Local
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
        self.core.request(message, self.owner()?, None)
    }

    fn deliver_response(&self, message: Message) -> Result<(), DeliveryError> {
        self.core.response(message)
    }

    fn deliver_back_to_client(&self, message: Message) -> Result<(), DeliveryError> {
        self.core.track(
            "deliver_back_to_client",
            counter::DELIVER_BACK_TO_CLIENT_COUNT,
            counter::DELIVER_BACK_TO_CLIENT_ERRORS_COUNT,
            || self.mailbox.push(message),
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
