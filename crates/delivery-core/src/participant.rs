//! Participants: endpoints that own a mailbox and talk through a transport.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use delivery_types::message::DEFAULT_TRANSACTION_EXPIRATION_MS;
use delivery_types::transport::TransportType;
use delivery_types::{DeliveryError, Message, MimeType};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::service::DeliveryService;
use crate::subscription::{SubscriptionId, SubscriptionMatcher};
use crate::transport::Transport;

static NEXT_PARTICIPANT: AtomicU64 = AtomicU64::new(1);

/// Capability required to obtain a transport from the service.
pub trait Transportable {
    /// Stable identity; doubles as the address matched by the default subscription.
    fn uri(&self) -> &str;

    /// Where the transport puts routed messages.
    fn mailbox_sender(&self) -> MailboxSender;
}

/// Producer side of a mailbox, held by the transport.
#[derive(Debug, Clone)]
pub struct MailboxSender {
    tx: mpsc::UnboundedSender<Message>,
}

impl MailboxSender {
    /// Enqueue without blocking.
    pub fn push(&self, message: Message) -> Result<(), DeliveryError> {
        self.tx
            .send(message)
            .map_err(|_| DeliveryError::ServiceStopped("mailbox receiver dropped".to_string()))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Unbounded FIFO of messages routed to one participant.
#[derive(Debug)]
pub struct Mailbox {
    tx: mpsc::UnboundedSender<Message>,
    rx: mpsc::UnboundedReceiver<Message>,
}

impl Mailbox {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx }
    }

    pub fn sender(&self) -> MailboxSender {
        MailboxSender {
            tx: self.tx.clone(),
        }
    }

    /// Pop the oldest message, `None` if empty.
    pub fn try_recv(&mut self) -> Option<Message> {
        self.rx.try_recv().ok()
    }

    /// Wait for the next message.
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    pub fn drain(&mut self) -> Vec<Message> {
        let mut drained = Vec::with_capacity(self.rx.len());
        while let Ok(message) = self.rx.try_recv() {
            drained.push(message);
        }
        drained
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

impl Default for Mailbox {
    fn default() -> Self {
        Self::new()
    }
}

/// A mailbox-owning participant with at most one transport.
///
/// The default URI is `<kind>@<8 hex digits>`, unique within the process. It
/// can be replaced with [`Participant::set_uri`] until a transport is acquired.
pub struct Participant {
    uri: String,
    mailbox: Mailbox,
    transport: Option<Arc<dyn Transport>>,
    /// Lifetime of requests sent with [`Participant::request`]; taken from the
    /// service on connect.
    transaction_expiration_ms: i64,
}

impl Participant {
    pub fn new(kind: &str) -> Self {
        let instance = NEXT_PARTICIPANT.fetch_add(1, Ordering::Relaxed);
        Self::with_uri(format!("{kind}@{instance:08x}"))
    }

    pub fn with_uri(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            mailbox: Mailbox::new(),
            transport: None,
            transaction_expiration_ms: DEFAULT_TRANSACTION_EXPIRATION_MS,
        }
    }

    /// Change the URI. Fails once a transport exists, since subscriptions
    /// were registered under the old one.
    pub fn set_uri(&mut self, uri: impl Into<String>) -> Result<(), DeliveryError> {
        if self.transport.is_some() {
            return Err(DeliveryError::NotSupported(format!(
                "{} already has a transport",
                self.uri
            )));
        }
        self.uri = uri.into();
        Ok(())
    }

    /// Obtain (or reuse) a transport from `service`.
    pub fn connect(
        &mut self,
        service: &DeliveryService,
        transport_type: TransportType,
    ) -> Result<Arc<dyn Transport>, DeliveryError> {
        if let Some(transport) = &self.transport {
            return Ok(Arc::clone(transport));
        }
        let transport = service.create_new_transport(&*self, transport_type)?;
        self.transport = Some(Arc::clone(&transport));
        self.transaction_expiration_ms = service.config().default_transaction_expiration_ms;
        Ok(transport)
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_some()
    }

    pub fn transport(&self) -> Result<&Arc<dyn Transport>, DeliveryError> {
        self.transport
            .as_ref()
            .ok_or_else(|| DeliveryError::NotConnected(self.uri.clone()))
    }

    pub fn publish(&self, message: Message) -> Result<(), DeliveryError> {
        self.transport()?.deliver_publish(message)
    }

    /// Returns the transaction id the response will carry.
    pub fn send_request(&self, message: Message) -> Result<String, DeliveryError> {
        self.transport()?.deliver_request(message)
    }

    /// Send `body` to `to` as a request expiring after the service's
    /// configured transaction lifetime.
    pub fn request(
        &self,
        to: impl Into<String>,
        body: impl Into<Value>,
    ) -> Result<String, DeliveryError> {
        self.send_request(Message::request_with_default(
            self.uri.as_str(),
            to,
            body,
            None,
            self.transaction_expiration_ms,
        ))
    }

    pub fn send_response(&self, message: Message) -> Result<(), DeliveryError> {
        self.transport()?.deliver_response(message)
    }

    /// Answer `request` with `body`.
    pub fn respond(&self, request: &Message, body: impl Into<Value>) -> Result<(), DeliveryError> {
        if request.mime_type() != Some(MimeType::Request) {
            return Err(DeliveryError::InvalidMessage(format!(
                "{} can only respond to requests",
                self.uri
            )));
        }
        self.send_response(Message::response(self.uri.as_str(), body, request))
    }

    pub fn subscribe(
        &self,
        matcher: Arc<SubscriptionMatcher>,
        description: Option<&str>,
    ) -> Result<SubscriptionId, DeliveryError> {
        self.transport()?
            .subscribe(matcher, None, description.map(str::to_string))
    }

    /// Subscribe until `expiration_epoch_ms`.
    pub fn subscribe_until(
        &self,
        matcher: Arc<SubscriptionMatcher>,
        expiration_epoch_ms: i64,
        description: Option<&str>,
    ) -> Result<SubscriptionId, DeliveryError> {
        self.transport()?.subscribe(
            matcher,
            Some(expiration_epoch_ms),
            description.map(str::to_string),
        )
    }

    pub fn unsubscribe(&self, matcher: &SubscriptionMatcher) -> Result<(), DeliveryError> {
        self.transport()?.unsubscribe(matcher)
    }

    pub fn try_recv(&mut self) -> Option<Message> {
        self.mailbox.try_recv()
    }

    pub async fn recv(&mut self) -> Option<Message> {
        self.mailbox.recv().await
    }

    pub fn drain(&mut self) -> Vec<Message> {
        self.mailbox.drain()
    }

    pub fn pending(&self) -> usize {
        self.mailbox.len()
    }
}

impl Transportable for Participant {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn mailbox_sender(&self) -> MailboxSender {
        self.mailbox.sender()
    }
}

impl std::fmt::Debug for Participant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Participant")
            .field("uri", &self.uri)
            .field("pending", &self.mailbox.len())
            .field(
                "transport",
                &self.transport.as_ref().map(|t| t.transport_type()),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_uri_has_kind_and_instance() {
        let a = Participant::new("Scanner");
        let b = Participant::new("Scanner");
        assert!(a.uri().starts_with("Scanner@"));
        assert_eq!(a.uri().len(), "Scanner@".len() + 8);
        assert_ne!(a.uri(), b.uri());
    }

    #[test]
    fn mailbox_is_fifo() {
        let mut mailbox = Mailbox::new();
        let sender = mailbox.sender();
        sender.push(Message::publish("a", "b", 1)).unwrap();
        sender.push(Message::publish("a", "b", 2)).unwrap();
        assert_eq!(mailbox.len(), 2);

        assert_eq!(mailbox.try_recv().unwrap().body, 1);
        assert_eq!(mailbox.drain().len(), 1);
        assert!(mailbox.try_recv().is_none());
        assert!(mailbox.is_empty());
    }

    #[test]
    fn sender_reports_dropped_mailbox() {
        let mailbox = Mailbox::new();
        let sender = mailbox.sender();
        drop(mailbox);
        assert!(sender.is_closed());
        assert!(matches!(
            sender.push(Message::default()),
            Err(DeliveryError::ServiceStopped(_))
        ));
    }

    #[test]
    fn unconnected_participant_cannot_publish() {
        let participant = Participant::with_uri("lonely");
        assert!(matches!(
            participant.publish(Message::publish("lonely", "/x", "hi")),
            Err(DeliveryError::NotConnected(_))
        ));
    }

    #[test]
    fn set_uri_before_connect() {
        let mut participant = Participant::new("Worker");
        participant.set_uri("worker_7").unwrap();
        assert_eq!(participant.uri(), "worker_7");
    }
}
