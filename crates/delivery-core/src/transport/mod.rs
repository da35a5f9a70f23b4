//! The transport abstraction connecting participants to the delivery service.
//!
//! Every participant, and the service itself, talks to the router through a
//! `Transport`. Outbound calls (`deliver_publish`, `deliver_request`,
//! `deliver_response`) validate the message and place it on the service's
//! inbound queue. `deliver_back_to_client` is the inbound path the router uses
//! to hand a matched message to the participant.
//!
//! Variants:
//! - [`LoopbackTransport`]: the service addressing itself.
//! - [`LocalTransport`]: in-process participants with a mailbox.
//! - [`TunnelTransport`]: participants behind a remote tunnel endpoint.

mod local;
mod loopback;
mod tunnel;

pub use local::LocalTransport;
pub use loopback::LoopbackTransport;
pub use tunnel::TunnelTransport;

use std::sync::{Arc, Weak};

use delivery_types::message::header;
use delivery_types::transport::{TransportType, TunnelHeaders};
use delivery_types::{DeliveryError, Message, MimeType};
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::service::DeliveryService;
use crate::stats::{Stats, counter};
use crate::subscription::{SubscriberDetails, SubscriptionId, SubscriptionMatcher};

/// Delivery strategy between one participant and the router.
pub trait Transport: Send + Sync {
    fn transport_type(&self) -> TransportType;

    /// URI of the participant this transport serves.
    fn client_uri(&self) -> &str;

    fn stats(&self) -> &Stats;

    /// Dispatch on the message's `mime_type`.
    fn deliver(&self, message: Message) -> Result<(), DeliveryError> {
        match message.mime_type() {
            Some(MimeType::Publish) => self.deliver_publish(message),
            Some(MimeType::Request) => self.deliver_request(message).map(|_| ()),
            Some(MimeType::Response) => self.deliver_response(message),
            None => {
                let err = DeliveryError::UnknownMessageKind(format!(
                    "message from {} has mime_type {}",
                    message.from().unwrap_or("<unknown>"),
                    message
                        .header(header::MIME_TYPE)
                        .map(Value::to_string)
                        .unwrap_or_else(|| "<absent>".to_string())
                ));
                self.stats().increment(counter::ERRORS_COUNT);
                self.stats().increment(counter::DELIVER_ERRORS_COUNT);
                warn!(uri = %self.client_uri(), error = %err, "cannot dispatch message");
                Err(err)
            }
        }
    }

    fn deliver_publish(&self, message: Message) -> Result<(), DeliveryError>;

    /// Returns the request's transaction id, generated if the message had none.
    fn deliver_request(&self, message: Message) -> Result<String, DeliveryError>;

    fn deliver_response(&self, message: Message) -> Result<(), DeliveryError>;

    /// Hand a routed message to the participant. Must not block.
    fn deliver_back_to_client(&self, message: Message) -> Result<(), DeliveryError>;

    fn subscribe(
        &self,
        matcher: Arc<SubscriptionMatcher>,
        expiration_epoch_ms: Option<i64>,
        description: Option<String>,
    ) -> Result<SubscriptionId, DeliveryError>;

    fn unsubscribe(&self, matcher: &SubscriptionMatcher) -> Result<(), DeliveryError>;
}

/// Process-unique transaction id.
pub fn new_transaction_id() -> String {
    format!("transaction-id-{}", Uuid::new_v4())
}

/// Check the `mime_type` and `transaction_id` headers, filling `mime_type`
/// with `kind` when absent.
pub(crate) fn prepare_outbound(message: &mut Message, kind: MimeType) -> Result<(), DeliveryError> {
    match message.header(header::MIME_TYPE).cloned() {
        None => message.set_header(header::MIME_TYPE, kind.as_str()),
        Some(Value::String(raw)) => match raw.parse::<MimeType>() {
            Ok(existing) if existing == kind => {}
            Ok(existing) => {
                return Err(DeliveryError::InvalidMessage(format!(
                    "{existing} message handed to the {kind} path"
                )));
            }
            Err(_) => {
                return Err(DeliveryError::InvalidMessage(format!(
                    "unrecognized mime_type '{raw}'"
                )));
            }
        },
        Some(other) => {
            return Err(DeliveryError::InvalidMessage(format!(
                "mime_type header must be a string, got {other}"
            )));
        }
    }
    if let Some(id) = message.header(header::TRANSACTION_ID) {
        if !id.is_string() {
            return Err(DeliveryError::InvalidMessage(format!(
                "transaction_id header must be a string, got {id}"
            )));
        }
    }
    Ok(())
}

/// Validate a request, assigning a transaction id if needed.
///
/// Returns the transaction id and its expiration. A request without a
/// positive `transaction_expiration_epoch_ms` is rejected.
pub(crate) fn prepare_request(message: &mut Message) -> Result<(String, i64), DeliveryError> {
    prepare_outbound(message, MimeType::Request)?;
    let transaction_id = match message.transaction_id() {
        Some(id) => id.to_string(),
        None => {
            let id = new_transaction_id();
            message.set_header(header::TRANSACTION_ID, id.as_str());
            id
        }
    };
    match message.transaction_expiration_epoch_ms() {
        Some(expiration) if expiration > 0 => Ok((transaction_id, expiration)),
        _ => Err(DeliveryError::MissingExpiration(format!(
            "request {transaction_id} from {} has no transaction_expiration_epoch_ms",
            message.from().unwrap_or("<unknown>")
        ))),
    }
}

/// State and outbound behavior shared by the participant-facing transports.
pub(crate) struct TransportCore {
    client_uri: String,
    service: Weak<DeliveryService>,
    stats: Stats,
}

impl TransportCore {
    pub(crate) fn new(client_uri: impl Into<String>, service: Weak<DeliveryService>) -> Self {
        Self {
            client_uri: client_uri.into(),
            service,
            stats: Stats::new(),
        }
    }

    pub(crate) fn client_uri(&self) -> &str {
        &self.client_uri
    }

    pub(crate) fn stats(&self) -> &Stats {
        &self.stats
    }

    pub(crate) fn service(&self) -> Result<Arc<DeliveryService>, DeliveryError> {
        self.service.upgrade().ok_or_else(|| {
            DeliveryError::ServiceStopped(format!(
                "transport for {} outlived its delivery service",
                self.client_uri
            ))
        })
    }

    /// Run `op`, bumping `ok_counter` on success or the error counters on failure.
    pub(crate) fn track<T>(
        &self,
        operation: &'static str,
        ok_counter: &'static str,
        err_counter: &'static str,
        op: impl FnOnce() -> Result<T, DeliveryError>,
    ) -> Result<T, DeliveryError> {
        match op() {
            Ok(value) => {
                self.stats.increment(ok_counter);
                Ok(value)
            }
            Err(err) => {
                self.stats.increment(counter::ERRORS_COUNT);
                self.stats.increment(err_counter);
                warn!(uri = %self.client_uri, operation, error = %err, "transport operation failed");
                Err(err)
            }
        }
    }

    pub(crate) fn publish(&self, mut message: Message) -> Result<(), DeliveryError> {
        self.track(
            "deliver_publish",
            counter::DELIVER_PUBLISH_COUNT,
            counter::DELIVER_ERRORS_COUNT,
            || {
                prepare_outbound(&mut message, MimeType::Publish)?;
                self.service()?.enqueue(message)
            },
        )
    }

    /// Register the transaction subscription for `owner`, then enqueue.
    ///
    /// The subscription is withdrawn again if the message cannot be queued.
    pub(crate) fn request(
        &self,
        mut message: Message,
        owner: Arc<dyn Transport>,
        tunnel_headers: Option<TunnelHeaders>,
    ) -> Result<String, DeliveryError> {
        self.track(
            "deliver_request",
            counter::DELIVER_REQUEST_COUNT,
            counter::DELIVER_ERRORS_COUNT,
            || {
                let (transaction_id, expiration) = prepare_request(&mut message)?;
                let service = self.service()?;
                let details = SubscriberDetails::new(owner)
                    .with_expiration(Some(expiration))
                    .with_tunnel_headers(tunnel_headers);
                let subscription = service.subscribe_transaction(&transaction_id, details)?;
                if let Err(err) = service.enqueue(message) {
                    service.unsubscribe_transaction(subscription);
                    return Err(err);
                }
                debug!(uri = %self.client_uri, %transaction_id, expiration, "request enqueued");
                Ok(transaction_id)
            },
        )
    }

    pub(crate) fn response(&self, mut message: Message) -> Result<(), DeliveryError> {
        self.track(
            "deliver_response",
            counter::DELIVER_RESPONSE_COUNT,
            counter::DELIVER_ERRORS_COUNT,
            || {
                prepare_outbound(&mut message, MimeType::Response)?;
                self.service()?.enqueue(message)
            },
        )
    }

    pub(crate) fn subscribe(
        &self,
        owner: Arc<dyn Transport>,
        matcher: Arc<SubscriptionMatcher>,
        expiration_epoch_ms: Option<i64>,
        description: Option<String>,
    ) -> Result<SubscriptionId, DeliveryError> {
        self.track(
            "subscribe",
            counter::SUBSCRIBE_COUNT,
            counter::DELIVER_ERRORS_COUNT,
            || {
                let mut details = SubscriberDetails::new(owner).with_expiration(expiration_epoch_ms);
                details.description = description;
                self.service()?.subscribe(matcher, details)
            },
        )
    }

    pub(crate) fn unsubscribe(&self, matcher: &SubscriptionMatcher) -> Result<(), DeliveryError> {
        self.track(
            "unsubscribe",
            counter::UNSUBSCRIBE_COUNT,
            counter::UNSUBSCRIBE_ERRORS_COUNT,
            || self.service()?.unsubscribe_owned(&self.client_uri, matcher),
        )
    }
}
