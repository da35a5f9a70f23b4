//! Subscription matchers and the subscriber record stored against them.
//!
//! A `SubscriptionMatcher` is a named predicate over messages. Its identity is
//! the `SubscriptionId` assigned at construction, so the same matcher handle
//! must be used to unsubscribe.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use delivery_types::Message;
use delivery_types::transport::TunnelHeaders;
use serde::Serialize;

use crate::transport::Transport;

static NEXT_SUBSCRIPTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a matcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    fn next() -> Self {
        Self(NEXT_SUBSCRIPTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

type MatchFn = dyn Fn(&Message) -> bool + Send + Sync;

/// A named message predicate with invocation counters.
///
/// Predicates run inside the registry scan and must not call back into the
/// delivery service.
pub struct SubscriptionMatcher {
    id: SubscriptionId,
    name: String,
    predicate: Box<MatchFn>,
    match_call_count: AtomicU64,
    match_found_count: AtomicU64,
}

impl SubscriptionMatcher {
    pub fn new(
        name: impl Into<String>,
        predicate: impl Fn(&Message) -> bool + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: SubscriptionId::next(),
            name: name.into(),
            predicate: Box::new(predicate),
            match_call_count: AtomicU64::new(0),
            match_found_count: AtomicU64::new(0),
        })
    }

    /// Matches messages whose `to` header equals `destination`.
    pub fn destination(destination: impl Into<String>) -> Arc<Self> {
        let destination = destination.into();
        let name = format!("to == {destination}");
        Self::new(name, move |message| message.to() == Some(destination.as_str()))
    }

    /// Matches messages carrying `transaction_id`.
    pub fn transaction(transaction_id: impl Into<String>) -> Arc<Self> {
        let transaction_id = transaction_id.into();
        let name = format!("transaction_id == {transaction_id}");
        Self::new(name, move |message| {
            message.transaction_id() == Some(transaction_id.as_str())
        })
    }

    /// Matches every message.
    pub fn everything() -> Arc<Self> {
        Self::new("*", |_| true)
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Evaluate the predicate and update the counters.
    pub fn matches(&self, message: &Message) -> bool {
        self.match_call_count.fetch_add(1, Ordering::Relaxed);
        let found = (self.predicate)(message);
        if found {
            self.match_found_count.fetch_add(1, Ordering::Relaxed);
        }
        found
    }

    pub fn match_call_count(&self) -> u64 {
        self.match_call_count.load(Ordering::Relaxed)
    }

    pub fn match_found_count(&self) -> u64 {
        self.match_found_count.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for SubscriptionMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionMatcher")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("match_call_count", &self.match_call_count())
            .field("match_found_count", &self.match_found_count())
            .finish()
    }
}

/// Where and until when a matched message is delivered.
#[derive(Clone)]
pub struct SubscriberDetails {
    /// The subscriber's transport; its `client_uri` is the owning participant.
    pub transport: Arc<dyn Transport>,
    /// Absent or zero means the subscription never expires.
    pub expiration_epoch_ms: Option<i64>,
    pub tunnel_headers: Option<TunnelHeaders>,
    pub description: Option<String>,
}

impl SubscriberDetails {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            expiration_epoch_ms: None,
            tunnel_headers: None,
            description: None,
        }
    }

    pub fn with_expiration(mut self, expiration_epoch_ms: Option<i64>) -> Self {
        self.expiration_epoch_ms = expiration_epoch_ms;
        self
    }

    pub fn with_tunnel_headers(mut self, tunnel_headers: Option<TunnelHeaders>) -> Self {
        self.tunnel_headers = tunnel_headers;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// URI of the participant that owns this subscription.
    pub fn owner_uri(&self) -> &str {
        self.transport.client_uri()
    }

    /// Expired once a non-zero expiration is at or before `now_ms`.
    pub fn is_expired_at(&self, now_ms: i64) -> bool {
        matches!(self.expiration_epoch_ms, Some(expiration) if expiration != 0 && expiration <= now_ms)
    }

    /// Milliseconds left before expiry, `None` for subscriptions that never expire.
    pub fn time_till_subscription_expiration_ms(&self, now_ms: i64) -> Option<i64> {
        match self.expiration_epoch_ms {
            Some(expiration) if expiration != 0 => Some(expiration - now_ms),
            _ => None,
        }
    }
}

impl fmt::Debug for SubscriberDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriberDetails")
            .field("owner_uri", &self.owner_uri())
            .field("transport_type", &self.transport.transport_type())
            .field("expiration_epoch_ms", &self.expiration_epoch_ms)
            .field("tunnel_headers", &self.tunnel_headers)
            .field("description", &self.description)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::RecordingTransport;

    #[test]
    fn ids_are_unique() {
        let a = SubscriptionMatcher::everything();
        let b = SubscriptionMatcher::everything();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn destination_matcher_counts_calls() {
        let matcher = SubscriptionMatcher::destination("/scanners");
        assert!(matcher.matches(&Message::publish("a", "/scanners", "x")));
        assert!(!matcher.matches(&Message::publish("a", "/other", "x")));
        assert_eq!(matcher.match_call_count(), 2);
        assert_eq!(matcher.match_found_count(), 1);
        assert_eq!(matcher.name(), "to == /scanners");
    }

    #[test]
    fn transaction_matcher_ignores_untagged_messages() {
        let matcher = SubscriptionMatcher::transaction("transaction-id-1");
        let mut tagged = Message::publish("a", "b", "x");
        tagged.set_header("transaction_id", "transaction-id-1");
        assert!(matcher.matches(&tagged));
        assert!(!matcher.matches(&Message::publish("a", "b", "x")));
    }

    #[test]
    fn details_expiration() {
        let transport = RecordingTransport::new("client_0");
        let never = SubscriberDetails::new(transport.clone());
        assert!(!never.is_expired_at(i64::MAX));
        assert_eq!(never.time_till_subscription_expiration_ms(0), None);

        let zero = SubscriberDetails::new(transport.clone()).with_expiration(Some(0));
        assert!(!zero.is_expired_at(i64::MAX));

        let timed = SubscriberDetails::new(transport).with_expiration(Some(1_000));
        assert!(!timed.is_expired_at(999));
        assert!(timed.is_expired_at(1_000));
        assert_eq!(timed.time_till_subscription_expiration_ms(400), Some(600));
        assert_eq!(timed.owner_uri(), "client_0");
    }
}
