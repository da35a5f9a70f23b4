//! String-keyed monotonic counters.
//!
//! The service and every transport own a `Stats` instance. Counters are
//! created on first increment and never decrease.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

/// Counter keys shared by the service and the transports.
pub mod counter {
    pub const ERRORS_COUNT: &str = "errors_count";

    pub const ROUTED_MESSAGES_COUNT: &str = "routed_messages_count";
    pub const ROUTE_ERRORS_COUNT: &str = "route_errors_count";
    /// Spelling is part of the published counter set.
    pub const ROUTE_DROPPED_MESSAGES_COUNT: &str = "route_dropped_messsages_count";
    pub const FIND_SUBSCRIPTIONS_ERRORS_COUNT: &str = "find_subscriptions_errors_count";
    pub const CREATE_NEW_TRANSPORT_ERRORS_COUNT: &str = "create_new_transport_errors_count";
    pub const LOOPBACK_MESSAGES_COUNT: &str = "loopback_messages_count";
    pub const EXPIRED_SUBSCRIPTIONS_COUNT: &str = "expired_subscriptions_count";
    pub const UNSUBSCRIBE_ERRORS_COUNT: &str = "unsubscribe_errors_count";

    pub const DELIVER_PUBLISH_COUNT: &str = "deliver_publish_count";
    pub const DELIVER_REQUEST_COUNT: &str = "deliver_request_count";
    pub const DELIVER_RESPONSE_COUNT: &str = "deliver_response_count";
    pub const DELIVER_BACK_TO_CLIENT_COUNT: &str = "deliver_back_to_client_count";
    pub const DELIVER_ERRORS_COUNT: &str = "deliver_errors_count";
    pub const DELIVER_BACK_TO_CLIENT_ERRORS_COUNT: &str = "deliver_back_to_client_errors_count";
    pub const SUBSCRIBE_COUNT: &str = "subscribe_count";
    pub const UNSUBSCRIBE_COUNT: &str = "unsubscribe_count";
    pub const TUNNEL_INBOUND_COUNT: &str = "tunnel_inbound_count";
    pub const TUNNEL_OUTBOUND_COUNT: &str = "tunnel_outbound_count";
}

/// A set of named counters safe to bump from any thread.
#[derive(Default)]
pub struct Stats {
    counters: DashMap<&'static str, AtomicU64>,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self, key: &'static str) {
        self.add(key, 1);
    }

    pub fn add(&self, key: &'static str, value: u64) {
        if let Some(existing) = self.counters.get(key) {
            existing.fetch_add(value, Ordering::Relaxed);
            return;
        }
        self.counters
            .entry(key)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(value, Ordering::Relaxed);
    }

    /// Current value of `key`, zero if it was never incremented.
    pub fn get(&self, key: &str) -> u64 {
        self.counters
            .get(key)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Point-in-time copy of every counter, sorted by key.
    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        self.counters
            .iter()
            .map(|entry| (entry.key().to_string(), entry.value().load(Ordering::Relaxed)))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }
}

impl std::fmt::Debug for Stats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map().entries(self.snapshot()).finish()
    }
}
