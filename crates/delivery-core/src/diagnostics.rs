//! Read-only views over the registries and counters.

use std::collections::BTreeMap;

use delivery_types::transport::TransportType;
use serde::Serialize;

use crate::registry::TableKind;

/// One registry entry, flattened for display.
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionRow {
    pub table: TableKind,
    pub subscription_id: u64,
    pub matcher: String,
    pub owner_uri: String,
    pub transport_type: TransportType,
    pub description: Option<String>,
    pub match_call_count: u64,
    pub match_found_count: u64,
    /// `None` for subscriptions that never expire.
    pub expires_in_ms: Option<i64>,
    /// The owner's entry counts across the three registries.
    pub owner_common: usize,
    pub owner_transactions: usize,
    pub owner_sniffers: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransportSummary {
    pub uri: String,
    pub transport_type: TransportType,
    pub counters: BTreeMap<String, u64>,
}

/// Service-wide counters plus registry sizes and per-transport counters.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceSnapshot {
    pub service_uri: String,
    pub counters: BTreeMap<String, u64>,
    pub subscriptions_common: usize,
    pub subscriptions_transactions: usize,
    pub subscriptions_transactions_sniffers: usize,
    pub transports: Vec<TransportSummary>,
}
