//! The delivery service: subscription registries, routing loop, and transport factory.
//!
//! A `DeliveryService` owns three subscription tables (common, transactions,
//! transaction sniffers), a map of transports keyed by participant URI, and an
//! unbounded inbound queue drained by a single routing task. Transports push
//! into the queue; the routing task matches each message against the tables
//! and hands it to every matched subscriber's transport.
//!
//! Construct an instance with [`DeliveryService::start`] and pass it to the
//! components that need it, or use [`DeliveryService::global`] for a lazily
//! created process-wide instance.

use std::sync::{Arc, Mutex, OnceLock, PoisonError, Weak};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use delivery_types::config::{DeliveryConfig, TunnelConfig};
use delivery_types::message::{BROADCAST, LOCAL_BROADCAST, now_epoch_ms};
use delivery_types::transport::TransportType;
use delivery_types::{DeliveryError, Message, MimeType};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::diagnostics::{ServiceSnapshot, SubscriptionRow, TransportSummary};
use crate::participant::{Participant, Transportable};
use crate::registry::{SubscriptionTable, SweepReport, TableKind};
use crate::stats::{Stats, counter};
use crate::subscription::{SubscriberDetails, SubscriptionId, SubscriptionMatcher};
use crate::transport::{LocalTransport, LoopbackTransport, Transport, TunnelTransport};
use crate::tunnel::{TunnelBridge, TunnelEndpoint};

/// Description attached to the default subscription on a participant's own URI.
const OWN_URI_DESCRIPTION: &str = "by participant uri";

/// How a routed message was handled. None of these are failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Handed to this many subscribers.
    Delivered { recipients: usize },
    /// No subscriber matched.
    NoSubscribers,
    /// Stale message discarded before matching.
    Dropped,
}

/// Builder for a [`DeliveryService`] with optional collaborators.
pub struct DeliveryServiceBuilder {
    config: DeliveryConfig,
    tunnel_endpoint: Option<Arc<dyn TunnelEndpoint>>,
}

impl DeliveryServiceBuilder {
    /// Endpoint used by remote-tunnel transports, started when the config has a `[tunnel]` section.
    pub fn tunnel_endpoint(mut self, endpoint: Arc<dyn TunnelEndpoint>) -> Self {
        self.tunnel_endpoint = Some(endpoint);
        self
    }

    /// Create the service, its loopback transport, and the routing task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(self) -> Result<Arc<DeliveryService>, DeliveryError> {
        self.config.validate()?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
            DeliveryError::ServiceStopped(format!("no tokio runtime for the routing loop: {e}"))
        })?;

        let (inbound, inbound_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let service = Arc::new_cyclic(|self_ref| DeliveryService {
            uri: self.config.service_uri.clone(),
            config: self.config,
            self_ref: self_ref.clone(),
            common: SubscriptionTable::new(TableKind::Common),
            transactions: SubscriptionTable::new(TableKind::Transactions),
            sniffers: SubscriptionTable::new(TableKind::TransactionsSniffers),
            transports: DashMap::new(),
            inbound,
            stats: Stats::new(),
            cancel: cancel.clone(),
            routing_task: Mutex::new(None),
            tunnel_endpoint: self.tunnel_endpoint,
            tunnel_participant: Mutex::new(None),
        });

        service.install_loopback()?;
        let task = runtime.spawn(
            run_routing_loop(Arc::downgrade(&service), inbound_rx, cancel.clone())
                .instrument(info_span!("routing_loop", uri = %service.uri)),
        );
        *service
            .routing_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(task);

        if let Some(tunnel) = service.config.tunnel.clone() {
            if let Err(err) = service.start_tunnel(&tunnel) {
                cancel.cancel();
                return Err(err);
            }
        }

        info!(uri = %service.uri, "delivery service started");
        Ok(service)
    }
}

static GLOBAL: OnceLock<Arc<DeliveryService>> = OnceLock::new();
static GLOBAL_INIT: Mutex<()> = Mutex::new(());

/// The message router.
pub struct DeliveryService {
    uri: String,
    config: DeliveryConfig,
    self_ref: Weak<DeliveryService>,
    common: SubscriptionTable,
    transactions: SubscriptionTable,
    sniffers: SubscriptionTable,
    /// Transports keyed by participant URI; the loopback is keyed by the service URI.
    transports: DashMap<String, Arc<dyn Transport>>,
    inbound: mpsc::UnboundedSender<Message>,
    stats: Stats,
    cancel: CancellationToken,
    routing_task: Mutex<Option<JoinHandle<()>>>,
    tunnel_endpoint: Option<Arc<dyn TunnelEndpoint>>,
    /// Keeps the tunnel transport's fallback mailbox open.
    tunnel_participant: Mutex<Option<Participant>>,
}

impl DeliveryService {
    pub fn builder(config: DeliveryConfig) -> DeliveryServiceBuilder {
        DeliveryServiceBuilder {
            config,
            tunnel_endpoint: None,
        }
    }

    /// Start an independent service instance.
    pub fn start(config: DeliveryConfig) -> Result<Arc<Self>, DeliveryError> {
        Self::builder(config).start()
    }

    /// The process-wide instance, created with `config` on first call.
    ///
    /// Later calls return the existing instance and ignore `config`.
    pub fn global(config: DeliveryConfig) -> Result<Arc<Self>, DeliveryError> {
        if let Some(service) = GLOBAL.get() {
            return Ok(Arc::clone(service));
        }
        let _guard = GLOBAL_INIT.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(service) = GLOBAL.get() {
            return Ok(Arc::clone(service));
        }
        let service = Self::start(config)?;
        let _ = GLOBAL.set(Arc::clone(&service));
        Ok(service)
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn config(&self) -> &DeliveryConfig {
        &self.config
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// Token cancelled on shutdown; participant loops can select on it.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Transaction deadline for a request created now.
    pub fn default_transaction_expiration(&self) -> i64 {
        now_epoch_ms() + self.config.default_transaction_expiration_ms
    }

    /// Build a request; without `transaction_expiration_epoch_ms` the
    /// configured default lifetime applies.
    pub fn new_request(
        &self,
        from: impl Into<String>,
        to: impl Into<String>,
        body: impl Into<Value>,
        transaction_expiration_epoch_ms: Option<i64>,
    ) -> Message {
        Message::request_with_default(
            from,
            to,
            body,
            transaction_expiration_epoch_ms,
            self.config.default_transaction_expiration_ms,
        )
    }

    fn table(&self, kind: TableKind) -> &SubscriptionTable {
        match kind {
            TableKind::Common => &self.common,
            TableKind::Transactions => &self.transactions,
            TableKind::TransactionsSniffers => &self.sniffers,
        }
    }

    // -----------------------------------------------------------------------
    // Transports
    // -----------------------------------------------------------------------

    fn install_loopback(&self) -> Result<(), DeliveryError> {
        let loopback: Arc<dyn Transport> = LoopbackTransport::new(&self.uri, self.self_ref.clone());
        self.transports
            .insert(self.uri.clone(), Arc::clone(&loopback));
        self.subscribe_defaults(&loopback)
    }

    /// Return the transport for `participant`, creating it on first call.
    ///
    /// A new transport gets three subscriptions: `/broadcast`,
    /// `/local/broadcast`, and the participant's own URI. Loopback is reserved
    /// for the service itself.
    pub fn create_new_transport(
        &self,
        participant: &dyn Transportable,
        transport_type: TransportType,
    ) -> Result<Arc<dyn Transport>, DeliveryError> {
        let uri = participant.uri();
        if let Some(existing) = self.transports.get(uri) {
            return Ok(Arc::clone(existing.value()));
        }
        self.ensure_running()
            .map_err(|err| self.transport_creation_failed(err))?;

        let transport: Arc<dyn Transport> = match transport_type {
            TransportType::Local => {
                LocalTransport::new(uri, self.self_ref.clone(), participant.mailbox_sender())
            }
            TransportType::RemoteTunnel => TunnelTransport::new(
                uri,
                self.self_ref.clone(),
                participant.mailbox_sender(),
                self.tunnel_endpoint.clone(),
            ),
            TransportType::Loopback => {
                return Err(self.transport_creation_failed(DeliveryError::UnsupportedTransportType(
                    format!("loopback is reserved for {}, requested by {uri}", self.uri),
                )));
            }
        };

        match self.transports.entry(uri.to_string()) {
            Entry::Occupied(existing) => return Ok(Arc::clone(existing.get())),
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&transport));
            }
        }
        if let Err(err) = self.subscribe_defaults(&transport) {
            self.transports.remove(uri);
            return Err(self.transport_creation_failed(err));
        }
        debug!(%uri, %transport_type, "created transport");
        Ok(transport)
    }

    /// Like [`create_new_transport`](Self::create_new_transport) with the type given by name.
    pub fn create_new_transport_by_name(
        &self,
        participant: &dyn Transportable,
        transport_type: &str,
    ) -> Result<Arc<dyn Transport>, DeliveryError> {
        let transport_type = transport_type
            .parse::<TransportType>()
            .map_err(|err| self.transport_creation_failed(err))?;
        self.create_new_transport(participant, transport_type)
    }

    fn transport_creation_failed(&self, err: DeliveryError) -> DeliveryError {
        self.stats.increment(counter::ERRORS_COUNT);
        self.stats
            .increment(counter::CREATE_NEW_TRANSPORT_ERRORS_COUNT);
        warn!(error = %err, "cannot create transport");
        err
    }

    fn subscribe_defaults(&self, transport: &Arc<dyn Transport>) -> Result<(), DeliveryError> {
        let uri = transport.client_uri();
        for (destination, description) in [
            (BROADCAST, BROADCAST),
            (LOCAL_BROADCAST, LOCAL_BROADCAST),
            (uri, OWN_URI_DESCRIPTION),
        ] {
            let details =
                SubscriberDetails::new(Arc::clone(transport)).with_description(description);
            self.subscribe(SubscriptionMatcher::destination(destination), details)?;
        }
        Ok(())
    }

    pub fn transport(&self, uri: &str) -> Option<Arc<dyn Transport>> {
        self.transports.get(uri).map(|t| Arc::clone(t.value()))
    }

    pub fn transport_count(&self) -> usize {
        self.transports.len()
    }

    fn start_tunnel(&self, config: &TunnelConfig) -> Result<(), DeliveryError> {
        let Some(endpoint) = self.tunnel_endpoint.clone() else {
            warn!(role = %config.role, "tunnel configured without an endpoint, staying in-process");
            return Ok(());
        };
        let participant = Participant::with_uri(format!("tunnel@{}", config.role));
        let transport = self.create_new_transport(&participant, TransportType::RemoteTunnel)?;
        let bridge = Arc::new(TunnelBridge::new(&transport));
        endpoint.start(config, bridge).map_err(|err| {
            self.stats.increment(counter::ERRORS_COUNT);
            error!(role = %config.role, error = %err, "tunnel endpoint failed to start");
            err
        })?;
        *self
            .tunnel_participant
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(participant);
        info!(
            role = %config.role,
            address = %config.address,
            data_port = config.data_port,
            control_port = config.control_port,
            "tunnel endpoint started"
        );
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Subscriptions
    // -----------------------------------------------------------------------

    fn ensure_running(&self) -> Result<(), DeliveryError> {
        if self.cancel.is_cancelled() {
            return Err(DeliveryError::ServiceStopped(format!(
                "{} is shut down",
                self.uri
            )));
        }
        Ok(())
    }

    /// Add to the common table. Re-subscribing the same matcher overwrites.
    ///
    /// Fails with `ServiceStopped` once [`shutdown`](Self::shutdown) has begun.
    pub fn subscribe(
        &self,
        matcher: Arc<SubscriptionMatcher>,
        details: SubscriberDetails,
    ) -> Result<SubscriptionId, DeliveryError> {
        self.ensure_running()?;
        let id = matcher.id();
        debug!(owner = %details.owner_uri(), matcher = matcher.name(), %id, "subscribe");
        self.common.insert(matcher, details);
        Ok(id)
    }

    /// Route responses carrying `transaction_id` to `details`.
    pub fn subscribe_transaction(
        &self,
        transaction_id: &str,
        mut details: SubscriberDetails,
    ) -> Result<SubscriptionId, DeliveryError> {
        self.ensure_running()?;
        if details.description.is_none() {
            details.description = Some(transaction_id.to_string());
        }
        let matcher = SubscriptionMatcher::transaction(transaction_id);
        let id = matcher.id();
        self.transactions.insert(matcher, details);
        Ok(id)
    }

    /// Drop the transaction subscription `id`, e.g. after its request failed to enqueue.
    pub fn unsubscribe_transaction(&self, id: SubscriptionId) -> bool {
        match self.transactions.remove(id) {
            Some(removed) => {
                if !removed.mirrored {
                    self.report_inconsistency(TableKind::Transactions, id);
                }
                true
            }
            None => false,
        }
    }

    /// Observe every response accepted by `matcher`.
    pub fn subscribe_transactions_sniffers(
        &self,
        matcher: Arc<SubscriptionMatcher>,
        details: SubscriberDetails,
    ) -> Result<SubscriptionId, DeliveryError> {
        self.ensure_running()?;
        let id = matcher.id();
        debug!(owner = %details.owner_uri(), matcher = matcher.name(), %id, "sniffer subscribe");
        self.sniffers.insert(matcher, details);
        Ok(id)
    }

    /// Remove `matcher` from the common table.
    pub fn unsubscribe(&self, matcher: &SubscriptionMatcher) -> Result<(), DeliveryError> {
        let id = matcher.id();
        let Some(removed) = self.common.remove(id) else {
            return Err(self.unsubscribe_failed(matcher));
        };
        if !removed.mirrored {
            self.report_inconsistency(TableKind::Common, id);
        }
        debug!(owner = %removed.subscription.details.owner_uri(), matcher = matcher.name(), %id, "unsubscribe");
        Ok(())
    }

    /// Unsubscribe only if `owner` holds the subscription.
    pub(crate) fn unsubscribe_owned(
        &self,
        owner: &str,
        matcher: &SubscriptionMatcher,
    ) -> Result<(), DeliveryError> {
        let id = matcher.id();
        let Some(removed) = self.common.remove_owned(id, owner) else {
            return Err(self.unsubscribe_failed(matcher));
        };
        if !removed.mirrored {
            self.report_inconsistency(TableKind::Common, id);
        }
        debug!(%owner, matcher = matcher.name(), %id, "unsubscribe");
        Ok(())
    }

    fn unsubscribe_failed(&self, matcher: &SubscriptionMatcher) -> DeliveryError {
        self.stats.increment(counter::ERRORS_COUNT);
        self.stats.increment(counter::UNSUBSCRIBE_ERRORS_COUNT);
        DeliveryError::SubscriptionNotFound(format!("{} ({})", matcher.id(), matcher.name()))
    }

    pub fn subscription_count(&self, kind: TableKind) -> usize {
        self.table(kind).len()
    }

    /// Ids `owner` holds in `kind`.
    pub fn owner_subscriptions(&self, kind: TableKind, owner: &str) -> Vec<SubscriptionId> {
        self.table(kind).owner_ids(owner)
    }

    pub fn has_subscription(&self, kind: TableKind, id: SubscriptionId) -> bool {
        self.table(kind).contains(id)
    }

    /// Sweep `kind` if due, then return every matching subscriber.
    pub fn find_subscriptions(
        &self,
        message: &Message,
        kind: TableKind,
        now_ms: i64,
        first_only: bool,
    ) -> Vec<SubscriberDetails> {
        let table = self.table(kind);
        if let Some(report) = table.sweep_if_due(now_ms, self.config.sweep_interval_ms) {
            self.record_sweep(kind, report);
        }
        table.find(message, first_only)
    }

    /// Sweep `kind` now, ignoring the interval. Returns the number removed.
    pub fn sweep_expired(&self, kind: TableKind, now_ms: i64) -> usize {
        let report = self.table(kind).sweep(now_ms);
        let removed = report.removed.len();
        self.record_sweep(kind, report);
        removed
    }

    fn record_sweep(&self, kind: TableKind, report: SweepReport) {
        if !report.removed.is_empty() {
            self.stats.add(
                counter::EXPIRED_SUBSCRIPTIONS_COUNT,
                report.removed.len() as u64,
            );
            debug!(table = %kind, removed = report.removed.len(), "swept expired subscriptions");
        }
        for id in report.inconsistencies {
            self.report_inconsistency(kind, id);
        }
    }

    fn report_inconsistency(&self, kind: TableKind, id: SubscriptionId) {
        let err = DeliveryError::InternalConsistency(format!(
            "{id} was missing from the owner index of {kind}"
        ));
        self.stats.increment(counter::ERRORS_COUNT);
        self.stats
            .increment(counter::FIND_SUBSCRIPTIONS_ERRORS_COUNT);
        error!(table = %kind, error = %err, "subscription registry out of sync");
    }

    // -----------------------------------------------------------------------
    // Routing
    // -----------------------------------------------------------------------

    /// Put `message` on the inbound queue for the routing task.
    pub fn enqueue(&self, message: Message) -> Result<(), DeliveryError> {
        self.ensure_running()?;
        self.inbound.send(message).map_err(|_| {
            DeliveryError::ServiceStopped(format!("{} routing loop has exited", self.uri))
        })
    }

    /// Same as [`route`](Self::route).
    pub fn process(&self, message: Message) -> Result<RouteOutcome, DeliveryError> {
        self.route(message)
    }

    pub fn route(&self, message: Message) -> Result<RouteOutcome, DeliveryError> {
        self.route_at(message, now_epoch_ms())
    }

    /// Route with an explicit clock.
    pub fn route_at(&self, message: Message, now_ms: i64) -> Result<RouteOutcome, DeliveryError> {
        if message.is_expired_at(now_ms) {
            self.stats
                .increment(counter::ROUTE_DROPPED_MESSAGES_COUNT);
            debug!(
                from = message.from().unwrap_or("<unknown>"),
                to = message.to().unwrap_or("<unknown>"),
                "dropped expired message"
            );
            return Ok(RouteOutcome::Dropped);
        }

        let Some(mime_type) = message.mime_type() else {
            let err = DeliveryError::MissingOrUnknownMimeType(format!(
                "message from {} to {} has no usable mime_type header",
                message.from().unwrap_or("<unknown>"),
                message.to().unwrap_or("<unknown>")
            ));
            self.stats.increment(counter::ERRORS_COUNT);
            self.stats.increment(counter::ROUTE_ERRORS_COUNT);
            warn!(error = %err, "route failed");
            return Err(err);
        };
        self.stats.increment(counter::ROUTED_MESSAGES_COUNT);

        let recipients = match mime_type {
            MimeType::Publish | MimeType::Request => {
                let found = self.find_subscriptions(&message, TableKind::Common, now_ms, false);
                self.deliver_to(found, &message)
            }
            MimeType::Response => {
                let owner = self.find_subscriptions(&message, TableKind::Transactions, now_ms, true);
                if owner.is_empty() {
                    debug!(
                        transaction_id = message.transaction_id().unwrap_or("<none>"),
                        "no transaction subscriber for response"
                    );
                }
                let sniffers =
                    self.find_subscriptions(&message, TableKind::TransactionsSniffers, now_ms, false);
                self.deliver_to(owner, &message) + self.deliver_to(sniffers, &message)
            }
        };

        Ok(if recipients == 0 {
            RouteOutcome::NoSubscribers
        } else {
            RouteOutcome::Delivered { recipients }
        })
    }

    fn deliver_to(&self, recipients: Vec<SubscriberDetails>, message: &Message) -> usize {
        let mut delivered = 0;
        for details in recipients {
            let mut copy = message.clone();
            if let Some(tunnel) = &details.tunnel_headers {
                copy.apply_tunnel_headers(tunnel);
            }
            match details.transport.deliver_back_to_client(copy) {
                Ok(()) => delivered += 1,
                Err(err) => {
                    self.stats.increment(counter::ERRORS_COUNT);
                    self.stats
                        .increment(counter::DELIVER_BACK_TO_CLIENT_ERRORS_COUNT);
                    warn!(owner = %details.owner_uri(), error = %err, "delivery to subscriber failed");
                }
            }
        }
        delivered
    }

    /// Handle a message the service addressed to itself.
    ///
    /// A request sent to the service URI is answered with a stats snapshot;
    /// anything else is only counted.
    pub fn process_message_from_loopback_transport(&self, message: Message) {
        self.stats.increment(counter::LOOPBACK_MESSAGES_COUNT);
        let for_service = message.to() == Some(self.uri.as_str());
        if message.mime_type() != Some(MimeType::Request) || !for_service {
            debug!(
                from = message.from().unwrap_or("<unknown>"),
                to = message.to().unwrap_or("<unknown>"),
                "loopback message consumed"
            );
            return;
        }

        let body = serde_json::to_value(self.snapshot())
            .unwrap_or_else(|e| json!({ "error": e.to_string() }));
        let response = Message::response(self.uri.as_str(), body, &message);
        if let Err(err) = self.enqueue(response) {
            warn!(error = %err, "cannot answer stats request");
        }
    }

    // -----------------------------------------------------------------------
    // Diagnostics
    // -----------------------------------------------------------------------

    pub fn snapshot(&self) -> ServiceSnapshot {
        let mut transports: Vec<TransportSummary> = self
            .transports
            .iter()
            .map(|entry| TransportSummary {
                uri: entry.key().clone(),
                transport_type: entry.value().transport_type(),
                counters: entry.value().stats().snapshot(),
            })
            .collect();
        transports.sort_by(|a, b| a.uri.cmp(&b.uri));

        ServiceSnapshot {
            service_uri: self.uri.clone(),
            counters: self.stats.snapshot(),
            subscriptions_common: self.common.len(),
            subscriptions_transactions: self.transactions.len(),
            subscriptions_transactions_sniffers: self.sniffers.len(),
            transports,
        }
    }

    pub fn subscription_rows(&self, kind: TableKind) -> Vec<SubscriptionRow> {
        self.subscription_rows_at(kind, now_epoch_ms())
    }

    pub fn subscription_rows_at(&self, kind: TableKind, now_ms: i64) -> Vec<SubscriptionRow> {
        self.table(kind)
            .snapshot()
            .into_iter()
            .map(|subscription| {
                let details = &subscription.details;
                let owner = details.owner_uri();
                SubscriptionRow {
                    table: kind,
                    subscription_id: subscription.matcher.id().value(),
                    matcher: subscription.matcher.name().to_string(),
                    owner_uri: owner.to_string(),
                    transport_type: details.transport.transport_type(),
                    description: details.description.clone(),
                    match_call_count: subscription.matcher.match_call_count(),
                    match_found_count: subscription.matcher.match_found_count(),
                    expires_in_ms: details.time_till_subscription_expiration_ms(now_ms),
                    owner_common: self.common.owner_count(owner),
                    owner_transactions: self.transactions.owner_count(owner),
                    owner_sniffers: self.sniffers.owner_count(owner),
                }
            })
            .collect()
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Stop routing, close the tunnel endpoint, and drop every registration.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let task = self
            .routing_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                warn!(error = %err, "routing task ended abnormally");
            }
        }
        if let Some(endpoint) = &self.tunnel_endpoint {
            endpoint.close();
        }
        self.tunnel_participant
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        for kind in TableKind::ALL {
            self.table(kind).clear();
        }
        self.transports.clear();
        info!(uri = %self.uri, "delivery service stopped");
    }
}

impl std::fmt::Debug for DeliveryService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryService")
            .field("uri", &self.uri)
            .field("transports", &self.transports.len())
            .field("subscriptions_common", &self.common.len())
            .field("subscriptions_transactions", &self.transactions.len())
            .field("subscriptions_transactions_sniffers", &self.sniffers.len())
            .field("running", &self.is_running())
            .finish()
    }
}

/// Drain the inbound queue in FIFO order until cancelled or the service is dropped.
async fn run_routing_loop(
    service: Weak<DeliveryService>,
    mut inbound: mpsc::UnboundedReceiver<Message>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            received = inbound.recv() => {
                let Some(message) = received else { break };
                let Some(service) = service.upgrade() else { break };
                // Failures are counted and logged inside `route`.
                let _ = service.route(message);
                while let Ok(next) = inbound.try_recv() {
                    let _ = service.route(next);
                }
            }
        }
    }
    debug!("routing loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::RecordingTransport;
    use delivery_types::message::header;
    use std::time::Duration;

    fn service() -> Arc<DeliveryService> {
        DeliveryService::start(DeliveryConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn loopback_has_default_subscriptions() {
        let service = service();
        assert_eq!(service.transport_count(), 1);
        let loopback = service.transport("delivery_service").unwrap();
        assert_eq!(loopback.transport_type(), TransportType::Loopback);
        assert_eq!(
            service
                .owner_subscriptions(TableKind::Common, "delivery_service")
                .len(),
            3
        );
        service.shutdown().await;
    }

    #[tokio::test]
    async fn create_new_transport_is_idempotent() {
        let service = service();
        let participant = Participant::with_uri("client_0");
        let first = service
            .create_new_transport(&participant, TransportType::Local)
            .unwrap();
        let second = service
            .create_new_transport(&participant, TransportType::Local)
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(service.owner_subscriptions(TableKind::Common, "client_0").len(), 3);
        assert_eq!(service.subscription_count(TableKind::Common), 6);
        service.shutdown().await;
    }

    #[tokio::test]
    async fn loopback_is_reserved_for_the_service() {
        let service = service();
        let participant = Participant::with_uri("intruder");
        let result = service.create_new_transport(&participant, TransportType::Loopback);
        assert!(matches!(result, Err(DeliveryError::UnsupportedTransportType(_))));
        assert_eq!(service.stats().get(counter::CREATE_NEW_TRANSPORT_ERRORS_COUNT), 1);
        assert!(service.owner_subscriptions(TableKind::Common, "intruder").is_empty());
        service.shutdown().await;
    }

    #[tokio::test]
    async fn route_expired_message_is_dropped() {
        let service = service();
        let mut message = Message::publish("a", BROADCAST, "stale");
        message.set_header(header::EXPIRATION_EPOCH_MS, 999);
        let outcome = service.route_at(message, 1_000).unwrap();
        assert_eq!(outcome, RouteOutcome::Dropped);
        assert_eq!(service.stats().get(counter::ROUTE_DROPPED_MESSAGES_COUNT), 1);
        assert_eq!(service.stats().get(counter::ERRORS_COUNT), 0);
        service.shutdown().await;
    }

    #[tokio::test]
    async fn route_without_mime_type_fails() {
        let service = service();
        let mut message = Message::publish("a", BROADCAST, "x");
        message.headers.remove(header::MIME_TYPE);
        assert!(matches!(
            service.route(message),
            Err(DeliveryError::MissingOrUnknownMimeType(_))
        ));
        assert_eq!(service.stats().get(counter::ERRORS_COUNT), 1);
        assert_eq!(service.stats().get(counter::ROUTE_ERRORS_COUNT), 1);
        service.shutdown().await;
    }

    #[tokio::test]
    async fn response_goes_to_first_transaction_subscriber_and_sniffers() {
        let service = service();
        let owner = RecordingTransport::new("owner");
        let sniffer = RecordingTransport::new("sniffer");
        service
            .subscribe_transaction(
                "transaction-id-1",
                SubscriberDetails::new(owner.clone()).with_expiration(Some(i64::MAX)),
            )
            .unwrap();
        service
            .subscribe_transactions_sniffers(
                SubscriptionMatcher::everything(),
                SubscriberDetails::new(sniffer.clone()),
            )
            .unwrap();

        let mut request = Message::request("owner", "peer", "q", Some(i64::MAX));
        request.set_header(header::TRANSACTION_ID, "transaction-id-1");
        let response = Message::response("peer", "a", &request);

        let outcome = service.route(response).unwrap();
        assert_eq!(outcome, RouteOutcome::Delivered { recipients: 2 });
        assert_eq!(owner.delivered.lock().unwrap().len(), 1);
        assert_eq!(sniffer.delivered.lock().unwrap().len(), 1);
        // Still registered until it expires.
        assert_eq!(service.subscription_count(TableKind::Transactions), 1);
        service.shutdown().await;
    }

    #[tokio::test]
    async fn unmatched_response_is_not_an_error() {
        let service = service();
        let mut response = Message::publish("peer", "owner", "late");
        response.set_header(header::MIME_TYPE, MimeType::Response.as_str());
        response.set_header(header::TRANSACTION_ID, "transaction-id-gone");
        assert_eq!(service.route(response).unwrap(), RouteOutcome::NoSubscribers);
        assert_eq!(service.stats().get(counter::ERRORS_COUNT), 0);
        service.shutdown().await;
    }

    #[tokio::test]
    async fn transaction_subscription_default_description() {
        let service = service();
        let owner = RecordingTransport::new("owner");
        service
            .subscribe_transaction("transaction-id-9", SubscriberDetails::new(owner))
            .unwrap();
        let rows = service.subscription_rows(TableKind::Transactions);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].description.as_deref(), Some("transaction-id-9"));
        assert_eq!(rows[0].owner_transactions, 1);
        assert_eq!(rows[0].expires_in_ms, None);
        service.shutdown().await;
    }

    #[tokio::test]
    async fn sweep_runs_inside_find() {
        let service = service();
        let owner = RecordingTransport::new("owner");
        service
            .subscribe_transaction(
                "transaction-id-old",
                SubscriberDetails::new(owner).with_expiration(Some(5_000)),
            )
            .unwrap();
        let mut response = Message::publish("peer", "owner", "late");
        response.set_header(header::MIME_TYPE, MimeType::Response.as_str());
        response.set_header(header::TRANSACTION_ID, "transaction-id-old");

        let outcome = service.route_at(response, 10_000).unwrap();
        assert_eq!(outcome, RouteOutcome::NoSubscribers);
        assert_eq!(service.subscription_count(TableKind::Transactions), 0);
        assert_eq!(service.stats().get(counter::EXPIRED_SUBSCRIPTIONS_COUNT), 1);
        service.shutdown().await;
    }

    #[tokio::test]
    async fn unsubscribe_unknown_matcher_fails() {
        let service = service();
        let matcher = SubscriptionMatcher::destination("/nowhere");
        assert!(matches!(
            service.unsubscribe(&matcher),
            Err(DeliveryError::SubscriptionNotFound(_))
        ));
        assert_eq!(service.stats().get(counter::UNSUBSCRIBE_ERRORS_COUNT), 1);
        service.shutdown().await;
    }

    #[tokio::test]
    async fn unsubscribe_with_desynced_index_still_removes() {
        let service = service();
        let owner = RecordingTransport::new("owner");
        let matcher = SubscriptionMatcher::destination("/x");
        service
            .subscribe(matcher.clone(), SubscriberDetails::new(owner))
            .unwrap();
        service.common.forget_owner("owner");

        service.unsubscribe(&matcher).unwrap();
        assert!(!service.has_subscription(TableKind::Common, matcher.id()));
        assert_eq!(service.stats().get(counter::FIND_SUBSCRIPTIONS_ERRORS_COUNT), 1);
        service.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_rejects_new_messages() {
        let service = service();
        service.shutdown().await;
        assert!(!service.is_running());
        assert!(matches!(
            service.enqueue(Message::publish("a", "b", "c")),
            Err(DeliveryError::ServiceStopped(_))
        ));
        assert_eq!(service.transport_count(), 0);
    }

    #[tokio::test]
    async fn registrations_are_rejected_after_shutdown() {
        let service = service();
        let owner = RecordingTransport::new("owner");
        service.shutdown().await;

        assert!(matches!(
            service.subscribe(
                SubscriptionMatcher::destination("/late"),
                SubscriberDetails::new(owner.clone())
            ),
            Err(DeliveryError::ServiceStopped(_))
        ));
        assert!(matches!(
            service.subscribe_transaction(
                "transaction-id-late",
                SubscriberDetails::new(owner.clone())
            ),
            Err(DeliveryError::ServiceStopped(_))
        ));
        assert!(matches!(
            service.subscribe_transactions_sniffers(
                SubscriptionMatcher::everything(),
                SubscriberDetails::new(owner)
            ),
            Err(DeliveryError::ServiceStopped(_))
        ));
        for kind in TableKind::ALL {
            assert_eq!(service.subscription_count(kind), 0);
        }

        let mut participant = Participant::with_uri("late");
        assert!(participant.connect(&service, TransportType::Local).is_err());
        assert_eq!(service.transport_count(), 0);
        assert_eq!(
            service.stats().get(counter::CREATE_NEW_TRANSPORT_ERRORS_COUNT),
            1
        );
    }

    #[tokio::test]
    async fn request_withdraws_its_transaction_when_routing_loop_is_gone() {
        let service = service();
        let mut participant = Participant::with_uri("asker");
        participant
            .connect(&service, TransportType::Local)
            .unwrap();

        let task = service
            .routing_task
            .lock()
            .unwrap()
            .take()
            .unwrap();
        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());
        assert!(service.is_running());

        let request = Message::request("asker", "peer", "q", Some(i64::MAX));
        let result = participant.send_request(request);
        assert!(matches!(result, Err(DeliveryError::ServiceStopped(_))));
        assert_eq!(service.subscription_count(TableKind::Transactions), 0);
        assert!(
            service
                .owner_subscriptions(TableKind::Transactions, "asker")
                .is_empty()
        );
        service.shutdown().await;
    }

    #[tokio::test]
    async fn new_request_uses_configured_lifetime() {
        let service = DeliveryService::start(DeliveryConfig {
            default_transaction_expiration_ms: 60_000,
            ..DeliveryConfig::default()
        })
        .unwrap();
        let before = now_epoch_ms();
        let request = service.new_request("a", "b", "q", None);
        let expiration = request.transaction_expiration_epoch_ms().unwrap();
        assert!(expiration >= before + 60_000);
        assert_eq!(
            service
                .new_request("a", "b", "q", Some(7))
                .transaction_expiration_epoch_ms(),
            Some(7)
        );
        service.shutdown().await;
    }

    #[tokio::test]
    async fn global_returns_one_instance() {
        let a = DeliveryService::global(DeliveryConfig::default()).unwrap();
        let b = DeliveryService::global(DeliveryConfig {
            service_uri: "ignored".to_string(),
            ..DeliveryConfig::default()
        })
        .unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(b.uri(), "delivery_service");
    }

    #[test]
    fn start_outside_runtime_fails() {
        assert!(matches!(
            DeliveryService::start(DeliveryConfig::default()),
            Err(DeliveryError::ServiceStopped(_))
        ));
    }

    #[tokio::test]
    async fn stats_request_to_service_is_answered() {
        let service = service();
        let mut participant = Participant::with_uri("asker");
        participant
            .connect(&service, TransportType::Local)
            .unwrap();
        let transaction_id = participant
            .send_request(Message::request(
                "asker",
                "delivery_service",
                "stats?",
                Some(service.default_transaction_expiration()),
            ))
            .unwrap();

        let response = tokio::time::timeout(Duration::from_secs(2), participant.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response.mime_type(), Some(MimeType::Response));
        assert_eq!(response.transaction_id(), Some(transaction_id.as_str()));
        assert_eq!(response.body["service_uri"], "delivery_service");
        assert!(service.stats().get(counter::LOOPBACK_MESSAGES_COUNT) >= 1);
        service.shutdown().await;
    }
}
