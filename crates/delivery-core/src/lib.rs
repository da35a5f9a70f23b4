//! Routing engine for the delivery service.
//!
//! Participants obtain a [`Transport`] from the [`DeliveryService`] and use it
//! to publish, send requests, and send responses. The service matches each
//! message against its subscription tables and hands it back to the matched
//! subscribers' transports, which place it in the participants' mailboxes.

pub mod diagnostics;
pub mod participant;
pub mod registry;
pub mod service;
pub mod stats;
pub mod subscription;
pub mod transport;
pub mod tunnel;

pub use participant::{Mailbox, MailboxSender, Participant, Transportable};
pub use registry::TableKind;
pub use service::{DeliveryService, DeliveryServiceBuilder, RouteOutcome};
pub use stats::Stats;
pub use subscription::{SubscriberDetails, SubscriptionId, SubscriptionMatcher};
pub use transport::Transport;
pub use tunnel::{TunnelEndpoint, TunnelInbound};
