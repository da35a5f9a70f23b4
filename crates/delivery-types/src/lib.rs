//! Shared domain types for the delivery service.
//!
//! This crate contains the types every other layer agrees on: the `Message`
//! envelope and its header keys, transport kinds and tunnel metadata,
//! configuration, and the `DeliveryError` taxonomy.
//!
//! Zero runtime dependencies -- only serde, chrono, thiserror.

pub mod config;
pub mod error;
pub mod message;
pub mod transport;

pub use error::DeliveryError;
pub use message::{Message, MimeType};
