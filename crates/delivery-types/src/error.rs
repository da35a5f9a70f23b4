use thiserror::Error;

/// Errors produced by routing, transports, and registry operations.
///
/// Every variant carries a human-readable detail string. Benign outcomes
/// (no subscriber for a response, a stale message dropped) are not errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("missing or unknown mime_type: {0}")]
    MissingOrUnknownMimeType(String),

    #[error("unknown message kind: {0}")]
    UnknownMessageKind(String),

    #[error("request without transaction expiration: {0}")]
    MissingExpiration(String),

    #[error("unsupported transport type: {0}")]
    UnsupportedTransportType(String),

    #[error("subscription not found: {0}")]
    SubscriptionNotFound(String),

    #[error("internal consistency error: {0}")]
    InternalConsistency(String),

    #[error("not supported: {0}")]
    NotSupported(String),

    #[error("delivery service stopped: {0}")]
    ServiceStopped(String),

    #[error("participant not connected: {0}")]
    NotConnected(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("tunnel error: {0}")]
    Tunnel(String),
}

impl DeliveryError {
    /// The detail string without the variant prefix.
    pub fn detail(&self) -> &str {
        match self {
            DeliveryError::InvalidMessage(d)
            | DeliveryError::MissingOrUnknownMimeType(d)
            | DeliveryError::UnknownMessageKind(d)
            | DeliveryError::MissingExpiration(d)
            | DeliveryError::UnsupportedTransportType(d)
            | DeliveryError::SubscriptionNotFound(d)
            | DeliveryError::InternalConsistency(d)
            | DeliveryError::NotSupported(d)
            | DeliveryError::ServiceStopped(d)
            | DeliveryError::NotConnected(d)
            | DeliveryError::InvalidConfig(d)
            | DeliveryError::Tunnel(d) => d,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delivery_error_display() {
        let err = DeliveryError::SubscriptionNotFound("matcher #7".to_string());
        assert_eq!(err.to_string(), "subscription not found: matcher #7");
    }

    #[test]
    fn test_detail_strips_prefix() {
        let err = DeliveryError::MissingExpiration("no header".to_string());
        assert_eq!(err.detail(), "no header");
        assert!(err.to_string().starts_with("request without transaction expiration"));
    }
}
