//! The message envelope routed by the delivery service.
//!
//! A `Message` is a header map plus an opaque JSON body. Headers double as the
//! in-process protocol: `mime_type` selects the delivery mode, `to`/`from`
//! address participants, and the transaction headers correlate requests with
//! their responses.

use std::fmt;
use std::str::FromStr;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::DeliveryError;
use crate::transport::TunnelHeaders;

/// Header keys understood by the router and the transports.
pub mod header {
    pub const MIME_TYPE: &str = "mime_type";
    pub const FROM: &str = "from";
    pub const TO: &str = "to";
    pub const TRANSACTION_ID: &str = "transaction_id";
    pub const TRANSACTION_EXPIRATION_EPOCH_MS: &str = "transaction_expiration_epoch_ms";
    pub const TIMESTAMP_EPOCH_MS: &str = "timestamp_epoch_ms";
    /// Message-level drop-if-stale deadline, distinct from the transaction expiration.
    pub const EXPIRATION_EPOCH_MS: &str = "expiration_epoch_ms";
    pub const SUBSCRIBER_TRANSPORT_URI: &str = "subscriber_transport_uri";
    pub const SUBSCRIBER_AERON_SESSION_ID: &str = "subscriber_aeron_session_id";
}

/// Well-known destination every participant is subscribed to.
pub const BROADCAST: &str = "/broadcast";

/// Well-known destination for participants inside this process.
pub const LOCAL_BROADCAST: &str = "/local/broadcast";

/// Transaction lifetime used when a request is built without an explicit deadline.
pub const DEFAULT_TRANSACTION_EXPIRATION_MS: i64 = 1_000;

/// Current wall-clock time in epoch milliseconds.
pub fn now_epoch_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Header map: string keys to arbitrary JSON values.
pub type Headers = serde_json::Map<String, Value>;

/// The three delivery modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MimeType {
    #[serde(rename = "message_header/publish")]
    Publish,
    #[serde(rename = "message_header/request")]
    Request,
    #[serde(rename = "message_header/response")]
    Response,
}

impl MimeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MimeType::Publish => "message_header/publish",
            MimeType::Request => "message_header/request",
            MimeType::Response => "message_header/response",
        }
    }
}

impl fmt::Display for MimeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MimeType {
    type Err = DeliveryError;

    /// Accepts the full header value (`message_header/publish`) or the bare kind (`publish`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let kind = s.strip_prefix("message_header/").unwrap_or(s);
        match kind.to_lowercase().as_str() {
            "publish" => Ok(MimeType::Publish),
            "request" => Ok(MimeType::Request),
            "response" => Ok(MimeType::Response),
            other => Err(DeliveryError::MissingOrUnknownMimeType(format!(
                "unrecognized mime_type '{other}'"
            ))),
        }
    }
}

/// A routed message: headers plus an opaque body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default)]
    pub headers: Headers,
    #[serde(default)]
    pub body: Value,
}

impl Message {
    /// Build a message from raw parts without any defaults applied.
    pub fn new(headers: Headers, body: Value) -> Self {
        Self { headers, body }
    }

    /// Build a publish message.
    pub fn publish(from: impl Into<String>, to: impl Into<String>, body: impl Into<Value>) -> Self {
        let mut message = Self::addressed(MimeType::Publish, from.into(), to.into(), body.into());
        message.stamp_timestamp();
        message
    }

    /// Build a request message.
    ///
    /// Without an explicit deadline the transaction expires
    /// [`DEFAULT_TRANSACTION_EXPIRATION_MS`] from now; services configured with
    /// another default build requests through their own helpers instead. The
    /// `transaction_id` is assigned by the transport when the request is sent.
    pub fn request(
        from: impl Into<String>,
        to: impl Into<String>,
        body: impl Into<Value>,
        transaction_expiration_epoch_ms: Option<i64>,
    ) -> Self {
        Self::request_with_default(
            from,
            to,
            body,
            transaction_expiration_epoch_ms,
            DEFAULT_TRANSACTION_EXPIRATION_MS,
        )
    }

    /// Build a request whose deadline falls back to `default_expiration_ms` from now.
    pub fn request_with_default(
        from: impl Into<String>,
        to: impl Into<String>,
        body: impl Into<Value>,
        transaction_expiration_epoch_ms: Option<i64>,
        default_expiration_ms: i64,
    ) -> Self {
        let now = now_epoch_ms();
        let mut message = Self::addressed(MimeType::Request, from.into(), to.into(), body.into());
        let expiration =
            transaction_expiration_epoch_ms.unwrap_or(now.saturating_add(default_expiration_ms));
        message.set_header(header::TRANSACTION_EXPIRATION_EPOCH_MS, expiration);
        message.set_header(header::TIMESTAMP_EPOCH_MS, now);
        message
    }

    /// Build a response to `original_request`.
    ///
    /// The response is addressed back to the request's sender and inherits its
    /// `transaction_id`, transaction expiration, and tunnel headers.
    pub fn response(from: impl Into<String>, body: impl Into<Value>, original_request: &Message) -> Self {
        let mut message = Self {
            headers: Headers::new(),
            body: body.into(),
        };
        message.set_header(header::MIME_TYPE, MimeType::Response.as_str());
        message.set_header(header::FROM, from.into());
        if let Some(to) = original_request.header(header::FROM) {
            message.set_header(header::TO, to.clone());
        }
        if let Some(transaction_id) = original_request.header(header::TRANSACTION_ID) {
            message.set_header(header::TRANSACTION_ID, transaction_id.clone());
        }
        for key in [header::SUBSCRIBER_TRANSPORT_URI, header::SUBSCRIBER_AERON_SESSION_ID] {
            if let Some(value) = original_request.header_str(key) {
                message.set_header(key, value);
            }
        }
        if let Some(expiration) = original_request.transaction_expiration_epoch_ms() {
            message.set_header(header::TRANSACTION_EXPIRATION_EPOCH_MS, expiration);
        }
        message.stamp_timestamp();
        message
    }

    fn addressed(kind: MimeType, from: String, to: String, body: Value) -> Self {
        let mut message = Self {
            headers: Headers::new(),
            body,
        };
        message.set_header(header::MIME_TYPE, kind.as_str());
        message.set_header(header::FROM, from);
        message.set_header(header::TO, to);
        message
    }

    fn stamp_timestamp(&mut self) {
        self.set_header(header::TIMESTAMP_EPOCH_MS, now_epoch_ms());
    }

    pub fn header(&self, key: &str) -> Option<&Value> {
        self.headers.get(key)
    }

    pub fn header_str(&self, key: &str) -> Option<&str> {
        self.headers.get(key).and_then(Value::as_str)
    }

    pub fn header_i64(&self, key: &str) -> Option<i64> {
        self.headers.get(key).and_then(Value::as_i64)
    }

    pub fn has_header(&self, key: &str) -> bool {
        self.headers.contains_key(key)
    }

    pub fn set_header(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.headers.insert(key.into(), value.into());
    }

    /// Insert `value` only if `key` is not present. Returns whether it was inserted.
    pub fn set_header_if_absent(&mut self, key: &str, value: impl Into<Value>) -> bool {
        if self.headers.contains_key(key) {
            return false;
        }
        self.headers.insert(key.to_string(), value.into());
        true
    }

    /// Parsed `mime_type` header, `None` if absent or unrecognized.
    pub fn mime_type(&self) -> Option<MimeType> {
        self.header_str(header::MIME_TYPE)
            .and_then(|raw| raw.parse().ok())
    }

    pub fn from(&self) -> Option<&str> {
        self.header_str(header::FROM)
    }

    pub fn to(&self) -> Option<&str> {
        self.header_str(header::TO)
    }

    pub fn transaction_id(&self) -> Option<&str> {
        self.header_str(header::TRANSACTION_ID)
    }

    pub fn transaction_expiration_epoch_ms(&self) -> Option<i64> {
        self.header_i64(header::TRANSACTION_EXPIRATION_EPOCH_MS)
    }

    pub fn expiration_epoch_ms(&self) -> Option<i64> {
        self.header_i64(header::EXPIRATION_EPOCH_MS)
    }

    pub fn timestamp_epoch_ms(&self) -> Option<i64> {
        self.header_i64(header::TIMESTAMP_EPOCH_MS)
    }

    /// True when a non-zero `expiration_epoch_ms` lies strictly before `now_ms`.
    pub fn is_expired_at(&self, now_ms: i64) -> bool {
        matches!(self.expiration_epoch_ms(), Some(expiration) if expiration != 0 && expiration < now_ms)
    }

    /// Milliseconds until the transaction expires (negative once past),
    /// `None` if the header is not set.
    pub fn time_till_transaction_expiration_ms(&self, now_ms: i64) -> Option<i64> {
        self.transaction_expiration_epoch_ms()
            .map(|expiration| expiration - now_ms)
    }

    /// Tunnel metadata carried by this message, if both headers are present.
    pub fn tunnel_headers(&self) -> Option<TunnelHeaders> {
        Some(TunnelHeaders {
            subscriber_transport_uri: self.header_str(header::SUBSCRIBER_TRANSPORT_URI)?.to_string(),
            subscriber_aeron_session_id: self
                .header_str(header::SUBSCRIBER_AERON_SESSION_ID)?
                .to_string(),
        })
    }

    /// Stamp tunnel metadata without overwriting values already present.
    pub fn apply_tunnel_headers(&mut self, tunnel: &TunnelHeaders) {
        self.set_header_if_absent(
            header::SUBSCRIBER_TRANSPORT_URI,
            tunnel.subscriber_transport_uri.as_str(),
        );
        self.set_header_if_absent(
            header::SUBSCRIBER_AERON_SESSION_ID,
            tunnel.subscriber_aeron_session_id.as_str(),
        );
    }
}
