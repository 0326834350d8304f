//! Message envelopes
//!
//! An [`Envelope`] is a message body plus its transport metadata. It is built
//! once per publish call and never mutated afterwards; a retried message is a
//! new envelope derived from the delivered one.

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Header carrying the number of times a message has been retried
pub const RETRY_COUNT_HEADER: &str = "x-retry-count";

/// Content type used for every published business event
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Application headers attached to an envelope
pub type Headers = BTreeMap<String, HeaderValue>;

/// A single header value
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
}

impl HeaderValue {
    /// Interpret the value as a non-negative count
    pub fn as_count(&self) -> Option<u32> {
        match self {
            HeaderValue::Int(n) => u32::try_from(*n).ok(),
            _ => None,
        }
    }
}

/// Whether the broker writes the message to disk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryMode {
    Transient,
    #[default]
    Persistent,
}

impl DeliveryMode {
    /// AMQP wire value (1 = transient, 2 = persistent)
    pub fn as_amqp(self) -> u8 {
        match self {
            DeliveryMode::Transient => 1,
            DeliveryMode::Persistent => 2,
        }
    }

    pub fn from_amqp(value: u8) -> Self {
        if value == 2 {
            DeliveryMode::Persistent
        } else {
            DeliveryMode::Transient
        }
    }
}

/// A message plus its transport metadata
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    correlation_id: String,
    message_id: String,
    timestamp: DateTime<Utc>,
    content_type: String,
    delivery_mode: DeliveryMode,
    headers: Headers,
    body: Vec<u8>,
}

impl Envelope {
    /// Start building an envelope around raw bytes
    pub fn builder(body: impl Into<Vec<u8>>) -> EnvelopeBuilder {
        EnvelopeBuilder::new(body.into())
    }

    /// Start building a JSON envelope from a serializable payload
    pub fn json<T: Serialize + ?Sized>(payload: &T) -> Result<EnvelopeBuilder, serde_json::Error> {
        let body = serde_json::to_vec(payload)?;
        Ok(EnvelopeBuilder::new(body).content_type(JSON_CONTENT_TYPE))
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn delivery_mode(&self) -> DeliveryMode {
        self.delivery_mode
    }

    pub fn is_persistent(&self) -> bool {
        self.delivery_mode == DeliveryMode::Persistent
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Retry count carried in the `x-retry-count` header.
    ///
    /// Absent, negative or non-integer values count as zero.
    pub fn retry_count(&self) -> u32 {
        self.headers
            .get(RETRY_COUNT_HEADER)
            .and_then(HeaderValue::as_count)
            .unwrap_or(0)
    }

    /// Copy of this envelope with every property and header preserved
    /// except `x-retry-count`, which is set to `retry_count`.
    pub fn with_retry_count(&self, retry_count: u32) -> Envelope {
        let mut next = self.clone();
        next.headers.insert(
            RETRY_COUNT_HEADER.to_string(),
            HeaderValue::Int(i64::from(retry_count)),
        );
        next
    }
}

/// Builder for [`Envelope`]
#[derive(Debug)]
pub struct EnvelopeBuilder {
    correlation_id: Option<String>,
    message_id: Option<String>,
    timestamp: Option<DateTime<Utc>>,
    content_type: String,
    delivery_mode: DeliveryMode,
    headers: Headers,
    body: Vec<u8>,
}

impl EnvelopeBuilder {
    fn new(body: Vec<u8>) -> Self {
        Self {
            correlation_id: None,
            message_id: None,
            timestamp: None,
            content_type: JSON_CONTENT_TYPE.to_string(),
            delivery_mode: DeliveryMode::Persistent,
            headers: Headers::new(),
            body,
        }
    }

    /// Use a caller-supplied correlation id instead of a generated one
    pub fn correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Timestamp from AMQP seconds since the epoch
    pub fn timestamp_secs(self, secs: u64) -> Self {
        match i64::try_from(secs).ok().and_then(|s| Utc.timestamp_opt(s, 0).single()) {
            Some(ts) => self.timestamp(ts),
            None => self,
        }
    }

    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    pub fn delivery_mode(mut self, mode: DeliveryMode) -> Self {
        self.delivery_mode = mode;
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: HeaderValue) -> Self {
        self.headers.insert(key.into(), value);
        self
    }

    pub fn headers(mut self, headers: Headers) -> Self {
        self.headers.extend(headers);
        self
    }

    pub fn build(self) -> Envelope {
        Envelope {
            correlation_id: self
                .correlation_id
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            message_id: self.message_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
            content_type: self.content_type,
            delivery_mode: self.delivery_mode,
            headers: self.headers,
            body: self.body,
        }
    }
}

/// A message handed to a consumer by the broker
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Channel-scoped tag used for ack/nack/reject
    pub delivery_tag: u64,
    /// Whether the broker has delivered this message before
    pub redelivered: bool,
    /// Exchange the message was originally published to
    pub exchange: String,
    /// Routing key the message was originally published with
    pub routing_key: String,
    pub envelope: Envelope,
}
