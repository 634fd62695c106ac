//! Transport-level message.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::headers::{self, Headers};

/// Identifier assigned to outgoing messages.
///
/// Uses UUIDv7 (time-ordered). The wire representation is the plain string in
/// the `msg-id` header, so ids coming from other systems need not be UUIDs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for MessageId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Immutable message as moved by a transport: headers plus opaque body bytes.
///
/// "Modifying" a message produces a new value (`with_header`), so a message
/// held by one pipeline step can never change under another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportMessage {
    headers: Headers,
    body: Vec<u8>,
}

impl TransportMessage {
    pub fn new(headers: Headers, body: impl Into<Vec<u8>>) -> Self {
        Self {
            headers,
            body: body.into(),
        }
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key)
    }

    /// The `msg-id` header, or `None` when absent or blank.
    pub fn message_id(&self) -> Option<&str> {
        self.headers
            .get(headers::MESSAGE_ID)
            .map(str::trim)
            .filter(|id| !id.is_empty())
    }

    pub fn message_type(&self) -> Option<&str> {
        self.headers.get(headers::MESSAGE_TYPE)
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.headers.get(headers::CORRELATION_ID)
    }

    /// Transport-maintained delivery count; `None` when absent or not a number.
    pub fn delivery_count(&self) -> Option<u32> {
        self.headers
            .get(headers::DELIVERY_COUNT)
            .and_then(|raw| raw.trim().parse().ok())
    }

    pub fn is_second_level_retry(&self) -> bool {
        self.headers
            .get(headers::SECOND_LEVEL_RETRY)
            .is_some_and(|v| v.eq_ignore_ascii_case("true"))
    }

    /// Copy of this message with one header added or replaced.
    pub fn with_header(&self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let mut headers = self.headers.clone();
        headers.insert(key, value);
        Self {
            headers,
            body: self.body.clone(),
        }
    }

    /// Copy of this message with one header removed.
    pub fn without_header(&self, key: &str) -> Self {
        let mut headers = self.headers.clone();
        headers.remove(key);
        Self {
            headers,
            body: self.body.clone(),
        }
    }
}
