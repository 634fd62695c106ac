//! Message headers (case-insensitive keys).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Unique id of a message. Required on every received message.
pub const MESSAGE_ID: &str = "msg-id";
/// Routing key used to resolve handlers.
pub const MESSAGE_TYPE: &str = "msg-type";
/// Correlation id, copied from the message id when absent.
pub const CORRELATION_ID: &str = "correlation-id";
/// Number of hand-offs, maintained natively by some transports.
pub const DELIVERY_COUNT: &str = "delivery-count";
/// Failure description written right before dead-lettering.
pub const ERROR_DETAILS: &str = "error-details";
/// Input queue the message failed in, written right before dead-lettering.
pub const SOURCE_QUEUE: &str = "source-queue";
/// Marks a second-level retry dispatch.
pub const SECOND_LEVEL_RETRY: &str = "second-level-retry";
/// RFC 3339 time the message was sent.
pub const SENT_TIME: &str = "sent-time";

/// Header map with case-insensitive keys.
///
/// The spelling of a key is the one used when it was first inserted;
/// lookups and replacements ignore ASCII case.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "BTreeMap<String, String>", into = "BTreeMap<String, String>")]
pub struct Headers {
    entries: BTreeMap<String, (String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .get(&key.to_ascii_lowercase())
            .map(|(_, value)| value.as_str())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(&key.to_ascii_lowercase())
    }

    /// Insert or replace a header, returning the previous value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        let key = key.into();
        let value = value.into();
        let folded = key.to_ascii_lowercase();

        match self.entries.get_mut(&folded) {
            Some((_, existing)) => Some(std::mem::replace(existing, value)),
            None => {
                self.entries.insert(folded, (key, value));
                None
            }
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.entries
            .remove(&key.to_ascii_lowercase())
            .map(|(_, value)| value)
    }

    /// Iterate `(key, value)` pairs using the original key spelling.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .values()
            .map(|(key, value)| (key.as_str(), value.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl From<BTreeMap<String, String>> for Headers {
    fn from(map: BTreeMap<String, String>) -> Self {
        map.into_iter().collect()
    }
}

impl From<Headers> for BTreeMap<String, String> {
    fn from(headers: Headers) -> Self {
        headers.entries.into_values().collect()
    }
}

impl<K, V> FromIterator<(K, V)> for Headers
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = Headers::new();
        for (key, value) in iter {
            headers.insert(key, value);
        }
        headers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookups_ignore_case() {
        let mut headers = Headers::new();
        headers.insert("Msg-Id", "abc");

        assert_eq!(headers.get("msg-id"), Some("abc"));
        assert_eq!(headers.get("MSG-ID"), Some("abc"));
        assert!(headers.contains_key("mSg-iD"));
    }

    #[test]
    fn replace_keeps_first_spelling() {
        let mut headers = Headers::new();
        headers.insert("Error-Details", "first");
        let old = headers.insert("error-details", "second");

        assert_eq!(old.as_deref(), Some("first"));
        assert_eq!(headers.len(), 1);
        assert_eq!(headers.iter().next(), Some(("Error-Details", "second")));
    }

    #[test]
    fn remove_is_case_insensitive() {
        let mut headers: Headers = [("Delivery-Count", "2")].into_iter().collect();
        assert_eq!(headers.remove("delivery-count").as_deref(), Some("2"));
        assert!(headers.is_empty());
    }

    #[test]
    fn serializes_as_plain_map() {
        let headers: Headers = [(MESSAGE_ID, "m-1"), (MESSAGE_TYPE, "order.placed")]
            .into_iter()
            .collect();

        let json = serde_json::to_value(&headers).unwrap();
        assert_eq!(json["msg-id"], "m-1");

        let back: Headers = serde_json::from_value(json).unwrap();
        assert_eq!(back, headers);
    }
}
