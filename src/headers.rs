//! Message headers and the wire-level header contract.
//!
//! Headers are a loosely-typed metadata bag: an ordered mapping from unique,
//! case-sensitive keys to optional string values. A fixed set of well-known
//! keys (see [`keys`]) forms the only metadata every broker adapter must
//! carry. Adapters are free to add their own keys next to them.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Reserved header keys carried on every wire envelope.
pub mod keys {
    /// Unique message identifier.
    pub const MESSAGE_ID: &str = "courier-msg-id";

    /// Message name; doubles as the topic / routing key.
    pub const MESSAGE_NAME: &str = "courier-msg-name";

    /// Consumer group the copy was delivered to.
    pub const GROUP: &str = "courier-msg-group";

    /// Hint of the payload type.
    pub const TYPE: &str = "courier-msg-type";

    /// Correlation id linking a message to the one that caused it.
    pub const CORRELATION_ID: &str = "courier-corr-id";

    /// Position of the message inside its correlation chain.
    pub const CORRELATION_SEQUENCE: &str = "courier-corr-seq";

    /// Name of the topic a consumer should answer on.
    pub const CALLBACK_NAME: &str = "courier-callback-name";

    /// Identifier of the sending process instance.
    pub const EXECUTION_INSTANCE_ID: &str = "courier-exec-instance-id";

    /// UTC timestamp (RFC 3339) of the send.
    pub const SENT_TIME: &str = "courier-senttime";

    /// UTC timestamp (RFC 3339) before which a delayed message is not sent.
    pub const DELAY_TIME: &str = "courier-delaytime";

    /// Summary of the last failure, formatted `<TypeName>--><Message>`.
    pub const EXCEPTION: &str = "courier-exception";

    /// W3C trace-context parent.
    pub const TRACE_PARENT: &str = "traceparent";
}

/// Keys that must be present before a message reaches a sender.
pub const REQUIRED: [&str; 3] = [keys::MESSAGE_ID, keys::MESSAGE_NAME, keys::SENT_TIME];

/// Ordered header mapping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Headers(BTreeMap<String, Option<String>>);

impl Headers {
    /// Create an empty header mapping.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value, replacing any previous value for `key`.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.0.insert(key.into(), Some(value.into()));
        self
    }

    /// Insert a key with an explicit null value.
    pub fn insert_null(&mut self, key: impl Into<String>) -> &mut Self {
        self.0.insert(key.into(), None);
        self
    }

    /// Look up a non-null value.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|v| v.as_deref())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Option<String>> {
        self.0.remove(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_deref()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn id(&self) -> Option<&str> {
        self.get(keys::MESSAGE_ID)
    }

    pub fn name(&self) -> Option<&str> {
        self.get(keys::MESSAGE_NAME)
    }

    pub fn group(&self) -> Option<&str> {
        self.get(keys::GROUP)
    }

    pub fn callback_name(&self) -> Option<&str> {
        self.get(keys::CALLBACK_NAME)
    }

    pub fn exception(&self) -> Option<&str> {
        self.get(keys::EXCEPTION)
    }

    /// Parsed sent-time header, if present and well-formed.
    pub fn sent_time(&self) -> Option<DateTime<Utc>> {
        self.time(keys::SENT_TIME)
    }

    /// Parsed delay-time header, if present and well-formed.
    pub fn delay_time(&self) -> Option<DateTime<Utc>> {
        self.time(keys::DELAY_TIME)
    }

    /// Store a timestamp under `key` as UTC RFC 3339.
    pub fn insert_time(&mut self, key: &str, time: DateTime<Utc>) -> &mut Self {
        self.insert(key, format_time(time))
    }

    /// Record a failure summary in the exception header.
    pub fn set_exception(&mut self, type_name: &str, message: impl std::fmt::Display) {
        self.insert(keys::EXCEPTION, format!("{type_name}-->{message}"));
    }

    /// Returns the first required key that is absent or null.
    pub fn missing_required(&self) -> Option<&'static str> {
        REQUIRED
            .into_iter()
            .find(|key| self.get(key).is_none_or(str::is_empty))
    }

    fn time(&self, key: &str) -> Option<DateTime<Utc>> {
        self.get(key)
            .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
            .map(|t| t.with_timezone(&Utc))
    }
}

impl<K, V> FromIterator<(K, V)> for Headers
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), Some(v.into())))
                .collect(),
        )
    }
}

/// Format a timestamp the way the header contract expects it.
pub fn format_time(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_case_sensitive() {
        let mut headers = Headers::new();
        headers.insert("Key", "a").insert("key", "b");

        assert_eq!(headers.len(), 2);
        assert_eq!(headers.get("Key"), Some("a"));
        assert_eq!(headers.get("key"), Some("b"));
    }

    #[test]
    fn null_values_are_kept_but_not_returned() {
        let mut headers = Headers::new();
        headers.insert_null(keys::CALLBACK_NAME);

        assert!(headers.contains_key(keys::CALLBACK_NAME));
        assert_eq!(headers.callback_name(), None);
    }

    #[test]
    fn reports_first_missing_required_key() {
        let mut headers = Headers::new();
        headers.insert(keys::MESSAGE_ID, "1");
        assert_eq!(headers.missing_required(), Some(keys::MESSAGE_NAME));

        headers.insert(keys::MESSAGE_NAME, "demo.ping");
        assert_eq!(headers.missing_required(), Some(keys::SENT_TIME));

        headers.insert_time(keys::SENT_TIME, Utc::now());
        assert_eq!(headers.missing_required(), None);
    }

    #[test]
    fn exception_summary_format() {
        let mut headers = Headers::new();
        headers.set_exception("PublishFailed", "broker unreachable");

        assert_eq!(
            headers.exception(),
            Some("PublishFailed-->broker unreachable")
        );
    }

    #[test]
    fn times_round_trip_through_headers() {
        let now = DateTime::parse_from_rfc3339("2024-05-01T10:00:00.250Z")
            .unwrap()
            .with_timezone(&Utc);
        let mut headers = Headers::new();
        headers.insert_time(keys::DELAY_TIME, now);

        assert_eq!(headers.get(keys::DELAY_TIME), Some("2024-05-01T10:00:00.250Z"));
        assert_eq!(headers.delay_time(), Some(now));
    }
}
