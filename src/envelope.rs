use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::{
    headers::{Headers, keys},
    transport::RawPayload,
};

/// Message container used by the outbox and delivery pipeline.
///
/// `Envelope` bundles a message payload together with its associated headers.
/// It is intentionally generic and transport-agnostic; the pipeline uses two
/// instantiations of it:
///
/// - [`Message<M>`]: what application code publishes, with a typed value
/// - [`TransportMessage`]: the wire envelope handed to a broker, with a raw
///   byte body
///
/// ## Example
///
/// ```rust
/// use courier::{Envelope, Headers};
///
/// let envelope = Envelope {
///     headers: Headers::new(),
///     message: 42,
/// };
///
/// // or, equivalently
/// let envelope: Envelope<_, _> = (Headers::new(), 42).into();
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope<H, M> {
    /// Message metadata.
    pub headers: H,
    /// Message payload.
    pub message: M,
}

impl<H, M> From<(H, M)> for Envelope<H, M> {
    fn from(value: (H, M)) -> Self {
        Envelope {
            headers: value.0,
            message: value.1,
        }
    }
}

/// Canonical application message.
pub type Message<M> = Envelope<Headers, M>;

/// Wire envelope: contract headers plus the serialized body.
pub type TransportMessage = Envelope<Headers, RawPayload>;

impl<M> Envelope<Headers, M> {
    /// Start building a message published under `name`.
    pub fn builder(name: impl Into<String>, value: M) -> MessageBuilder<M> {
        MessageBuilder::new(name, value)
    }

    /// Message id header.
    pub fn id(&self) -> Option<&str> {
        self.headers.id()
    }

    /// Message name header, i.e. the topic.
    pub fn name(&self) -> Option<&str> {
        self.headers.name()
    }
}

/// Builder filling the reserved headers of a [`Message`].
///
/// `build` always sets the message id (a fresh UUID unless one was given),
/// the message name and the sent-time, so every built message satisfies
/// the minimal header contract.
#[derive(Debug)]
pub struct MessageBuilder<M> {
    name: String,
    value: M,
    headers: Headers,
    delay: Option<Duration>,
}

impl<M> MessageBuilder<M> {
    pub fn new(name: impl Into<String>, value: M) -> Self {
        Self {
            name: name.into(),
            value,
            headers: Headers::new(),
            delay: None,
        }
    }

    /// Use a caller-supplied message id.
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.headers.insert(keys::MESSAGE_ID, id);
        self
    }

    /// Add an arbitrary header.
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key, value);
        self
    }

    pub fn correlation(mut self, id: impl Into<String>, sequence: u32) -> Self {
        self.headers
            .insert(keys::CORRELATION_ID, id)
            .insert(keys::CORRELATION_SEQUENCE, sequence.to_string());
        self
    }

    pub fn callback(mut self, name: impl Into<String>) -> Self {
        self.headers.insert(keys::CALLBACK_NAME, name);
        self
    }

    pub fn type_hint(mut self, type_name: impl Into<String>) -> Self {
        self.headers.insert(keys::TYPE, type_name);
        self
    }

    /// W3C trace context of the publishing span, forwarded untouched.
    pub fn trace_parent(mut self, traceparent: impl Into<String>) -> Self {
        self.headers.insert(keys::TRACE_PARENT, traceparent);
        self
    }

    /// Override the publishing instance id the outbox would stamp.
    pub fn instance_id(mut self, id: impl Into<String>) -> Self {
        self.headers.insert(keys::EXECUTION_INSTANCE_ID, id);
        self
    }

    /// Hold the message back for `delay` after publishing.
    ///
    /// Delays past the last representable header time saturate to it.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn build(self) -> Message<M> {
        let mut headers = self.headers;
        let now = Utc::now();

        if headers.id().is_none() {
            headers.insert(keys::MESSAGE_ID, uuid::Uuid::new_v4().to_string());
        }
        headers.insert(keys::MESSAGE_NAME, self.name);
        headers.insert_time(keys::SENT_TIME, now);

        if let Some(delay) = self.delay {
            let latest = latest_delay_time();
            let due = chrono::Duration::from_std(delay)
                .ok()
                .and_then(|delay| now.checked_add_signed(delay))
                .map_or(latest, |due| due.min(latest));
            headers.insert_time(keys::DELAY_TIME, due);
        }

        Envelope {
            headers,
            message: self.value,
        }
    }
}

/// 9999-12-31T23:59:59.999Z, the last instant RFC 3339 can write.
fn latest_delay_time() -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(253_402_300_799, 999_000_000).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_fills_required_headers() {
        let msg = Message::builder("demo.ping", "hi").build();

        assert_eq!(msg.headers.missing_required(), None);
        assert_eq!(msg.name(), Some("demo.ping"));
        assert!(msg.id().is_some());
        assert_eq!(msg.message, "hi");
    }

    #[test]
    fn builder_keeps_explicit_id_and_extra_headers() {
        let msg = Message::builder("demo.ping", ())
            .id("42")
            .correlation("41", 2)
            .header("x-tenant", "acme")
            .build();

        assert_eq!(msg.id(), Some("42"));
        assert_eq!(msg.headers.get(keys::CORRELATION_ID), Some("41"));
        assert_eq!(msg.headers.get(keys::CORRELATION_SEQUENCE), Some("2"));
        assert_eq!(msg.headers.get("x-tenant"), Some("acme"));
    }

    #[test]
    fn delayed_message_carries_delay_time_after_sent_time() {
        let msg = Message::builder("demo.later", ())
            .delay(Duration::from_secs(30))
            .build();

        let sent = msg.headers.sent_time().unwrap();
        let due = msg.headers.delay_time().unwrap();
        assert_eq!((due - sent).num_seconds(), 30);
    }

    #[test]
    fn oversized_delay_saturates_into_the_far_future() {
        let msg = Message::builder("demo.never", ()).delay(Duration::MAX).build();

        let due = msg.headers.delay_time().unwrap();
        assert_eq!(due, latest_delay_time());
        assert!(due > Utc::now() + chrono::Duration::days(365 * 1000));
    }

    #[test]
    fn trace_parent_and_instance_id_are_set_by_the_builder() {
        let traceparent = "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01";
        let msg = Message::builder("demo.ping", ())
            .trace_parent(traceparent)
            .instance_id("node-7")
            .build();

        assert_eq!(msg.headers.get(keys::TRACE_PARENT), Some(traceparent));
        assert_eq!(msg.headers.get(keys::EXECUTION_INSTANCE_ID), Some("node-7"));
    }
}
