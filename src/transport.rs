//! Transport abstractions and sender backends.
//!
//! This module defines a Tower-compatible transport layer used to hand
//! [`TransportMessage`]s to a broker through different backends (in-memory,
//! Kafka, RabbitMQ).
//!
//! The transport is built around Tower’s `Service` abstraction, enabling
//! middleware composition while keeping sender implementations
//! backend-agnostic. A transport performs exactly one delivery attempt per
//! call: retrying is the outbox lifecycle's job.
//!
//! ## Key components
//!
//! - [`Transport`]: Public-facing wrapper implementing `tower::Service`
//! - [`SenderService`]: Adapter from a [`Sender`] to a Tower service
//! - [`Sender`]: Trait implemented by concrete broker adapters
//! - [`TransportError`]: Unified error type with tracing context

mod inmemory;

#[cfg(feature = "kafka")]
pub mod kafka;

pub mod layers;

#[cfg(feature = "rabbitmq")]
pub mod rabbitmq;

use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use serde::{Deserialize, Serialize};
use tower::{Layer as _, Service, ServiceExt as _};
use tracing_error::SpanTrace;

use crate::{Envelope, TransportMessage, headers::Headers};

pub use inmemory::InMemory;
use layers::{HeaderContract, HeaderContractLayer};

/// Outcome of a single send attempt.
pub type OperateResult = Result<(), TransportError>;

/// Generic Tower-compatible transport wrapper.
///
/// `Transport` is the main entry point for sending envelopes. It wraps an
/// underlying Tower `Service` and:
///
/// - Normalizes errors into [`TransportError`]
/// - Supports Tower middleware via layers
/// - Provides a convenience [`send`](Transport::send) API
///
/// Typically constructed from a concrete [`Sender`] implementation.
#[derive(Clone)]
pub struct Transport<S> {
    service: S,
    address: BrokerAddress,
}

impl<D> Transport<HeaderContract<SenderService<D>>>
where
    D: Sender,
{
    /// Create a new transport from a concrete sender backend.
    ///
    /// The sender is wrapped in a [`SenderService`] behind a
    /// [`HeaderContractLayer`], so nothing reaches the backend without a
    /// message id, a message name and a sent-time.
    pub fn new(driver: D) -> Self {
        let address = driver.address();
        Self {
            service: HeaderContractLayer.layer(SenderService::new(driver)),
            address,
        }
    }
}

impl<S> Transport<S> {
    /// Apply a Tower layer to the transport.
    pub fn layer<L>(self, layer: L) -> Transport<L::Service>
    where
        L: tower::Layer<S>,
    {
        Transport {
            service: layer.layer(self.service),
            address: self.address,
        }
    }

    /// Address of the broker behind this transport.
    pub fn address(&self) -> &BrokerAddress {
        &self.address
    }
}

/// Tower `Service` implementation for `Transport`.
///
/// Delegates readiness and request handling to the inner service while mapping
/// all errors into [`TransportError`].
impl<R, S> Service<R> for Transport<S>
where
    S: Service<R> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Into<tower::BoxError>,
    R: Send + 'static,
{
    type Response = ();
    type Error = TransportError;
    type Future = Pin<Box<dyn Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.service
            .poll_ready(cx)
            .map_err(|e| TransportError::from_boxed(e.into()))
    }

    fn call(&mut self, req: R) -> Self::Future {
        let clone = self.service.clone();
        let mut service = std::mem::replace(&mut self.service, clone);

        Box::pin(async move {
            service
                .call(req)
                .await
                .map_err(|e| TransportError::from_boxed(e.into()))?;
            Ok(())
        })
    }
}

impl<S> Transport<S> {
    /// Send an envelope through the transport.
    ///
    /// This is a convenience method for users that do not need direct access
    /// to the `tower::Service` API.
    pub async fn send<M>(&mut self, envelope: Envelope<Headers, M>) -> OperateResult
    where
        M: Send + 'static,
        S: Service<Envelope<Headers, M>> + Clone + Send + 'static,
        S::Future: Send + 'static,
        S::Error: Into<tower::BoxError>,
    {
        self.service
            .clone()
            .oneshot(envelope)
            .await
            .map_err(|e| TransportError::from_boxed(e.into()))?;
        Ok(())
    }
}

/// Broker kind and endpoint, used for diagnostics only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    pub name: String,
    pub endpoint: Option<String>,
}

impl BrokerAddress {
    pub fn new(name: impl Into<String>, endpoint: Option<String>) -> Self {
        Self {
            name: name.into(),
            endpoint,
        }
    }
}

impl std::fmt::Display for BrokerAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.endpoint {
            Some(endpoint) => write!(f, "{}${}", self.name, endpoint),
            None => f.write_str(&self.name),
        }
    }
}

/// Error returned by transport operations.
///
/// Each error captures:
/// - The underlying error kind
/// - A tracing span backtrace for improved diagnostics
///
/// Whatever the backend, callers see a stable [`code`](Self::code) and
/// [`description`](Self::description) with the original cause available via
/// [`std::error::Error::source`].
#[derive(Debug)]
pub struct TransportError {
    context: SpanTrace,
    kind: TransportErrorKind,
}

/// Transport errors kind.
#[derive(Debug)]
pub enum TransportErrorKind {
    /// The broker could not accept the message.
    Publish(tower::BoxError),
    /// The broker adapter could not connect at all.
    Connection(tower::BoxError),
    /// No consumer group subscribed to the topic, or `group` subscribed but
    /// has no live client to take its copy.
    Routing {
        topic: String,
        group: Option<String>,
    },
    /// A required header was missing when the message reached the sender.
    MissingHeader(&'static str),
    /// Errors related to serialization or deserialization.
    Serde(tower::BoxError),
}

impl TransportError {
    /// Create a publish-failure error.
    pub fn publish(err: impl Into<tower::BoxError>) -> Self {
        Self::new(TransportErrorKind::Publish(err.into()))
    }

    /// Create a connection-failure error.
    pub fn connection(err: impl Into<tower::BoxError>) -> Self {
        Self::new(TransportErrorKind::Connection(err.into()))
    }

    /// Create a routing-failure error for a topic nobody subscribed to.
    pub fn no_subscriber(topic: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Routing {
            topic: topic.into(),
            group: None,
        })
    }

    /// Create a routing-failure error for a subscribed group that has no
    /// live client.
    pub fn no_client(topic: impl Into<String>, group: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Routing {
            topic: topic.into(),
            group: Some(group.into()),
        })
    }

    pub fn missing_header(key: &'static str) -> Self {
        Self::new(TransportErrorKind::MissingHeader(key))
    }

    /// Create a serialization-related transport error.
    pub fn serde(err: impl Into<tower::BoxError>) -> Self {
        Self::new(TransportErrorKind::Serde(err.into()))
    }

    fn new(kind: TransportErrorKind) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind,
        }
    }

    /// Normalize a boxed service error, keeping its kind if it already is a
    /// `TransportError`.
    pub(crate) fn from_boxed(err: tower::BoxError) -> Self {
        match err.downcast::<TransportError>() {
            Ok(err) => *err,
            Err(err) => Self::publish(err),
        }
    }

    pub fn kind(&self) -> &TransportErrorKind {
        &self.kind
    }

    /// Stable error code.
    pub fn code(&self) -> &'static str {
        match &self.kind {
            TransportErrorKind::Publish(_) => "PublishFailed",
            TransportErrorKind::Connection(_) => "ConnectionFailed",
            TransportErrorKind::Routing { .. } => "RoutingFailed",
            TransportErrorKind::MissingHeader(_) => "MissingHeader",
            TransportErrorKind::Serde(_) => "SerializationFailed",
        }
    }

    /// Human readable description.
    pub fn description(&self) -> String {
        match &self.kind {
            TransportErrorKind::Publish(err) => err.to_string(),
            TransportErrorKind::Connection(err) => err.to_string(),
            TransportErrorKind::Routing { topic, group: None } => format!(
                "Cannot find the corresponding group for {topic}. Have you subscribed?"
            ),
            TransportErrorKind::Routing {
                topic,
                group: Some(group),
            } => format!("Group {group} subscribed to {topic} has no live consumer client"),
            TransportErrorKind::MissingHeader(key) => {
                format!("Required header '{key}' is missing")
            }
            TransportErrorKind::Serde(err) => err.to_string(),
        }
    }

    /// Whether the error is a routing failure.
    pub fn is_routing(&self) -> bool {
        matches!(self.kind, TransportErrorKind::Routing { .. })
    }
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{}: {}", self.code(), self.description())?;
        self.context.fmt(f)
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            TransportErrorKind::Publish(err)
            | TransportErrorKind::Connection(err)
            | TransportErrorKind::Serde(err) => Some(err.as_ref()),
            TransportErrorKind::Routing { .. } | TransportErrorKind::MissingHeader(_) => None,
        }
    }
}

/// Tower service adapter for a [`Sender`] backend.
///
/// This type bridges the [`Sender`] trait with Tower’s `Service` abstraction.
#[derive(Clone)]
pub struct SenderService<D> {
    sender: D,
}

impl<D> SenderService<D> {
    /// Create a new sender service from a backend.
    pub fn new(sender: D) -> Self {
        Self { sender }
    }
}

/// `tower::Service` implementation delegating to a [`Sender`].
impl<D> Service<TransportMessage> for SenderService<D>
where
    D: Sender + Clone + Send + 'static,
{
    type Response = ();
    type Error = tower::BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: TransportMessage) -> Self::Future {
        let mut sender = self.sender.clone();
        Box::pin(async move {
            sender.send(req).await.map_err(Into::into)?;
            Ok(())
        })
    }
}

/// Trait implemented by concrete broker adapters.
///
/// A sender makes one attempt to hand a [`TransportMessage`] to an external
/// system (e.g. Kafka, RabbitMQ, or the in-memory queue). It must not retry
/// and must translate broker-specific metadata to and from the header
/// contract.
#[async_trait::async_trait]
pub trait Sender {
    /// Backend-specific error type.
    type Error: Into<tower::BoxError>;

    /// Broker kind and endpoint.
    fn address(&self) -> BrokerAddress;

    /// Send an envelope using the underlying broker.
    async fn send(&mut self, envelope: TransportMessage) -> Result<(), Self::Error>;
}

/// Wrapper type for raw byte payloads.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawPayload(Vec<u8>);

impl RawPayload {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.0
    }
}

impl From<Vec<u8>> for RawPayload {
    fn from(value: Vec<u8>) -> Self {
        Self(value)
    }
}

impl From<&[u8]> for RawPayload {
    fn from(value: &[u8]) -> Self {
        Self(value.to_vec())
    }
}

impl From<&str> for RawPayload {
    fn from(value: &str) -> Self {
        Self(value.as_bytes().to_vec())
    }
}

impl From<String> for RawPayload {
    fn from(value: String) -> Self {
        Self(value.into_bytes())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use tower::{Layer as _, ServiceExt as _};

    use super::*;
    use crate::{Message, broker::InMemoryQueue, headers::keys};

    #[derive(Clone, Default)]
    struct Unreachable {
        attempts: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl Sender for Unreachable {
        type Error = std::io::Error;

        fn address(&self) -> BrokerAddress {
            BrokerAddress::new("unreachable", Some("localhost:1".into()))
        }

        async fn send(&mut self, _envelope: TransportMessage) -> Result<(), Self::Error> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "broker unreachable",
            ))
        }
    }

    fn ping() -> TransportMessage {
        Message::builder("demo.ping", RawPayload::from("hi")).build()
    }

    #[tokio::test]
    async fn broker_failure_is_a_single_publish_failure() {
        let sender = Unreachable::default();
        let mut transport = Transport::new(sender.clone());

        let err = transport.send(ping()).await.unwrap_err();

        assert_eq!(err.code(), "PublishFailed");
        assert_eq!(err.description(), "broker unreachable");
        assert!(std::error::Error::source(&err).is_some());
        assert_eq!(sender.attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn routing_failure_keeps_its_kind_through_the_stack() {
        let queue = Arc::new(InMemoryQueue::new());
        let mut transport = Transport::new(InMemory::new(queue));

        let err = transport
            .send(Message::builder("demo.work", RawPayload::from("x")).build())
            .await
            .unwrap_err();

        assert!(err.is_routing());
        assert_eq!(
            err.description(),
            "Cannot find the corresponding group for demo.work. Have you subscribed?"
        );
    }

    #[tokio::test]
    async fn messages_without_contract_headers_never_reach_the_sender() {
        let sender = Unreachable::default();
        let mut transport = Transport::new(sender.clone());

        let mut message = ping();
        message.headers.remove(keys::SENT_TIME);
        let err = transport.send(message).await.unwrap_err();

        assert_eq!(err.code(), "MissingHeader");
        assert_eq!(sender.attempts.load(Ordering::SeqCst), 0);
    }

    /// Only the instance that was polled ready may be called; clones start
    /// unready.
    #[derive(Default)]
    struct ReadyOnce {
        ready: bool,
        calls: Arc<AtomicUsize>,
    }

    impl Clone for ReadyOnce {
        fn clone(&self) -> Self {
            Self {
                ready: false,
                calls: self.calls.clone(),
            }
        }
    }

    impl Service<TransportMessage> for ReadyOnce {
        type Response = ();
        type Error = tower::BoxError;
        type Future = std::future::Ready<Result<(), tower::BoxError>>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            self.ready = true;
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, _req: TransportMessage) -> Self::Future {
            if std::mem::take(&mut self.ready) {
                self.calls.fetch_add(1, Ordering::SeqCst);
                std::future::ready(Ok(()))
            } else {
                std::future::ready(Err("called before poll_ready".into()))
            }
        }
    }

    #[tokio::test]
    async fn layered_stack_calls_the_service_it_polled_ready() {
        let inner = ReadyOnce::default();
        let calls = inner.calls.clone();
        let mut transport = Transport {
            service: HeaderContractLayer.layer(inner),
            address: BrokerAddress::new("test", None),
        }
        .layer(layers::JsonLayer);

        let msg = Message::builder("demo.ping", "hi").build();
        tower::ServiceExt::<Message<&str>>::ready(&mut transport).await.unwrap().call(msg).await.unwrap();

        let msg = Message::builder("demo.ping", "again").build();
        transport.send(msg).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn broker_address_display() {
        let address = BrokerAddress::new("kafka", Some("localhost:9092".into()));
        assert_eq!(address.to_string(), "kafka$localhost:9092");
        assert_eq!(BrokerAddress::new("inmemory", None).to_string(), "inmemory");
    }
}
