//! Consumer-side abstractions.
//!
//! A [`ConsumerClient`] is the receive path of one consumer group: it
//! subscribes the group to its topics, pulls inbound [`TransportMessage`]s
//! and hands each one to a callback under the group's concurrency gate. The
//! callback answers with an [`Outcome`] and the client then commits or
//! rejects the delivery through its [`DeliveryToken`].
//!
//! Clients are built by a [`ConsumerClientFactory`], one per group, and
//! driven by the [`ConsumerRegister`], which routes every message to the
//! handler registered for its group and topic.

mod descriptor;
mod inmemory;
#[cfg(feature = "kafka")]
pub mod kafka;
#[cfg(feature = "rabbitmq")]
pub mod rabbitmq;
mod register;

use std::{fmt, sync::Arc, time::Duration};

use futures_core::future::BoxFuture;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing_error::SpanTrace;

use crate::{TransportMessage, topic::TopicError, transport::BrokerAddress};

pub use descriptor::{
    ConsumerExecutorDescriptor, FnHandler, Handler, HandlerError, HandlerErrorKind, JsonHandler,
    handler_fn,
};
pub use inmemory::{InMemoryConsumerClient, InMemoryConsumerClientFactory};
pub use register::{ConsumerHandle, ConsumerHook, ConsumerRegister, DefaultConsumerHook};

/// What the client should do with a delivery once the callback returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Acknowledge the delivery.
    Commit,
    /// Negatively acknowledge the delivery.
    Reject,
}

/// Callback invoked for every inbound message.
///
/// The token is lent for inspection only; the client settles it with
/// [`ConsumerClient::commit`] or [`ConsumerClient::reject`] once the
/// returned future resolved.
pub type MessageCallback =
    Arc<dyn Fn(TransportMessage, &DeliveryToken) -> BoxFuture<'static, Outcome> + Send + Sync>;

/// Build a [`MessageCallback`] from an async closure.
pub fn message_callback<F, Fut>(f: F) -> MessageCallback
where
    F: Fn(TransportMessage, &DeliveryToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Outcome> + Send + 'static,
{
    Arc::new(
        move |message: TransportMessage, token: &DeliveryToken| -> BoxFuture<'static, Outcome> {
            Box::pin(f(message, token))
        },
    )
}

/// Sink for problems the receive loop reports without stopping.
pub type LogCallback = Arc<dyn Fn(LogMessage) + Send + Sync>;

/// Category of a receive-loop report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogKind {
    /// An inbound message broke the header contract and was skipped.
    InvalidMessage,
    /// Settling a delivery failed.
    SettleFailed,
    /// The broker went away.
    Disconnected,
}

/// One receive-loop report.
#[derive(Debug, Clone)]
pub struct LogMessage {
    pub kind: LogKind,
    pub group: String,
    pub reason: String,
}

/// Default [`LogCallback`]: reports through `tracing`.
pub fn default_log_callback() -> LogCallback {
    Arc::new(|log: LogMessage| {
        tracing::warn!(
            kind = ?log.kind,
            group = %log.group,
            reason = %log.reason,
            "Consumer client report"
        );
    })
}

/// Receive path of one consumer group.
///
/// Implementations must:
/// - make `subscribe` idempotent and refuse `listen` before it
/// - run at most `group_concurrency` callbacks at a time (sequentially when
///   it is `0`), waiting for a free slot before reading the next message
/// - report loop-level problems through the log callback and keep going
/// - stop reading on cancellation and let in-flight callbacks finish
#[async_trait::async_trait]
pub trait ConsumerClient: Send + Sync {
    /// Group this client receives for.
    fn group(&self) -> &str;

    /// Broker kind and endpoint.
    fn address(&self) -> BrokerAddress;

    /// Replace the sink for receive-loop reports.
    fn set_log_callback(&self, callback: LogCallback);

    /// Register interest in `topics`.
    async fn subscribe(&self, topics: Vec<String>) -> Result<(), ConsumerError>;

    /// Receive until `cancel` fires or the broker disconnects.
    ///
    /// `timeout` bounds a single wait for the next message.
    async fn listen(
        &self,
        timeout: Duration,
        cancel: CancellationToken,
        callback: MessageCallback,
    ) -> Result<(), ConsumerError>;

    /// Acknowledge a delivery, releasing its concurrency slot.
    async fn commit(&self, token: DeliveryToken) -> Result<(), ConsumerError>;

    /// Negatively acknowledge a delivery, releasing its concurrency slot.
    async fn reject(&self, token: DeliveryToken) -> Result<(), ConsumerError>;
}

/// Creates one [`ConsumerClient`] per consumer group.
#[async_trait::async_trait]
pub trait ConsumerClientFactory: Send + Sync {
    type Client: ConsumerClient + 'static;

    async fn create(
        &self,
        group: &str,
        group_concurrency: usize,
    ) -> Result<Self::Client, ConsumerError>;
}

/// Handle on one delivery.
///
/// Owns the concurrency slot reserved for the delivery, if any. Settling
/// the token consumes it, so a slot is released exactly once.
#[derive(Debug)]
pub struct DeliveryToken {
    group: String,
    tag: u64,
    slot: Option<OwnedSemaphorePermit>,
}

impl DeliveryToken {
    pub fn new(group: impl Into<String>, tag: u64, slot: Option<OwnedSemaphorePermit>) -> Self {
        Self {
            group: group.into(),
            tag,
            slot,
        }
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    /// Broker-specific delivery tag.
    pub fn tag(&self) -> u64 {
        self.tag
    }

    /// Release the slot; returns whether one was held.
    pub fn release(self) -> bool {
        self.slot.is_some()
    }
}

/// Per-group concurrency gate.
///
/// With a concurrency of `0` no slots exist and callbacks run inline. With
/// `k > 0`, `k` slots are shared by the callbacks in flight; tasks are
/// tracked so that they can be waited for on shutdown.
#[derive(Debug)]
pub struct ConcurrencyGate {
    slots: Option<Arc<Semaphore>>,
    limit: usize,
    tasks: TaskTracker,
}

impl ConcurrencyGate {
    pub fn new(concurrency: usize) -> Self {
        Self {
            slots: (concurrency > 0).then(|| Arc::new(Semaphore::new(concurrency))),
            limit: concurrency,
            tasks: TaskTracker::new(),
        }
    }

    pub fn is_sequential(&self) -> bool {
        self.slots.is_none()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Slots currently free.
    pub fn available(&self) -> usize {
        self.slots
            .as_ref()
            .map_or(0, |slots| slots.available_permits())
    }

    /// Wait for a free slot. Sequential gates return `None` right away.
    pub async fn reserve(&self) -> Option<OwnedSemaphorePermit> {
        match &self.slots {
            // The semaphore is never closed.
            Some(slots) => slots.clone().acquire_owned().await.ok(),
            None => None,
        }
    }

    /// Run a callback in the background, tracked by the gate.
    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.spawn(task);
    }

    /// Wait for every tracked callback, then accept new ones again.
    pub async fn drain(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
    }
}

/// Error returned by consumer operations.
#[derive(Debug)]
pub struct ConsumerError {
    context: SpanTrace,
    kind: ConsumerErrorKind,
}

/// Consumer errors kind.
#[derive(Debug)]
pub enum ConsumerErrorKind {
    /// A handler was registered under an invalid topic.
    Topic(TopicError),
    /// Two handlers claim the same topic in the same group.
    DuplicateHandler { group: String, topic: String },
    /// `listen` was called before `subscribe`.
    NotSubscribed { group: String },
    /// `listen` is already running for this client.
    AlreadyListening { group: String },
    /// The broker adapter could not connect.
    Connection(tower::BoxError),
    /// The broker refused a commit or reject.
    Settle(tower::BoxError),
    /// The received-message store failed.
    Storage(tower::BoxError),
    /// A listener task panicked or was aborted.
    Task(tokio::task::JoinError),
}

impl ConsumerError {
    pub fn duplicate_handler(group: impl Into<String>, topic: impl Into<String>) -> Self {
        Self::new(ConsumerErrorKind::DuplicateHandler {
            group: group.into(),
            topic: topic.into(),
        })
    }

    pub fn not_subscribed(group: impl Into<String>) -> Self {
        Self::new(ConsumerErrorKind::NotSubscribed {
            group: group.into(),
        })
    }

    pub fn already_listening(group: impl Into<String>) -> Self {
        Self::new(ConsumerErrorKind::AlreadyListening {
            group: group.into(),
        })
    }

    pub fn connection(err: impl Into<tower::BoxError>) -> Self {
        Self::new(ConsumerErrorKind::Connection(err.into()))
    }

    pub fn settle(err: impl Into<tower::BoxError>) -> Self {
        Self::new(ConsumerErrorKind::Settle(err.into()))
    }

    pub fn storage(err: impl Into<tower::BoxError>) -> Self {
        Self::new(ConsumerErrorKind::Storage(err.into()))
    }

    fn new(kind: ConsumerErrorKind) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind,
        }
    }

    pub fn kind(&self) -> &ConsumerErrorKind {
        &self.kind
    }
}

impl fmt::Display for ConsumerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ConsumerErrorKind::Topic(err) => writeln!(f, "Invalid topic: {err}"),
            ConsumerErrorKind::DuplicateHandler { group, topic } => writeln!(
                f,
                "Group '{group}' already has a handler for topic '{topic}'"
            ),
            ConsumerErrorKind::NotSubscribed { group } => {
                writeln!(f, "Group '{group}' must subscribe before listening")
            }
            ConsumerErrorKind::AlreadyListening { group } => {
                writeln!(f, "Group '{group}' is already listening")
            }
            ConsumerErrorKind::Connection(err) => writeln!(f, "Connection error: {err}"),
            ConsumerErrorKind::Settle(err) => writeln!(f, "Settle error: {err}"),
            ConsumerErrorKind::Storage(err) => writeln!(f, "Storage error: {err}"),
            ConsumerErrorKind::Task(err) => writeln!(f, "Listener task failed: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for ConsumerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            ConsumerErrorKind::Topic(err) => Some(err),
            ConsumerErrorKind::Connection(err)
            | ConsumerErrorKind::Settle(err)
            | ConsumerErrorKind::Storage(err) => Some(err.as_ref()),
            ConsumerErrorKind::Task(err) => Some(err),
            ConsumerErrorKind::DuplicateHandler { .. }
            | ConsumerErrorKind::NotSubscribed { .. }
            | ConsumerErrorKind::AlreadyListening { .. } => None,
        }
    }
}

impl From<TopicError> for ConsumerError {
    fn from(err: TopicError) -> Self {
        Self::new(ConsumerErrorKind::Topic(err))
    }
}

impl From<tokio::task::JoinError> for ConsumerError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::new(ConsumerErrorKind::Task(err))
    }
}
