//! Outbox abstractions and backend drivers.
//!
//! This module implements the *outbox pattern*, providing a reliable way to
//! persist messages before they are delivered asynchronously by a producer.
//!
//! The outbox is responsible for **durability**, while delivery concerns are
//! delegated to the producer and transport layers and state changes to the
//! [`lifecycle`].
//!
//! ## Responsibilities
//!
//! - Persist messages atomically with application state
//! - Hand out records that are due for a delivery attempt
//! - Persist the state decided by the lifecycle after each attempt
//! - Remove records once they expired
//!
//! ## Components
//!
//! - [`Outbox`]: High-level façade over an outbox backend
//! - [`MediumMessage`]: One stored record
//! - [`InsertMessages`], [`StoreReceived`], [`UpdateMessages`],
//!   [`QueryMessages`], [`RemoveMessages`], [`MessageStatistics`]: backend
//!   traits
//!
//! The [`inmemory`] backend is provided for tests and local pipelines;
//! durable backends implement the same traits.

pub mod inmemory;
pub mod lifecycle;
pub mod poller;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::instrument;
use tracing_error::SpanTrace;

use crate::{
    Envelope, Message, TransportMessage,
    headers::{Headers, keys},
    options::Options,
    transport::RawPayload,
};
use lifecycle::MessageState;

/// Error returned by outbox operations.
///
/// Wraps the underlying cause and captures a tracing span backtrace for
/// improved diagnostics.
#[derive(Debug)]
pub struct OutboxError {
    context: SpanTrace,
    kind: OutboxErrorKind,
}

/// Outbox errors kind.
#[derive(Debug)]
pub enum OutboxErrorKind {
    /// The storage backend failed.
    Backend(tower::BoxError),
    /// The message value could not be serialized.
    Serde(serde_json::Error),
    /// The message lacks a header the outbox needs.
    MissingHeader(&'static str),
}

impl OutboxError {
    /// Create a backend-related outbox error.
    pub fn backend(err: impl Into<tower::BoxError>) -> Self {
        Self::new(OutboxErrorKind::Backend(err.into()))
    }

    fn new(kind: OutboxErrorKind) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind,
        }
    }

    pub fn kind(&self) -> &OutboxErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for OutboxError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            OutboxErrorKind::Backend(err) => writeln!(f, "Backend error: {err}"),
            OutboxErrorKind::Serde(err) => writeln!(f, "Serde error: {err}"),
            OutboxErrorKind::MissingHeader(key) => writeln!(f, "Missing header: {key}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for OutboxError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            OutboxErrorKind::Backend(err) => Some(err.as_ref()),
            OutboxErrorKind::Serde(err) => Some(err),
            OutboxErrorKind::MissingHeader(_) => None,
        }
    }
}

impl From<serde_json::Error> for OutboxError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(OutboxErrorKind::Serde(err))
    }
}

/// Record stored in the outbox.
///
/// Keeps the headers of the original message together with its serialized
/// value, plus the delivery bookkeeping owned by the
/// [`lifecycle`]. Only [`lifecycle::RetryPolicy`] changes the bookkeeping;
/// backends persist it as they receive it (the type is serde-serializable
/// for that purpose).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediumMessage {
    pub(crate) id: String,
    pub(crate) headers: Headers,
    pub(crate) content: RawPayload,
    pub(crate) added: DateTime<Utc>,
    pub(crate) expires_at: Option<DateTime<Utc>>,
    pub(crate) retries: u32,
    pub(crate) state: MessageState,
    pub(crate) next_attempt_at: Option<DateTime<Utc>>,
}

impl MediumMessage {
    /// Create a record for a message entering the pipeline.
    ///
    /// The record starts `Delayed` when the message carries a delay-time in
    /// the future, `Pending` otherwise.
    pub fn new(message: TransportMessage, now: DateTime<Utc>) -> Result<Self, OutboxError> {
        let id = message
            .headers
            .id()
            .ok_or_else(|| OutboxError::new(OutboxErrorKind::MissingHeader(keys::MESSAGE_ID)))?
            .to_owned();

        let (state, next_attempt_at) = match message.headers.delay_time() {
            Some(due) if due > now => (MessageState::Delayed, Some(due)),
            _ => (MessageState::Pending, None),
        };

        Ok(Self {
            id,
            headers: message.headers,
            content: message.message,
            added: now,
            expires_at: None,
            retries: 0,
            state,
            next_attempt_at,
        })
    }

    /// Create a record for a message received by a consumer group.
    ///
    /// The same message may be received by many groups and more than once
    /// by one group, so the record gets an id of its own. The delay-time of
    /// the message does not apply on this side.
    pub fn received(message: TransportMessage, now: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            headers: message.headers,
            content: message.message,
            added: now,
            expires_at: None,
            retries: 0,
            state: MessageState::Pending,
            next_attempt_at: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn content(&self) -> &RawPayload {
        &self.content
    }

    pub fn added(&self) -> DateTime<Utc> {
        self.added
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn state(&self) -> MessageState {
        self.state
    }

    pub fn next_attempt_at(&self) -> Option<DateTime<Utc>> {
        self.next_attempt_at
    }

    /// Whether a delivery attempt may start at `now`.
    ///
    /// `Sending` records are due only once their in-flight lease expired.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.state {
            MessageState::Pending | MessageState::Delayed => {
                self.next_attempt_at.is_none_or(|at| at <= now)
            }
            MessageState::Sending => self.lease_expired(now),
            MessageState::Succeeded | MessageState::Failed => false,
        }
    }

    pub(crate) fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.state == MessageState::Sending && self.next_attempt_at.is_some_and(|at| at <= now)
    }

    /// Whether a terminal record may be deleted at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.state.is_terminal() && self.expires_at.is_some_and(|at| at <= now)
    }

    /// Rebuild the wire envelope; redeliveries use the same envelope as the
    /// first attempt.
    pub fn to_transport_message(&self) -> TransportMessage {
        Envelope {
            headers: self.headers.clone(),
            message: self.content.clone(),
        }
    }
}

/// High-level façade over an outbox backend.
///
/// `Outbox` provides a stable, ergonomic API for publishing messages while
/// delegating persistence to the underlying backend.
pub struct Outbox<D> {
    driver: D,
    topic_prefix: Option<String>,
    instance_id: String,
}

impl<D> Outbox<D>
where
    D: Clone,
{
    /// Create a new outbox backed by the given backend implementation.
    pub fn new(driver: D) -> Self {
        Self {
            driver,
            topic_prefix: None,
            instance_id: Options::default().instance_id().to_owned(),
        }
    }

    /// Apply the publishing side of `options` (the topic prefix and the
    /// instance id).
    pub fn with_options(mut self, options: &Options) -> Self {
        self.topic_prefix = options.topic_name_prefix.clone();
        self.instance_id = options.instance_id().to_owned();
        self
    }

    /// Publish messages into the outbox.
    ///
    /// Messages are serialized and inserted into the outbox as `Pending`
    /// (or `Delayed`) records but **not** sent immediately. Delivery is
    /// handled asynchronously by a producer.
    ///
    /// This method is typically called within the same transaction that
    /// mutates application state. Returns the ids of the stored records.
    #[instrument(skip(self, msgs, tx))]
    pub async fn publish_messages<M>(
        &self,
        msgs: impl IntoIterator<Item = impl Into<Message<M>>>,
        tx: &mut D::Transaction<'_>,
    ) -> Result<Vec<String>, OutboxError>
    where
        M: Serialize,
        D: InsertMessages,
        <D as InsertMessages>::Error: Into<tower::BoxError>,
    {
        let now = Utc::now();
        let mut records = Vec::new();

        for msg in msgs {
            let msg: Message<M> = msg.into();
            let content = serde_json::to_vec(&msg.message)?;
            let mut headers = msg.headers;

            let name = headers
                .name()
                .ok_or_else(|| OutboxError::new(OutboxErrorKind::MissingHeader(keys::MESSAGE_NAME)))?;
            let topic = crate::topic::apply_prefix(self.topic_prefix.as_deref(), name);
            headers.insert(keys::MESSAGE_NAME, topic);
            if !headers.contains_key(keys::EXECUTION_INSTANCE_ID) {
                headers.insert(keys::EXECUTION_INSTANCE_ID, self.instance_id.as_str());
            }

            let envelope = Envelope {
                headers,
                message: RawPayload::from(content),
            };
            records.push(MediumMessage::new(envelope, now)?);
        }

        let ids: Vec<String> = records.iter().map(|r| r.id.clone()).collect();
        self.driver
            .insert_messages(records, tx)
            .await
            .map_err(OutboxError::backend)?;

        tracing::debug!(count = ids.len(), "Messages stored in outbox");
        Ok(ids)
    }
}

/// Trait for inserting messages into the outbox.
///
/// Implementations must ensure durability and transactional guarantees.
#[async_trait::async_trait]
pub trait InsertMessages {
    /// Backend-specific error type.
    type Error;
    /// Transaction type used for atomic insertion.
    type Transaction<'a>;

    /// Insert a batch of records into the outbox.
    async fn insert_messages(
        &self,
        msgs: Vec<MediumMessage>,
        tx: &mut Self::Transaction<'_>,
    ) -> Result<(), Self::Error>;
}

/// Trait for storing records of messages received by consumer groups.
///
/// Received records live in their own store, next to but apart from the
/// published ones, and go through the same lifecycle.
#[async_trait::async_trait]
pub trait StoreReceived {
    /// Backend-specific error type.
    type Error;

    async fn store_received(&self, msg: MediumMessage) -> Result<(), Self::Error>;
}

/// Trait for persisting state transitions.
#[async_trait::async_trait]
pub trait UpdateMessages {
    /// Backend-specific error type.
    type Error;

    /// Overwrite the stored bookkeeping of `msg` (state, retries, timers,
    /// headers).
    async fn update_state(&self, msg: &MediumMessage) -> Result<(), Self::Error>;
}

/// Trait for fetching records due for a delivery attempt.
#[async_trait::async_trait]
pub trait QueryMessages {
    /// Backend-specific error type.
    type Error;

    /// Up to `batch_size` records that are due at `now`, oldest first.
    async fn query_due(
        &self,
        now: DateTime<Utc>,
        batch_size: usize,
    ) -> Result<Vec<MediumMessage>, Self::Error>;
}

/// Trait for removing records from the outbox.
#[async_trait::async_trait]
pub trait RemoveMessages {
    /// Backend-specific error type.
    type Error;

    /// Remove the records with the given ids.
    async fn remove_messages(&self, ids: Vec<String>) -> Result<(), Self::Error>;

    /// Remove up to `batch_size` terminal records expired at `now`; returns
    /// how many were removed.
    async fn remove_expired(
        &self,
        now: DateTime<Utc>,
        batch_size: usize,
    ) -> Result<usize, Self::Error>;
}

/// Number of records per state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Statistics {
    pub delayed: usize,
    pub pending: usize,
    pub sending: usize,
    pub succeeded: usize,
    pub failed: usize,
}

impl Statistics {
    pub(crate) fn count(&mut self, state: MessageState) {
        match state {
            MessageState::Delayed => self.delayed += 1,
            MessageState::Pending => self.pending += 1,
            MessageState::Sending => self.sending += 1,
            MessageState::Succeeded => self.succeeded += 1,
            MessageState::Failed => self.failed += 1,
        }
    }
}

/// Read-only snapshots for dashboards.
#[async_trait::async_trait]
pub trait MessageStatistics {
    /// Backend-specific error type.
    type Error;

    async fn statistics(&self) -> Result<Statistics, Self::Error>;
}
