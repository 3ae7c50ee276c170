//! Producer loop for delivering outbox messages through a transport.
//!
//! This module implements the *outbox producer* that:
//!
//! - Polls the outbox for records due for a delivery attempt
//! - Sends them through a [`transport::Transport`]
//! - Records the outcome through the [`RetryPolicy`]: delivered records
//!   become `Succeeded`, failed ones are rescheduled or terminally `Failed`
//! - Exposes lifecycle hooks for observability and customization
//!
//! The producer runs until:
//! - A fatal storage error occurs
//! - A [`CancellationToken`] is triggered
//!
//! Transport failures are never fatal: they are recorded on the record and
//! retried on a later sweep.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_stream::StreamExt as _;
use tokio_util::sync::CancellationToken;
use tower::Service;
use tracing_error::SpanTrace;

use crate::{
    TransportMessage,
    options::Options,
    outbox::{
        self, MediumMessage,
        lifecycle::{LifecycleError, RetryDecision, RetryPolicy},
        poller::PollerBuilder,
    },
    transport::{self, TransportError},
};

/// Outbox producer.
///
/// The `Producer` periodically pulls due records from an outbox and
/// delivers them using a transport.
///
/// Generic parameters:
/// - `D`: Outbox backend
/// - `HK`: Hook implementation for lifecycle events
/// - `T`: Transport service type
pub struct Producer<D, HK, T> {
    outbox: D,
    transport: transport::Transport<T>,
    policy: RetryPolicy,
    hook: HK,
    polling_interval: Duration,
    batch_size: usize,
}

impl<D, T> Producer<D, DefaultProducerHook, T> {
    /// Create a new producer with the default hook and the default options.
    pub fn new(outbox: D, transport: transport::Transport<T>) -> Self {
        let options = Options::default();
        Self {
            outbox,
            transport,
            policy: options.retry_policy(),
            hook: DefaultProducerHook,
            polling_interval: options.polling_interval(),
            batch_size: options.batch_size,
        }
    }
}

impl<D, HK, T> Producer<D, HK, T> {
    /// Replace the producer hook while keeping all other generics unchanged.
    ///
    /// This allows customizing behavior (logging, metrics, alerting, etc.)
    /// without rebuilding the producer.
    pub fn with_hook<HK2: ProducerHook>(self, hook: HK2) -> Producer<D, HK2, T> {
        Producer {
            outbox: self.outbox,
            transport: self.transport,
            policy: self.policy,
            hook,
            polling_interval: self.polling_interval,
            batch_size: self.batch_size,
        }
    }

    /// Take the retry policy, polling interval and batch size from
    /// `options`.
    pub fn with_options(mut self, options: &Options) -> Self {
        self.policy = options.retry_policy();
        self.polling_interval = options.polling_interval();
        self.batch_size = options.batch_size;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }
}

impl<D, HK, T> Producer<D, HK, T>
where
    D: outbox::QueryMessages + outbox::UpdateMessages + Clone + Send + Sync + 'static,
    <D as outbox::QueryMessages>::Error: Into<tower::BoxError>,
    <D as outbox::UpdateMessages>::Error: Into<tower::BoxError>,
    HK: ProducerHook,
    T: Service<TransportMessage> + Clone + Send + 'static,
    T::Future: Send + 'static,
    T::Error: Into<tower::BoxError>,
{
    /// Run the producer loop.
    ///
    /// Every polling interval the due records are fetched and dispatched one
    /// after the other. The loop can be terminated gracefully using the
    /// provided [`CancellationToken`]; a dispatch already started is
    /// finished first.
    #[tracing::instrument(skip_all, fields(broker = %self.transport.address()))]
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), ProducerRunError> {
        self.hook.on_startup();

        let outbox = self.outbox.clone();
        let batch_size = self.batch_size;
        let mut batches = PollerBuilder::new(self.polling_interval).start(cancel.clone(), move || {
            let outbox = outbox.clone();
            async move {
                outbox
                    .query_due(Utc::now(), batch_size)
                    .await
                    .map_err(Into::into)
            }
        });

        while let Some(batch) = batches.next().await {
            match batch {
                Ok(records) => {
                    for record in records {
                        self.dispatch(record).await?;
                    }
                }
                Err(err) => {
                    self.hook.on_outbox_error(err.as_ref());
                    return Err(ProducerRunError::outbox(err));
                }
            }
        }

        self.hook.on_shutdown();
        Ok(())
    }

    /// Dispatch every record due now, once. Returns how many records were
    /// attempted.
    pub async fn dispatch_due(&mut self) -> Result<usize, ProducerRunError> {
        let records = self
            .outbox
            .query_due(Utc::now(), self.batch_size)
            .await
            .map_err(|e| ProducerRunError::outbox(e.into()))?;

        let count = records.len();
        for record in records {
            self.dispatch(record).await?;
        }
        Ok(count)
    }

    /// One delivery attempt for one record.
    #[tracing::instrument(skip_all, fields(id = %record.id(), retries = record.retries()))]
    async fn dispatch(&mut self, mut record: MediumMessage) -> Result<(), ProducerRunError> {
        self.hook.on_next_message(&record);

        self.policy.begin_attempt(&mut record, Utc::now())?;
        self.store(&record).await?;

        let result = self.transport.send(record.to_transport_message()).await;
        let now = Utc::now();

        match result {
            Ok(()) => {
                self.policy.succeed(&mut record, now)?;
                self.store(&record).await?;
                self.hook.on_message_delivered(&record);
            }
            Err(err) => {
                self.hook.on_transport_send_error(&record, &err);
                let decision = self
                    .policy
                    .fail(&mut record, now, err.code(), err.description())?;
                self.store(&record).await?;

                match decision {
                    RetryDecision::Scheduled {
                        next_attempt_at, ..
                    } => self.hook.on_retry_scheduled(&record, next_attempt_at),
                    RetryDecision::Exhausted { .. } => self.hook.on_failed_threshold(&record),
                }
            }
        }

        Ok(())
    }

    async fn store(&self, record: &MediumMessage) -> Result<(), ProducerRunError> {
        self.outbox.update_state(record).await.map_err(|e| {
            let err = e.into();
            self.hook.on_outbox_error(err.as_ref());
            ProducerRunError::outbox(err)
        })
    }
}

/// Error returned when the producer loop fails.
#[derive(Debug)]
pub struct ProducerRunError {
    context: SpanTrace,
    kind: ProducerRunErrorKind,
}

impl ProducerRunError {
    fn outbox(error: tower::BoxError) -> Self {
        ProducerRunError {
            context: SpanTrace::capture(),
            kind: ProducerRunErrorKind::Outbox(error),
        }
    }

    pub fn kind(&self) -> &ProducerRunErrorKind {
        &self.kind
    }
}

/// Classification of producer runtime errors.
#[derive(Debug)]
pub enum ProducerRunErrorKind {
    /// Errors originating from the outbox backend.
    Outbox(tower::BoxError),
    /// A record was handed out in a state it cannot be attempted from.
    Lifecycle(LifecycleError),
}

impl std::fmt::Display for ProducerRunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            ProducerRunErrorKind::Outbox(err) => writeln!(f, "Outbox error: {}", err),
            ProducerRunErrorKind::Lifecycle(err) => writeln!(f, "Lifecycle error: {}", err),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for ProducerRunError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            ProducerRunErrorKind::Outbox(err) => Some(err.as_ref()),
            ProducerRunErrorKind::Lifecycle(err) => Some(err),
        }
    }
}

impl From<LifecycleError> for ProducerRunError {
    fn from(err: LifecycleError) -> Self {
        ProducerRunError {
            context: SpanTrace::capture(),
            kind: ProducerRunErrorKind::Lifecycle(err),
        }
    }
}

/// Hook trait for observing producer lifecycle events.
///
/// Hooks are invoked synchronously and should avoid heavy or blocking work.
/// Typical use cases include logging, metrics, and alerting.
pub trait ProducerHook: Send + Sync {
    fn on_startup(&self);
    fn on_shutdown(&self);
    fn on_next_message(&self, record: &MediumMessage);
    fn on_message_delivered(&self, record: &MediumMessage);
    fn on_transport_send_error(&self, record: &MediumMessage, error: &TransportError);
    fn on_retry_scheduled(&self, record: &MediumMessage, next_attempt_at: DateTime<Utc>);
    /// The record ran out of retries and is now terminally failed.
    fn on_failed_threshold(&self, record: &MediumMessage);
    fn on_outbox_error(&self, error: &(dyn std::error::Error + Send + Sync));
}

/// Default producer hook implementation.
///
/// Logs lifecycle events using `tracing`.
pub struct DefaultProducerHook;

impl ProducerHook for DefaultProducerHook {
    fn on_startup(&self) {
        tracing::info!("Producer is starting up");
    }

    fn on_shutdown(&self) {
        tracing::info!("Producer is shutting down");
    }

    fn on_next_message(&self, record: &MediumMessage) {
        tracing::debug!(id = record.id(), name = record.headers().name(), "Dispatching message");
    }

    fn on_message_delivered(&self, record: &MediumMessage) {
        tracing::info!(id = record.id(), "Message delivered successfully");
    }

    fn on_transport_send_error(&self, record: &MediumMessage, error: &TransportError) {
        tracing::warn!(
            id = record.id(),
            code = error.code(),
            description = %error.description(),
            "Error sending message"
        );
    }

    fn on_retry_scheduled(&self, record: &MediumMessage, next_attempt_at: DateTime<Utc>) {
        tracing::info!(
            id = record.id(),
            retries = record.retries(),
            %next_attempt_at,
            "Message delivery rescheduled"
        );
    }

    fn on_failed_threshold(&self, record: &MediumMessage) {
        tracing::error!(
            id = record.id(),
            retries = record.retries(),
            exception = record.headers().exception(),
            "Message delivery failed after exhausting retries"
        );
    }

    fn on_outbox_error(&self, error: &(dyn std::error::Error + Send + Sync)) {
        tracing::error!(%error, "Outbox error");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use super::*;
    use crate::{
        Message, Outbox,
        broker::InMemoryQueue,
        headers::keys,
        outbox::{
            QueryMessages as _, UpdateMessages as _,
            inmemory::InMemoryOutbox,
            lifecycle::{FixedBackoff, MessageState},
        },
        transport::{InMemory, Transport},
    };

    #[derive(Clone, Default)]
    struct CountingHook {
        delivered: Arc<AtomicUsize>,
        send_errors: Arc<AtomicUsize>,
        exhausted: Arc<AtomicUsize>,
    }

    impl ProducerHook for CountingHook {
        fn on_startup(&self) {}
        fn on_shutdown(&self) {}
        fn on_next_message(&self, _record: &MediumMessage) {}
        fn on_message_delivered(&self, _record: &MediumMessage) {
            self.delivered.fetch_add(1, Ordering::SeqCst);
        }
        fn on_transport_send_error(&self, _record: &MediumMessage, _error: &TransportError) {
            self.send_errors.fetch_add(1, Ordering::SeqCst);
        }
        fn on_retry_scheduled(&self, _record: &MediumMessage, _next_attempt_at: DateTime<Utc>) {}
        fn on_failed_threshold(&self, _record: &MediumMessage) {
            self.exhausted.fetch_add(1, Ordering::SeqCst);
        }
        fn on_outbox_error(&self, _error: &(dyn std::error::Error + Send + Sync)) {}
    }

    /// Fails every `update_state` once `fail_from` writes went through.
    #[derive(Clone)]
    struct FlakyStore {
        inner: InMemoryOutbox,
        writes: Arc<AtomicUsize>,
        fail_from: usize,
    }

    #[async_trait::async_trait]
    impl outbox::QueryMessages for FlakyStore {
        type Error = tower::BoxError;

        async fn query_due(
            &self,
            now: DateTime<Utc>,
            batch_size: usize,
        ) -> Result<Vec<MediumMessage>, Self::Error> {
            Ok(self.inner.query_due(now, batch_size).await?)
        }
    }

    #[async_trait::async_trait]
    impl outbox::UpdateMessages for FlakyStore {
        type Error = tower::BoxError;

        async fn update_state(&self, msg: &MediumMessage) -> Result<(), Self::Error> {
            if self.writes.fetch_add(1, Ordering::SeqCst) >= self.fail_from {
                return Err("storage unavailable".into());
            }
            Ok(self.inner.update_state(msg).await?)
        }
    }

    async fn publish(store: &InMemoryOutbox, name: &str) -> String {
        Outbox::new(store.clone())
            .publish_messages([Message::builder(name, "hi").build()], &mut ())
            .await
            .unwrap()
            .remove(0)
    }

    #[tokio::test]
    async fn delivered_records_succeed_and_are_not_dispatched_again() {
        let store = InMemoryOutbox::default();
        let queue = Arc::new(InMemoryQueue::new());
        let mut g1 = queue.register_client("g1", 8);
        queue.subscribe("g1", ["demo.ping"]);
        let hook = CountingHook::default();

        let id = publish(&store, "demo.ping").await;
        let mut producer =
            Producer::new(store.clone(), Transport::new(InMemory::new(queue))).with_hook(hook.clone());

        assert_eq!(producer.dispatch_due().await.unwrap(), 1);
        assert_eq!(producer.dispatch_due().await.unwrap(), 0);

        let record = store.get(&id).await.unwrap();
        assert_eq!(record.state(), MessageState::Succeeded);
        assert!(record.expires_at().is_some());
        assert_eq!(hook.delivered.load(Ordering::SeqCst), 1);

        let received = g1.recv().await.unwrap();
        assert_eq!(received.headers.id(), Some(id.as_str()));
        assert_eq!(received.message.as_bytes(), br#""hi""#);
    }

    #[tokio::test]
    async fn instance_id_and_trace_parent_reach_the_broker() {
        let store = InMemoryOutbox::default();
        let queue = Arc::new(InMemoryQueue::new());
        let mut g1 = queue.register_client("g1", 8);
        queue.subscribe("g1", ["demo.ping"]);

        let traceparent = "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01";
        Outbox::new(store.clone())
            .with_options(&Options::default().with_instance_id("node-1"))
            .publish_messages(
                [Message::builder("demo.ping", "hi").trace_parent(traceparent).build()],
                &mut (),
            )
            .await
            .unwrap();

        let mut producer = Producer::new(store, Transport::new(InMemory::new(queue)));
        producer.dispatch_due().await.unwrap();

        let received = g1.recv().await.unwrap();
        assert_eq!(received.headers.get(keys::EXECUTION_INSTANCE_ID), Some("node-1"));
        assert_eq!(received.headers.get(keys::TRACE_PARENT), Some(traceparent));
    }

    #[tokio::test]
    async fn routing_failure_is_recorded_and_rescheduled() {
        let store = InMemoryOutbox::default();
        let queue = Arc::new(InMemoryQueue::new());
        let id = publish(&store, "demo.work").await;

        let mut producer = Producer::new(store.clone(), Transport::new(InMemory::new(queue)));
        producer.dispatch_due().await.unwrap();

        let record = store.get(&id).await.unwrap();
        assert_eq!(record.state(), MessageState::Pending);
        assert_eq!(record.retries(), 1);
        assert_eq!(
            record.headers().exception(),
            Some(
                "RoutingFailed-->Cannot find the corresponding group for demo.work. Have you subscribed?"
            )
        );
        assert!(record.next_attempt_at().is_some());
    }

    #[tokio::test]
    async fn subscribed_group_without_a_client_is_not_a_delivery() {
        let store = InMemoryOutbox::default();
        let queue = Arc::new(InMemoryQueue::new());
        let gone = queue.register_client("g1", 8);
        queue.subscribe("g1", ["demo.ping"]);
        drop(gone);
        let id = publish(&store, "demo.ping").await;

        let mut producer = Producer::new(store.clone(), Transport::new(InMemory::new(queue.clone())))
            .with_retry_policy(RetryPolicy::new(FixedBackoff(Duration::ZERO)));
        producer.dispatch_due().await.unwrap();

        let record = store.get(&id).await.unwrap();
        assert_eq!(record.state(), MessageState::Pending);
        assert_eq!(record.retries(), 1);
        assert!(record.headers().exception().is_some_and(|e| e.starts_with("RoutingFailed-->")));

        let mut g1 = queue.register_client("g1", 8);
        producer.dispatch_due().await.unwrap();

        assert_eq!(store.get(&id).await.unwrap().state(), MessageState::Succeeded);
        assert_eq!(g1.recv().await.unwrap().headers.id(), Some(id.as_str()));
    }

    #[tokio::test]
    async fn retries_stop_at_the_failed_retry_count() {
        let store = InMemoryOutbox::default();
        let queue = Arc::new(InMemoryQueue::new());
        let hook = CountingHook::default();
        let id = publish(&store, "demo.work").await;

        let mut producer = Producer::new(store.clone(), Transport::new(InMemory::new(queue)))
            .with_retry_policy(RetryPolicy::new(FixedBackoff(Duration::ZERO)).with_failed_retry_count(3))
            .with_hook(hook.clone());

        for _ in 0..5 {
            producer.dispatch_due().await.unwrap();
        }

        let record = store.get(&id).await.unwrap();
        assert_eq!(record.state(), MessageState::Failed);
        assert_eq!(record.retries(), 3);
        assert_eq!(hook.send_errors.load(Ordering::SeqCst), 3);
        assert_eq!(hook.exhausted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn record_left_sending_is_attempted_again_after_its_lease() {
        let store = InMemoryOutbox::default();
        let queue = Arc::new(InMemoryQueue::new());
        let mut g1 = queue.register_client("g1", 8);
        queue.subscribe("g1", ["demo.ping"]);
        let id = publish(&store, "demo.ping").await;

        let flaky = FlakyStore {
            inner: store.clone(),
            writes: Arc::new(AtomicUsize::new(0)),
            fail_from: 1,
        };
        let policy = RetryPolicy::default().with_in_flight_lease(Duration::ZERO);
        let mut producer = Producer::new(flaky, Transport::new(InMemory::new(queue.clone())))
            .with_retry_policy(policy.clone());

        assert!(producer.dispatch_due().await.is_err());
        assert_eq!(store.get(&id).await.unwrap().state(), MessageState::Sending);
        assert!(g1.recv().await.is_some());

        let mut producer = Producer::new(store.clone(), Transport::new(InMemory::new(queue)))
            .with_retry_policy(policy);
        assert_eq!(producer.dispatch_due().await.unwrap(), 1);

        let record = store.get(&id).await.unwrap();
        assert_eq!(record.state(), MessageState::Succeeded);
        assert_eq!(g1.recv().await.unwrap().headers.id(), Some(id.as_str()));
    }

    #[tokio::test]
    async fn sending_record_within_its_lease_is_not_dispatched() {
        let store = InMemoryOutbox::default();
        let queue = Arc::new(InMemoryQueue::new());
        let id = publish(&store, "demo.ping").await;

        let mut record = store.get(&id).await.unwrap();
        RetryPolicy::default().begin_attempt(&mut record, Utc::now()).unwrap();
        store.update_state(&record).await.unwrap();

        let mut producer = Producer::new(store.clone(), Transport::new(InMemory::new(queue)));
        assert_eq!(producer.dispatch_due().await.unwrap(), 0);
        assert_eq!(store.get(&id).await.unwrap().state(), MessageState::Sending);
    }

    #[tokio::test(start_paused = true)]
    async fn run_delivers_until_cancelled() {
        let store = InMemoryOutbox::default();
        let queue = Arc::new(InMemoryQueue::new());
        let mut g1 = queue.register_client("g1", 8);
        queue.subscribe("g1", ["demo.ping"]);
        let id = publish(&store, "demo.ping").await;

        let cancel = CancellationToken::new();
        let producer = Producer::new(store.clone(), Transport::new(InMemory::new(queue)))
            .with_options(&Options::default().with_polling_interval(Duration::from_millis(50)));
        let handle = tokio::spawn(producer.run(cancel.clone()));

        let received = g1.recv().await.unwrap();
        assert_eq!(received.headers.id(), Some(id.as_str()));

        cancel.cancel();
        handle.await.unwrap().unwrap();
        assert_eq!(store.get(&id).await.unwrap().state(), MessageState::Succeeded);
    }
}
