use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
    time::Duration,
};

use chrono::Utc;
use tokio::{task::JoinSet, time::Instant};
use tokio_stream::StreamExt as _;
use tokio_util::sync::CancellationToken;

use crate::{
    TransportMessage,
    consumer::{
        ConsumerClient, ConsumerClientFactory, ConsumerError, ConsumerExecutorDescriptor,
        DeliveryToken, HandlerError, LogMessage, Outcome, message_callback,
    },
    headers::keys,
    options::Options,
    outbox::{
        MediumMessage, QueryMessages, StoreReceived, UpdateMessages,
        lifecycle::{RetryDecision, RetryPolicy},
        poller::PollerBuilder,
    },
    topic,
};

type Routes = BTreeMap<String, HashMap<String, Arc<ConsumerExecutorDescriptor>>>;

/// Registers handlers and runs one consumer client per group.
///
/// Every inbound message is stored as a received record, routed to the
/// handler registered for its group and topic, and settled according to
/// the handler's result:
///
/// - success: the record is `Succeeded` and the delivery committed
/// - failure: the record is rescheduled by the [`RetryPolicy`] and the
///   delivery rejected; the retry sweep executes it again once due
/// - undecodable body or no handler: the record is terminally `Failed` and
///   the delivery committed, since redelivering cannot help
///
/// Generic parameters:
/// - `F`: Consumer client factory
/// - `S`: Store for received records
/// - `HK`: Hook implementation for lifecycle events
pub struct ConsumerRegister<F, S, HK> {
    factory: F,
    store: S,
    options: Options,
    policy: RetryPolicy,
    hook: HK,
    routes: Routes,
}

impl<F, S> ConsumerRegister<F, S, DefaultConsumerHook> {
    /// Create a register; `options` decide group names, topic prefix,
    /// concurrency and retry timings, so they come first.
    pub fn new(factory: F, store: S, options: Options) -> Self {
        Self {
            factory,
            store,
            policy: options.retry_policy(),
            options,
            hook: DefaultConsumerHook,
            routes: Routes::new(),
        }
    }
}

impl<F, S, HK> ConsumerRegister<F, S, HK> {
    /// Replace the consumer hook.
    pub fn with_hook<HK2: ConsumerHook>(self, hook: HK2) -> ConsumerRegister<F, S, HK2> {
        ConsumerRegister {
            factory: self.factory,
            store: self.store,
            options: self.options,
            policy: self.policy,
            hook,
            routes: self.routes,
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Register a handler.
    ///
    /// The configured topic prefix applies unless the descriptor carries
    /// its own. Fails when the resolved topic is not a valid topic name or
    /// when the group already has a handler for it.
    pub fn register(mut self, descriptor: ConsumerExecutorDescriptor) -> Result<Self, ConsumerError> {
        let descriptor = match (&self.options.topic_name_prefix, descriptor.topic_prefix()) {
            (Some(prefix), None) => descriptor.with_topic_prefix(prefix.clone()),
            _ => descriptor,
        };
        topic::validate_topic_name(descriptor.topic())?;

        let group = self.options.group_name(descriptor.group());
        let topic = descriptor.topic().to_owned();
        let handlers = self.routes.entry(group.clone()).or_default();
        if handlers.contains_key(&topic) {
            return Err(ConsumerError::duplicate_handler(group, topic));
        }

        tracing::debug!(group = %group, topic = %topic, handler = descriptor.name(), "Handler registered");
        handlers.insert(topic, Arc::new(descriptor));
        Ok(self)
    }

    /// Registered groups, each with its topics.
    pub fn groups(&self) -> impl Iterator<Item = (&str, Vec<&str>)> {
        self.routes.iter().map(|(group, handlers)| {
            let mut topics: Vec<&str> = handlers.keys().map(String::as_str).collect();
            topics.sort_unstable();
            (group.as_str(), topics)
        })
    }
}

impl<F, S, HK> ConsumerRegister<F, S, HK>
where
    F: ConsumerClientFactory,
    S: StoreReceived + UpdateMessages + QueryMessages + Clone + Send + Sync + 'static,
    <S as StoreReceived>::Error: Into<tower::BoxError>,
    <S as UpdateMessages>::Error: Into<tower::BoxError>,
    <S as QueryMessages>::Error: Into<tower::BoxError>,
    HK: ConsumerHook,
{
    /// Create, subscribe and start one client per group, plus the retry
    /// sweep.
    ///
    /// Subscriptions are in place when this returns. Everything stops once
    /// `cancel` fires; see [`ConsumerHandle::join`].
    #[tracing::instrument(skip_all)]
    pub async fn start(self, cancel: CancellationToken) -> Result<ConsumerHandle<S, HK>, ConsumerError> {
        let dispatcher = Arc::new(Dispatcher {
            store: self.store,
            policy: self.policy,
            hook: self.hook,
            routes: self.routes,
        });
        let mut tasks = JoinSet::new();

        for (group, handlers) in &dispatcher.routes {
            let concurrency = self.options.group_concurrency(group);
            let client = self.factory.create(group, concurrency).await?;

            let sink = dispatcher.clone();
            client.set_log_callback(Arc::new(move |log: LogMessage| sink.hook.on_client_log(&log)));

            let mut topics: Vec<String> = handlers.keys().cloned().collect();
            topics.sort_unstable();
            client.subscribe(topics.clone()).await?;
            dispatcher.hook.on_subscribed(group, &topics);

            let callback = message_callback({
                let dispatcher = dispatcher.clone();
                let group = group.clone();
                move |message: TransportMessage, _token: &DeliveryToken| {
                    let dispatcher = dispatcher.clone();
                    let group = group.clone();
                    async move { dispatcher.consume(&group, message).await }
                }
            });

            let timeout = self.options.listen_timeout();
            let cancel = cancel.clone();
            tasks.spawn(async move { client.listen(timeout, cancel, callback).await });
        }

        let sweeper = dispatcher.clone();
        let batch_size = self.options.batch_size;
        let mut batches = PollerBuilder::new(self.options.polling_interval()).start(cancel, {
            let store = dispatcher.store.clone();
            move || {
                let store = store.clone();
                async move {
                    store
                        .query_due(Utc::now(), batch_size)
                        .await
                        .map_err(Into::into)
                }
            }
        });
        tasks.spawn(async move {
            while let Some(batch) = batches.next().await {
                match batch {
                    Ok(records) => {
                        for record in records {
                            sweeper.retry(record).await;
                        }
                    }
                    Err(err) => sweeper.hook.on_storage_error(err.as_ref()),
                }
            }
            Ok(())
        });

        Ok(ConsumerHandle {
            dispatcher,
            tasks,
            batch_size,
        })
    }

    /// Start and wait until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), ConsumerError> {
        self.start(cancel).await?.join().await
    }
}

/// Running consumers, returned by [`ConsumerRegister::start`].
pub struct ConsumerHandle<S, HK> {
    dispatcher: Arc<Dispatcher<S, HK>>,
    tasks: JoinSet<Result<(), ConsumerError>>,
    batch_size: usize,
}

impl<S, HK> ConsumerHandle<S, HK>
where
    S: UpdateMessages + QueryMessages + Send + Sync,
    <S as UpdateMessages>::Error: Into<tower::BoxError>,
    <S as QueryMessages>::Error: Into<tower::BoxError>,
    HK: ConsumerHook,
{
    /// Execute every received record due now once more, like one tick of
    /// the background sweep. Returns how many records were executed.
    pub async fn retry_due(&self) -> Result<usize, ConsumerError> {
        let records = self
            .dispatcher
            .store
            .query_due(Utc::now(), self.batch_size)
            .await
            .map_err(ConsumerError::storage)?;

        let count = records.len();
        for record in records {
            self.dispatcher.retry(record).await;
        }
        Ok(count)
    }

    /// Wait for every client and the retry sweep to stop. Returns the first
    /// error any of them ended with.
    pub async fn join(mut self) -> Result<(), ConsumerError> {
        let mut result = Ok(());
        while let Some(joined) = self.tasks.join_next().await {
            let outcome = joined.map_err(ConsumerError::from).and_then(|r| r);
            if let Err(err) = outcome {
                tracing::error!(%err, "Consumer task failed");
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }
        result
    }
}

struct Dispatcher<S, HK> {
    store: S,
    policy: RetryPolicy,
    hook: HK,
    routes: Routes,
}

impl<S, HK> Dispatcher<S, HK>
where
    S: UpdateMessages + Send + Sync,
    <S as UpdateMessages>::Error: Into<tower::BoxError>,
    HK: ConsumerHook,
{
    /// First attempt for a freshly received message.
    async fn consume(&self, group: &str, mut message: TransportMessage) -> Outcome
    where
        S: StoreReceived,
        <S as StoreReceived>::Error: Into<tower::BoxError>,
    {
        message.headers.insert(keys::GROUP, group);
        let mut record = MediumMessage::received(message, Utc::now());

        // Stored as Sending so the retry sweep leaves it alone until the
        // lease runs out.
        if let Err(err) = self.policy.begin_attempt(&mut record, Utc::now()) {
            tracing::error!(%err, "Received record rejected by the lifecycle");
            return Outcome::Reject;
        }
        if let Err(err) = self.store.store_received(record.clone()).await {
            let err: tower::BoxError = err.into();
            self.hook.on_storage_error(err.as_ref());
            return Outcome::Reject;
        }

        self.hook.on_message_received(&record);
        self.invoke(record).await
    }

    /// Another attempt for a record picked by the retry sweep.
    async fn retry(&self, mut record: MediumMessage) {
        if let Err(err) = self.policy.begin_attempt(&mut record, Utc::now()) {
            tracing::warn!(id = record.id(), %err, "Skipping record");
            return;
        }
        if self.persist(&record).await {
            self.invoke(record).await;
        }
    }

    #[tracing::instrument(skip_all, fields(id = %record.id(), retries = record.retries()))]
    async fn invoke(&self, mut record: MediumMessage) -> Outcome {
        let group = record.headers().group().unwrap_or_default().to_owned();
        let name = record.headers().name().unwrap_or_default().to_owned();

        let Some(descriptor) = self
            .routes
            .get(&group)
            .and_then(|handlers| handlers.get(&name))
            .cloned()
        else {
            self.hook.on_unroutable(&record, &group);
            let reason = format!("No handler registered for topic {name} in group {group}");
            self.fail_terminal(&mut record, "RoutingFailed", reason).await;
            return Outcome::Commit;
        };

        self.hook.before_invoke(&record, &descriptor);
        let started = Instant::now();
        let result = descriptor
            .handler()
            .handle(&record.to_transport_message())
            .await;
        let now = Utc::now();

        match result {
            Ok(()) => {
                if let Err(err) = self.policy.succeed(&mut record, now) {
                    tracing::error!(%err, "Cannot record handler success");
                }
                self.persist(&record).await;
                self.hook
                    .after_invoke(&record, &descriptor, started.elapsed());
                Outcome::Commit
            }
            Err(err) if err.is_terminal() => {
                self.hook.on_invoke_error(&record, &descriptor, &err);
                self.fail_terminal(&mut record, err.code(), err.description())
                    .await;
                Outcome::Commit
            }
            Err(err) => {
                self.hook.on_invoke_error(&record, &descriptor, &err);
                match self
                    .policy
                    .fail(&mut record, now, err.code(), err.description())
                {
                    Ok(decision) => {
                        self.persist(&record).await;
                        if let RetryDecision::Exhausted { .. } = decision {
                            self.hook.on_failed_threshold(&record);
                        }
                    }
                    Err(err) => tracing::error!(%err, "Cannot record handler failure"),
                }
                Outcome::Reject
            }
        }
    }

    async fn fail_terminal(&self, record: &mut MediumMessage, type_name: &str, reason: String) {
        match self
            .policy
            .fail_terminal(record, Utc::now(), type_name, reason)
        {
            Ok(()) => {
                self.persist(record).await;
            }
            Err(err) => tracing::error!(%err, "Cannot fail record"),
        }
    }

    async fn persist(&self, record: &MediumMessage) -> bool {
        match self.store.update_state(record).await {
            Ok(()) => true,
            Err(err) => {
                let err: tower::BoxError = err.into();
                self.hook.on_storage_error(err.as_ref());
                false
            }
        }
    }
}

/// Hook trait for observing consumer lifecycle events.
///
/// Hooks are invoked synchronously from the receive path and should avoid
/// heavy or blocking work.
pub trait ConsumerHook: Send + Sync + 'static {
    fn on_subscribed(&self, group: &str, topics: &[String]);
    fn on_message_received(&self, record: &MediumMessage);
    fn before_invoke(&self, record: &MediumMessage, descriptor: &ConsumerExecutorDescriptor);
    fn after_invoke(
        &self,
        record: &MediumMessage,
        descriptor: &ConsumerExecutorDescriptor,
        elapsed: Duration,
    );
    fn on_invoke_error(
        &self,
        record: &MediumMessage,
        descriptor: &ConsumerExecutorDescriptor,
        error: &HandlerError,
    );
    /// No handler is registered for the record's group and topic.
    fn on_unroutable(&self, record: &MediumMessage, group: &str);
    /// The record ran out of retries and is now terminally failed.
    fn on_failed_threshold(&self, record: &MediumMessage);
    fn on_client_log(&self, log: &LogMessage);
    fn on_storage_error(&self, error: &(dyn std::error::Error + Send + Sync));
}

/// Default consumer hook implementation.
///
/// Logs lifecycle events using `tracing`.
pub struct DefaultConsumerHook;

impl ConsumerHook for DefaultConsumerHook {
    fn on_subscribed(&self, group: &str, topics: &[String]) {
        tracing::info!(group, ?topics, "Consumer group subscribed");
    }

    fn on_message_received(&self, record: &MediumMessage) {
        tracing::debug!(
            id = record.id(),
            name = record.headers().name(),
            group = record.headers().group(),
            "Message received"
        );
    }

    fn before_invoke(&self, record: &MediumMessage, descriptor: &ConsumerExecutorDescriptor) {
        tracing::debug!(id = record.id(), handler = descriptor.name(), "Invoking handler");
    }

    fn after_invoke(
        &self,
        record: &MediumMessage,
        descriptor: &ConsumerExecutorDescriptor,
        elapsed: Duration,
    ) {
        tracing::info!(
            id = record.id(),
            handler = descriptor.name(),
            ?elapsed,
            "Message consumed"
        );
    }

    fn on_invoke_error(
        &self,
        record: &MediumMessage,
        descriptor: &ConsumerExecutorDescriptor,
        error: &HandlerError,
    ) {
        tracing::error!(
            id = record.id(),
            message_id = record.headers().id(),
            handler = descriptor.name(),
            topic = descriptor.topic(),
            code = error.code(),
            description = %error.description(),
            "Handler failed"
        );
    }

    fn on_unroutable(&self, record: &MediumMessage, group: &str) {
        tracing::error!(
            id = record.id(),
            name = record.headers().name(),
            group,
            "No handler for message"
        );
    }

    fn on_failed_threshold(&self, record: &MediumMessage) {
        tracing::error!(
            id = record.id(),
            retries = record.retries(),
            exception = record.headers().exception(),
            "Message consumption failed after exhausting retries"
        );
    }

    fn on_client_log(&self, log: &LogMessage) {
        tracing::warn!(kind = ?log.kind, group = %log.group, reason = %log.reason, "Consumer client report");
    }

    fn on_storage_error(&self, error: &(dyn std::error::Error + Send + Sync)) {
        tracing::error!(%error, "Received-message store error");
    }
}
