use std::{
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    TransportMessage,
    broker::{InMemoryQueue, RegistrationId},
    consumer::{
        ConcurrencyGate, ConsumerClient, ConsumerClientFactory, ConsumerError, DeliveryToken,
        LogCallback, LogKind, LogMessage, MessageCallback, Outcome, default_log_callback,
    },
    options::Options,
    transport::BrokerAddress,
};

/// Builds [`InMemoryConsumerClient`]s attached to one [`InMemoryQueue`].
#[derive(Clone)]
pub struct InMemoryConsumerClientFactory {
    queue: Arc<InMemoryQueue>,
    capacity: usize,
}

impl InMemoryConsumerClientFactory {
    /// Factory with the default queue capacity.
    pub fn new(queue: Arc<InMemoryQueue>) -> Self {
        Self::with_options(queue, &Options::default())
    }

    /// Factory sized by `options.queue_capacity`.
    pub fn with_options(queue: Arc<InMemoryQueue>, options: &Options) -> Self {
        Self {
            queue,
            capacity: options.queue_capacity,
        }
    }

    /// Capacity of each group's delivery channel.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }
}

#[async_trait::async_trait]
impl ConsumerClientFactory for InMemoryConsumerClientFactory {
    type Client = InMemoryConsumerClient;

    async fn create(
        &self,
        group: &str,
        group_concurrency: usize,
    ) -> Result<InMemoryConsumerClient, ConsumerError> {
        Ok(InMemoryConsumerClient::new(
            self.queue.clone(),
            group,
            group_concurrency,
            self.capacity,
        ))
    }
}

/// Consumer client of the in-memory broker.
///
/// Registers the group's delivery channel on creation and removes it when
/// the last clone is dropped, unless a newer client registered the group
/// since. Clones share the channel, the gate and the counters.
#[derive(Clone)]
pub struct InMemoryConsumerClient {
    inner: Arc<Inner>,
}

struct Inner {
    group: String,
    queue: Arc<InMemoryQueue>,
    registration: RegistrationId,
    receiver: tokio::sync::Mutex<Option<mpsc::Receiver<TransportMessage>>>,
    gate: ConcurrencyGate,
    subscribed: AtomicBool,
    next_tag: AtomicU64,
    committed: AtomicU64,
    rejected: AtomicU64,
    log: Mutex<LogCallback>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.queue.unregister(&self.group, self.registration);
    }
}

impl InMemoryConsumerClient {
    pub fn new(
        queue: Arc<InMemoryQueue>,
        group: &str,
        group_concurrency: usize,
        capacity: usize,
    ) -> Self {
        let (registration, receiver) = queue.register(group, capacity);
        Self {
            inner: Arc::new(Inner {
                group: group.to_owned(),
                queue,
                registration,
                receiver: tokio::sync::Mutex::new(Some(receiver)),
                gate: ConcurrencyGate::new(group_concurrency),
                subscribed: AtomicBool::new(false),
                next_tag: AtomicU64::new(1),
                committed: AtomicU64::new(0),
                rejected: AtomicU64::new(0),
                log: Mutex::new(default_log_callback()),
            }),
        }
    }

    /// Deliveries committed so far.
    pub fn committed(&self) -> u64 {
        self.inner.committed.load(Ordering::SeqCst)
    }

    /// Deliveries rejected so far.
    pub fn rejected(&self) -> u64 {
        self.inner.rejected.load(Ordering::SeqCst)
    }

    /// Free concurrency slots; always `0` for a sequential client.
    pub fn available_slots(&self) -> usize {
        self.inner.gate.available()
    }

    fn log(&self, kind: LogKind, reason: String) {
        let callback = self
            .inner
            .log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        callback(LogMessage {
            kind,
            group: self.inner.group.clone(),
            reason,
        });
    }

    async fn settle(&self, outcome: Outcome, token: DeliveryToken) {
        let tag = token.tag();
        let result = match outcome {
            Outcome::Commit => self.commit(token).await,
            Outcome::Reject => self.reject(token).await,
        };
        if let Err(err) = result {
            self.log(
                LogKind::SettleFailed,
                format!("Delivery {tag} could not be settled: {err}"),
            );
        }
    }
}

#[async_trait::async_trait]
impl ConsumerClient for InMemoryConsumerClient {
    fn group(&self) -> &str {
        &self.inner.group
    }

    fn address(&self) -> BrokerAddress {
        BrokerAddress::new("inmemory", None)
    }

    fn set_log_callback(&self, callback: LogCallback) {
        *self.inner.log.lock().unwrap_or_else(PoisonError::into_inner) = callback;
    }

    async fn subscribe(&self, topics: Vec<String>) -> Result<(), ConsumerError> {
        self.inner.queue.subscribe(&self.inner.group, topics);
        self.inner.subscribed.store(true, Ordering::SeqCst);
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(group = %self.inner.group))]
    async fn listen(
        &self,
        timeout: Duration,
        cancel: CancellationToken,
        callback: MessageCallback,
    ) -> Result<(), ConsumerError> {
        if !self.inner.subscribed.load(Ordering::SeqCst) {
            return Err(ConsumerError::not_subscribed(&self.inner.group));
        }

        let mut receiver = self
            .inner
            .receiver
            .lock()
            .await
            .take()
            .ok_or_else(|| ConsumerError::already_listening(&self.inner.group))?;

        let gate = &self.inner.gate;
        tracing::debug!(concurrency = gate.limit(), "Listening");

        loop {
            let slot = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                slot = gate.reserve() => slot,
            };

            let message = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                received = tokio::time::timeout(timeout, receiver.recv()) => match received {
                    Ok(Some(message)) => message,
                    Ok(None) => {
                        self.log(LogKind::Disconnected, "Delivery channel closed".to_owned());
                        break;
                    }
                    Err(_) => continue,
                },
            };

            if let Some(key) = message.headers.missing_required() {
                self.log(
                    LogKind::InvalidMessage,
                    format!("Skipping message without required header '{key}'"),
                );
                continue;
            }

            let tag = self.inner.next_tag.fetch_add(1, Ordering::SeqCst);
            let token = DeliveryToken::new(self.inner.group.as_str(), tag, slot);
            let pending = callback(message, &token);

            if gate.is_sequential() {
                let outcome = pending.await;
                self.settle(outcome, token).await;
            } else {
                let client = self.clone();
                gate.spawn(async move {
                    let outcome = pending.await;
                    client.settle(outcome, token).await;
                });
            }
        }

        gate.drain().await;
        *self.inner.receiver.lock().await = Some(receiver);
        tracing::debug!("Stopped listening");
        Ok(())
    }

    async fn commit(&self, token: DeliveryToken) -> Result<(), ConsumerError> {
        tracing::trace!(group = %token.group(), tag = token.tag(), "Commit");
        token.release();
        self.inner.committed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn reject(&self, token: DeliveryToken) -> Result<(), ConsumerError> {
        tracing::trace!(group = %token.group(), tag = token.tag(), "Reject");
        token.release();
        self.inner.rejected.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::{Message, consumer::message_callback, transport::RawPayload};

    fn ping(body: &str) -> TransportMessage {
        Message::builder("demo.ping", RawPayload::from(body)).build()
    }

    async fn wait_for(client: &InMemoryConsumerClient, settled: u64) {
        while client.committed() + client.rejected() < settled {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    fn commit_all() -> MessageCallback {
        message_callback(|_message, _token| async { Outcome::Commit })
    }

    #[tokio::test(start_paused = true)]
    async fn concurrency_never_exceeds_the_group_limit() {
        let queue = Arc::new(InMemoryQueue::new());
        let client = InMemoryConsumerClient::new(queue.clone(), "g1", 3, 16);
        client.subscribe(vec!["demo.ping".to_owned()]).await.unwrap();

        for i in 0..10 {
            queue.send(ping(&i.to_string())).await.unwrap();
        }

        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (current, max) = (running.clone(), peak.clone());
        let callback = message_callback(move |_message, _token| {
            let (current, max) = (current.clone(), max.clone());
            async move {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                max.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                current.fetch_sub(1, Ordering::SeqCst);
                Outcome::Commit
            }
        });

        let cancel = CancellationToken::new();
        let listener = tokio::spawn({
            let client = client.clone();
            let cancel = cancel.clone();
            async move { client.listen(Duration::from_millis(100), cancel, callback).await }
        });

        wait_for(&client, 10).await;
        cancel.cancel();
        listener.await.unwrap().unwrap();

        assert_eq!(client.committed(), 10);
        assert_eq!(peak.load(Ordering::SeqCst), 3);
        assert_eq!(client.available_slots(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn sequential_client_finishes_one_message_before_reading_the_next() {
        let queue = Arc::new(InMemoryQueue::new());
        let client = InMemoryConsumerClient::new(queue.clone(), "g1", 0, 16);
        client.subscribe(vec!["demo.ping".to_owned()]).await.unwrap();
        for i in 0..3 {
            queue.send(ping(&i.to_string())).await.unwrap();
        }

        let order = Arc::new(Mutex::new(Vec::new()));
        let seen = order.clone();
        let callback = message_callback(move |message, token| {
            let seen = seen.clone();
            let tag = token.tag();
            async move {
                let body = String::from_utf8(message.message.into_inner()).unwrap();
                seen.lock().unwrap().push(format!("start {body}"));
                tokio::time::sleep(Duration::from_millis(10)).await;
                seen.lock().unwrap().push(format!("end {body}"));
                if tag == 2 {
                    Outcome::Reject
                } else {
                    Outcome::Commit
                }
            }
        });

        let cancel = CancellationToken::new();
        let listener = tokio::spawn({
            let client = client.clone();
            let cancel = cancel.clone();
            async move { client.listen(Duration::from_millis(100), cancel, callback).await }
        });

        wait_for(&client, 3).await;
        cancel.cancel();
        listener.await.unwrap().unwrap();

        assert_eq!(
            *order.lock().unwrap(),
            ["start 0", "end 0", "start 1", "end 1", "start 2", "end 2"]
        );
        assert_eq!(client.committed(), 2);
        assert_eq!(client.rejected(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_messages_are_reported_and_skipped() {
        let queue = Arc::new(InMemoryQueue::new());
        let client = InMemoryConsumerClient::new(queue.clone(), "g1", 0, 16);
        client.subscribe(vec!["demo.ping".to_owned()]).await.unwrap();

        let reports = Arc::new(Mutex::new(Vec::new()));
        let sink = reports.clone();
        client.set_log_callback(Arc::new(move |log: LogMessage| {
            sink.lock().unwrap().push(log.kind);
        }));

        let mut broken = ping("broken");
        broken.headers.remove(crate::headers::keys::MESSAGE_ID);
        queue.send(broken).await.unwrap();
        queue.send(ping("fine")).await.unwrap();

        let cancel = CancellationToken::new();
        let listener = tokio::spawn({
            let client = client.clone();
            let cancel = cancel.clone();
            async move {
                client
                    .listen(Duration::from_millis(100), cancel, commit_all())
                    .await
            }
        });

        wait_for(&client, 1).await;
        cancel.cancel();
        listener.await.unwrap().unwrap();

        assert_eq!(*reports.lock().unwrap(), [LogKind::InvalidMessage]);
        assert_eq!(client.committed(), 1);
    }

    #[tokio::test]
    async fn listen_requires_a_subscription() {
        let queue = Arc::new(InMemoryQueue::new());
        let client = InMemoryConsumerClient::new(queue, "g1", 0, 16);

        let err = client
            .listen(Duration::from_millis(10), CancellationToken::new(), commit_all())
            .await
            .unwrap_err();

        assert!(matches!(
            err.kind(),
            crate::consumer::ConsumerErrorKind::NotSubscribed { .. }
        ));
    }

    #[tokio::test]
    async fn dropping_the_last_clone_unregisters_the_group() {
        let queue = Arc::new(InMemoryQueue::new());
        let client = InMemoryConsumerClient::new(queue.clone(), "g1", 0, 16);
        let other = client.clone();
        assert!(queue.has_client("g1"));

        drop(client);
        assert!(queue.has_client("g1"));
        drop(other);
        assert!(!queue.has_client("g1"));
    }

    #[tokio::test]
    async fn dropping_a_replaced_client_keeps_the_newer_registration() {
        let queue = Arc::new(InMemoryQueue::new());
        let old = InMemoryConsumerClient::new(queue.clone(), "g1", 0, 16);
        let new = InMemoryConsumerClient::new(queue.clone(), "g1", 0, 16);
        new.subscribe(vec!["demo.ping".to_owned()]).await.unwrap();

        drop(old);
        assert!(queue.has_client("g1"));

        queue.send(ping("after")).await.unwrap();
        let cancel = CancellationToken::new();
        let listener = tokio::spawn({
            let new = new.clone();
            let cancel = cancel.clone();
            async move { new.listen(Duration::from_millis(10), cancel, commit_all()).await }
        });
        wait_for(&new, 1).await;
        cancel.cancel();
        listener.await.unwrap().unwrap();
        assert_eq!(new.committed(), 1);
    }

    #[tokio::test]
    async fn factory_sizes_the_queue_from_the_options() {
        let queue = Arc::new(InMemoryQueue::new());
        let factory = InMemoryConsumerClientFactory::with_options(
            queue.clone(),
            &Options::default().with_queue_capacity(1),
        );
        let client = factory.create("g1", 0).await.unwrap();
        client.subscribe(vec!["demo.ping".to_owned()]).await.unwrap();

        queue.send(ping("first")).await.unwrap();
        let blocked = tokio::time::timeout(Duration::from_millis(20), queue.send(ping("second"))).await;
        assert!(blocked.is_err());
    }
}
