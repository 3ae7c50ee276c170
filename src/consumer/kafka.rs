use std::{
    collections::{BTreeSet, HashMap},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use rdkafka::{
    ClientConfig, Message as _, Offset, TopicPartitionList,
    consumer::{CommitMode, Consumer, StreamConsumer},
    message::{BorrowedMessage, Headers as _},
};
use tokio_util::sync::CancellationToken;

use crate::{
    TransportMessage,
    consumer::{
        ConcurrencyGate, ConsumerClient, ConsumerClientFactory, ConsumerError, DeliveryToken,
        LogCallback, LogKind, LogMessage, MessageCallback, Outcome, default_log_callback,
    },
    headers::{Headers, keys},
    transport::{BrokerAddress, RawPayload},
};

/// Builds one [`KafkaConsumerClient`] per consumer group.
#[derive(Debug, Clone)]
pub struct KafkaConsumerClientFactory {
    servers: String,
    config: Vec<(String, String)>,
}

impl KafkaConsumerClientFactory {
    /// Clients for the comma separated `bootstrap_servers`.
    pub fn new(bootstrap_servers: impl Into<String>) -> Self {
        Self {
            servers: bootstrap_servers.into(),
            config: Vec::new(),
        }
    }

    /// Extra librdkafka setting applied to every client.
    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.push((key.into(), value.into()));
        self
    }
}

#[async_trait]
impl ConsumerClientFactory for KafkaConsumerClientFactory {
    type Client = KafkaConsumerClient;

    async fn create(
        &self,
        group: &str,
        group_concurrency: usize,
    ) -> Result<KafkaConsumerClient, ConsumerError> {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &self.servers)
            .set("group.id", group)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest");
        for (key, value) in &self.config {
            config.set(key, value);
        }
        let consumer = config
            .create::<StreamConsumer>()
            .map_err(ConsumerError::connection)?;

        Ok(KafkaConsumerClient::new(
            consumer,
            group,
            group_concurrency,
            self.servers.clone(),
        ))
    }
}

/// Kafka consumer client of one consumer group.
///
/// Mapping:
/// - consumer group → Kafka `group.id`
/// - topics → Kafka topics of the same name
/// - Kafka headers → headers, headers without value as null
/// - payload → body
///
/// Offsets are committed by hand. A commit moves the group position up to
/// the lowest delivery of the partition still unsettled, so a delivery is
/// never committed past while its callback runs. A rejected delivery stays
/// unsettled: the position of its partition does not move past it and it is
/// delivered again once the group rebalances or restarts.
#[derive(Clone)]
pub struct KafkaConsumerClient {
    inner: Arc<Inner>,
}

struct Inner {
    group: String,
    servers: String,
    consumer: StreamConsumer,
    gate: ConcurrencyGate,
    topics: Mutex<BTreeSet<String>>,
    listening: AtomicBool,
    next_tag: AtomicU64,
    offsets: Mutex<OffsetTracker>,
    log: Mutex<LogCallback>,
}

impl KafkaConsumerClient {
    pub fn new(
        consumer: StreamConsumer,
        group: &str,
        group_concurrency: usize,
        servers: String,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                group: group.to_owned(),
                servers,
                consumer,
                gate: ConcurrencyGate::new(group_concurrency),
                topics: Mutex::new(BTreeSet::new()),
                listening: AtomicBool::new(false),
                next_tag: AtomicU64::new(1),
                offsets: Mutex::new(OffsetTracker::default()),
                log: Mutex::new(default_log_callback()),
            }),
        }
    }

    fn offsets(&self) -> MutexGuard<'_, OffsetTracker> {
        self.inner
            .offsets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
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

    async fn listen_loop(&self, timeout: Duration, cancel: CancellationToken, callback: MessageCallback) {
        let gate = &self.inner.gate;
        tracing::debug!(concurrency = gate.limit(), "Listening");

        loop {
            let slot = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                slot = gate.reserve() => slot,
            };

            let received = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                received = tokio::time::timeout(timeout, self.inner.consumer.recv()) => received,
            };
            let (message, position) = match received {
                Ok(Ok(borrowed)) => transport_message(&self.inner.group, &borrowed),
                Ok(Err(err)) => {
                    self.log(LogKind::Disconnected, format!("Kafka error: {err}"));
                    continue;
                }
                Err(_) => continue,
            };

            if let Some(key) = message.headers.missing_required() {
                self.log(
                    LogKind::InvalidMessage,
                    format!("Skipping message without required header '{key}'"),
                );
                continue;
            }

            let tag = self.inner.next_tag.fetch_add(1, Ordering::SeqCst);
            self.offsets().track(tag, position);
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
    }
}

#[async_trait]
impl ConsumerClient for KafkaConsumerClient {
    fn group(&self) -> &str {
        &self.inner.group
    }

    fn address(&self) -> BrokerAddress {
        BrokerAddress::new("kafka", Some(self.inner.servers.clone()))
    }

    fn set_log_callback(&self, callback: LogCallback) {
        *self.inner.log.lock().unwrap_or_else(PoisonError::into_inner) = callback;
    }

    /// Kafka replaces the subscription on every call, so the client
    /// subscribes to everything it was asked for so far.
    async fn subscribe(&self, topics: Vec<String>) -> Result<(), ConsumerError> {
        let mut subscribed = self
            .inner
            .topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        subscribed.extend(topics);

        let names: Vec<&str> = subscribed.iter().map(String::as_str).collect();
        tracing::debug!(group = %self.inner.group, topics = ?names, "Subscribing to Kafka topics");
        self.inner
            .consumer
            .subscribe(&names)
            .map_err(ConsumerError::connection)
    }

    #[tracing::instrument(skip_all, fields(group = %self.inner.group))]
    async fn listen(
        &self,
        timeout: Duration,
        cancel: CancellationToken,
        callback: MessageCallback,
    ) -> Result<(), ConsumerError> {
        let subscribed = !self
            .inner
            .topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty();
        if !subscribed {
            return Err(ConsumerError::not_subscribed(&self.inner.group));
        }
        if self.inner.listening.swap(true, Ordering::SeqCst) {
            return Err(ConsumerError::already_listening(&self.inner.group));
        }

        self.listen_loop(timeout, cancel, callback).await;

        self.inner.listening.store(false, Ordering::SeqCst);
        tracing::debug!("Stopped listening");
        Ok(())
    }

    async fn commit(&self, token: DeliveryToken) -> Result<(), ConsumerError> {
        tracing::trace!(group = %token.group(), tag = token.tag(), "Commit");
        let position = self.offsets().commit(token.tag());
        token.release();

        if let Some(position) = position {
            let mut list = TopicPartitionList::new();
            list.add_partition_offset(
                &position.topic,
                position.partition,
                Offset::Offset(position.offset),
            )
            .map_err(ConsumerError::settle)?;
            self.inner
                .consumer
                .commit(&list, CommitMode::Async)
                .map_err(ConsumerError::settle)?;
        }
        Ok(())
    }

    async fn reject(&self, token: DeliveryToken) -> Result<(), ConsumerError> {
        tracing::trace!(group = %token.group(), tag = token.tag(), "Reject");
        if self.offsets().reject(token.tag()) {
            tracing::warn!(
                group = %token.group(),
                tag = token.tag(),
                "Rejected Kafka delivery holds its partition position until redelivered"
            );
        }
        token.release();
        Ok(())
    }
}

/// Where one delivery sits in its partition.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Position {
    topic: String,
    partition: i32,
    offset: i64,
}

/// Offsets handed out per partition and the commit position they allow.
#[derive(Debug, Default)]
struct OffsetTracker {
    deliveries: HashMap<u64, Position>,
    partitions: HashMap<(String, i32), PartitionOffsets>,
}

#[derive(Debug, Default)]
struct PartitionOffsets {
    unsettled: BTreeSet<i64>,
    next: Option<i64>,
    committed: Option<i64>,
}

impl OffsetTracker {
    fn track(&mut self, tag: u64, position: Position) {
        let partition = self
            .partitions
            .entry((position.topic.clone(), position.partition))
            .or_default();
        // The group position is at least the first offset it handed out.
        partition.committed.get_or_insert(position.offset);
        partition.unsettled.insert(position.offset);
        self.deliveries.insert(tag, position);
    }

    /// Settle the delivery `tag`; returns the position to commit when it
    /// moved forward.
    fn commit(&mut self, tag: u64) -> Option<Position> {
        let delivery = self.deliveries.remove(&tag)?;
        let partition = self
            .partitions
            .get_mut(&(delivery.topic.clone(), delivery.partition))?;

        partition.unsettled.remove(&delivery.offset);
        let done = delivery.offset + 1;
        partition.next = Some(partition.next.map_or(done, |next| next.max(done)));

        let position = partition
            .unsettled
            .first()
            .copied()
            .or(partition.next)?;
        if partition.committed.is_some_and(|committed| committed >= position) {
            return None;
        }
        partition.committed = Some(position);
        Some(Position {
            offset: position,
            ..delivery
        })
    }

    /// Forget the delivery `tag` but keep its offset unsettled.
    fn reject(&mut self, tag: u64) -> bool {
        self.deliveries.remove(&tag).is_some()
    }
}

fn transport_message(group: &str, message: &BorrowedMessage<'_>) -> (TransportMessage, Position) {
    let mut headers = courier_headers(message.headers());
    headers.insert(keys::GROUP, group);

    let envelope = TransportMessage {
        headers,
        message: RawPayload::from(message.payload().unwrap_or_default()),
    };
    let position = Position {
        topic: message.topic().to_owned(),
        partition: message.partition(),
        offset: message.offset(),
    };
    (envelope, position)
}

fn courier_headers<H: rdkafka::message::Headers>(kafka: Option<&H>) -> Headers {
    let mut headers = Headers::new();
    for header in kafka.into_iter().flat_map(|h| h.iter()) {
        match header.value {
            Some(value) => headers.insert(header.key, String::from_utf8_lossy(value)),
            None => headers.insert_null(header.key),
        };
    }
    headers
}

#[cfg(test)]
mod tests {
    use rdkafka::message::{Header, OwnedHeaders};

    use super::*;

    fn at(offset: i64) -> Position {
        Position {
            topic: "demo.ping".to_owned(),
            partition: 0,
            offset,
        }
    }

    #[test]
    fn commit_position_never_passes_an_unsettled_delivery() {
        let mut tracker = OffsetTracker::default();
        tracker.track(1, at(5));
        tracker.track(2, at(6));
        tracker.track(3, at(7));

        assert_eq!(tracker.commit(2), None);
        assert_eq!(tracker.commit(1), Some(at(7)));
        assert_eq!(tracker.commit(3), Some(at(8)));
        assert_eq!(tracker.commit(3), None);
    }

    #[test]
    fn rejected_delivery_holds_its_partition() {
        let mut tracker = OffsetTracker::default();
        tracker.track(1, at(5));
        tracker.track(2, at(6));

        assert!(tracker.reject(1));
        assert_eq!(tracker.commit(2), None);
        assert!(!tracker.reject(1));

        tracker.track(3, at(7));
        assert_eq!(tracker.commit(3), None);
    }

    #[test]
    fn partitions_are_tracked_apart() {
        let mut tracker = OffsetTracker::default();
        tracker.track(1, at(5));
        tracker.track(2, Position {
            partition: 1,
            ..at(40)
        });

        assert_eq!(
            tracker.commit(2),
            Some(Position {
                partition: 1,
                ..at(41)
            })
        );
        assert_eq!(tracker.commit(1), Some(at(6)));
    }

    #[test]
    fn kafka_headers_become_courier_headers() {
        let kafka = OwnedHeaders::new()
            .insert(Header {
                key: keys::MESSAGE_ID,
                value: Some("42"),
            })
            .insert(Header {
                key: keys::CALLBACK_NAME,
                value: None::<&str>,
            });

        let headers = courier_headers(Some(&kafka));

        assert_eq!(headers.id(), Some("42"));
        assert!(headers.contains_key(keys::CALLBACK_NAME));
        assert_eq!(headers.get(keys::CALLBACK_NAME), None);
        assert_eq!(courier_headers::<OwnedHeaders>(None), Headers::new());
    }
}
