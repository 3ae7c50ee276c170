use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use lapin::{
    Channel, Connection, ConnectionProperties, ExchangeKind,
    acker::Acker,
    message::Delivery,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable},
};
use tokio_stream::StreamExt as _;
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

/// Builds one [`RabbitMqConsumerClient`] per consumer group.
///
/// Every client opens its own connection, declares the topic `exchange`
/// and a durable queue named after its group.
#[derive(Debug, Clone)]
pub struct RabbitMqConsumerClientFactory {
    uri: String,
    exchange: String,
}

impl RabbitMqConsumerClientFactory {
    pub fn new(uri: impl Into<String>, exchange: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            exchange: exchange.into(),
        }
    }
}

#[async_trait]
impl ConsumerClientFactory for RabbitMqConsumerClientFactory {
    type Client = RabbitMqConsumerClient;

    async fn create(
        &self,
        group: &str,
        group_concurrency: usize,
    ) -> Result<RabbitMqConsumerClient, ConsumerError> {
        let connection = Connection::connect(&self.uri, ConnectionProperties::default())
            .await
            .map_err(ConsumerError::connection)?;
        let channel = connection
            .create_channel()
            .await
            .map_err(ConsumerError::connection)?;

        channel
            .exchange_declare(
                &self.exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(ConsumerError::connection)?;
        channel
            .queue_declare(
                group,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(ConsumerError::connection)?;
        channel
            .basic_qos(prefetch(group_concurrency), BasicQosOptions::default())
            .await
            .map_err(ConsumerError::connection)?;

        Ok(RabbitMqConsumerClient {
            inner: Arc::new(Inner {
                group: group.to_owned(),
                uri: self.uri.clone(),
                exchange: self.exchange.clone(),
                _connection: connection,
                channel,
                gate: ConcurrencyGate::new(group_concurrency),
                subscribed: AtomicBool::new(false),
                listening: AtomicBool::new(false),
                next_tag: AtomicU64::new(1),
                ackers: Mutex::new(HashMap::new()),
                log: Mutex::new(default_log_callback()),
            }),
        })
    }
}

/// RabbitMQ consumer client of one consumer group.
///
/// Mapping:
/// - consumer group → durable queue of the same name
/// - topics → bindings of that queue on the exchange, topic as routing key
/// - AMQP headers → headers, `Void` values as null
/// - the AMQP `message-id` property fills a missing message-id header
///
/// Commit acknowledges the delivery; reject returns it to the queue.
/// Prefetch is set to the group concurrency (1 when sequential).
#[derive(Clone)]
pub struct RabbitMqConsumerClient {
    inner: Arc<Inner>,
}

struct Inner {
    group: String,
    uri: String,
    exchange: String,
    _connection: Connection,
    channel: Channel,
    gate: ConcurrencyGate,
    subscribed: AtomicBool,
    listening: AtomicBool,
    next_tag: AtomicU64,
    ackers: Mutex<HashMap<u64, Acker>>,
    log: Mutex<LogCallback>,
}

impl RabbitMqConsumerClient {
    fn ackers(&self) -> MutexGuard<'_, HashMap<u64, Acker>> {
        self.inner
            .ackers
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

    async fn listen_loop(
        &self,
        timeout: Duration,
        cancel: CancellationToken,
        callback: MessageCallback,
        mut deliveries: lapin::Consumer,
    ) {
        let gate = &self.inner.gate;
        tracing::debug!(concurrency = gate.limit(), "Listening");

        loop {
            let slot = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                slot = gate.reserve() => slot,
            };

            let delivery = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                received = tokio::time::timeout(timeout, deliveries.next()) => match received {
                    Ok(Some(Ok(delivery))) => delivery,
                    Ok(Some(Err(err))) => {
                        self.log(LogKind::Disconnected, format!("RabbitMQ error: {err}"));
                        break;
                    }
                    Ok(None) => {
                        self.log(LogKind::Disconnected, "Consumer cancelled by the broker".to_owned());
                        break;
                    }
                    Err(_) => continue,
                },
            };

            let Delivery {
                properties,
                data,
                acker,
                ..
            } = delivery;
            let mut headers = courier_headers(properties.headers().as_ref());
            if headers.id().is_none() {
                if let Some(id) = properties.message_id() {
                    headers.insert(keys::MESSAGE_ID, id.as_str());
                }
            }
            headers.insert(keys::GROUP, self.inner.group.as_str());

            if let Some(key) = headers.missing_required() {
                self.log(
                    LogKind::InvalidMessage,
                    format!("Dropping message without required header '{key}'"),
                );
                // Requeueing would only loop it back.
                if let Err(err) = acker
                    .nack(BasicNackOptions {
                        requeue: false,
                        ..Default::default()
                    })
                    .await
                {
                    self.log(LogKind::SettleFailed, format!("Invalid message could not be dropped: {err}"));
                }
                continue;
            }

            let message = TransportMessage {
                headers,
                message: RawPayload::from(data),
            };
            let tag = self.inner.next_tag.fetch_add(1, Ordering::SeqCst);
            self.ackers().insert(tag, acker);
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

    fn take_acker(&self, token: &DeliveryToken) -> Result<Acker, ConsumerError> {
        self.ackers().remove(&token.tag()).ok_or_else(|| {
            ConsumerError::settle(format!("Delivery {} is unknown or already settled", token.tag()))
        })
    }
}

#[async_trait]
impl ConsumerClient for RabbitMqConsumerClient {
    fn group(&self) -> &str {
        &self.inner.group
    }

    fn address(&self) -> BrokerAddress {
        BrokerAddress::new("rabbitmq", Some(self.inner.uri.clone()))
    }

    fn set_log_callback(&self, callback: LogCallback) {
        *self.inner.log.lock().unwrap_or_else(PoisonError::into_inner) = callback;
    }

    /// Binds the group queue once per topic; binding twice is a no-op on
    /// the broker.
    async fn subscribe(&self, topics: Vec<String>) -> Result<(), ConsumerError> {
        for topic in topics {
            tracing::debug!(group = %self.inner.group, topic = %topic, "Binding queue to topic");
            self.inner
                .channel
                .queue_bind(
                    &self.inner.group,
                    &self.inner.exchange,
                    &topic,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(ConsumerError::connection)?;
        }
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
        if self.inner.listening.swap(true, Ordering::SeqCst) {
            return Err(ConsumerError::already_listening(&self.inner.group));
        }

        let consumer_tag = format!("{}.{}", self.inner.group, uuid::Uuid::new_v4());
        let deliveries = match self
            .inner
            .channel
            .basic_consume(
                &self.inner.group,
                &consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
        {
            Ok(deliveries) => deliveries,
            Err(err) => {
                self.inner.listening.store(false, Ordering::SeqCst);
                return Err(ConsumerError::connection(err));
            }
        };

        self.listen_loop(timeout, cancel, callback, deliveries).await;

        if let Err(err) = self
            .inner
            .channel
            .basic_cancel(&consumer_tag, BasicCancelOptions::default())
            .await
        {
            tracing::warn!(%err, "Could not cancel the RabbitMQ consumer");
        }
        self.inner.listening.store(false, Ordering::SeqCst);
        tracing::debug!("Stopped listening");
        Ok(())
    }

    async fn commit(&self, token: DeliveryToken) -> Result<(), ConsumerError> {
        tracing::trace!(group = %token.group(), tag = token.tag(), "Commit");
        let acker = self.take_acker(&token);
        token.release();
        acker?
            .ack(BasicAckOptions::default())
            .await
            .map_err(ConsumerError::settle)?;
        Ok(())
    }

    async fn reject(&self, token: DeliveryToken) -> Result<(), ConsumerError> {
        tracing::trace!(group = %token.group(), tag = token.tag(), "Reject");
        let acker = self.take_acker(&token);
        token.release();
        acker?
            .nack(BasicNackOptions {
                requeue: true,
                ..Default::default()
            })
            .await
            .map_err(ConsumerError::settle)?;
        Ok(())
    }
}

fn prefetch(group_concurrency: usize) -> u16 {
    u16::try_from(group_concurrency.max(1)).unwrap_or(u16::MAX)
}

fn courier_headers(table: Option<&FieldTable>) -> Headers {
    let mut headers = Headers::new();
    for (key, value) in table.into_iter().flat_map(|t| t.inner()) {
        match value {
            AMQPValue::LongString(v) => {
                headers.insert(key.as_str(), String::from_utf8_lossy(v.as_bytes()));
            }
            AMQPValue::ShortString(v) => {
                headers.insert(key.as_str(), v.as_str());
            }
            AMQPValue::Void => {
                headers.insert_null(key.as_str());
            }
            other => {
                tracing::debug!(key = key.as_str(), value = ?other, "Skipping non-string AMQP header");
            }
        }
    }
    headers
}
