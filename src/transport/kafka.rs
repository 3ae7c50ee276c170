use async_trait::async_trait;
use rdkafka::{
    ClientConfig,
    message::{Header, OwnedHeaders},
    producer::{FutureProducer, FutureRecord},
};
use std::time::Duration;

use crate::{
    TransportMessage,
    headers::{Headers, keys},
    transport::{BrokerAddress, Sender, TransportError},
};

/// Kafka transport sender.
///
/// Publishes every message to the Kafka topic named by its message-name
/// header, using a `FutureProducer`.
///
/// Mapping:
/// - message name → Kafka topic
/// - correlation id, or message id when absent → Kafka key, so related
///   messages land on the same partition
/// - every header → Kafka header, null values as headers without value
/// - body → payload
#[derive(Clone)]
pub struct Kafka {
    producer: FutureProducer,
    timeout: Duration,
    servers: Option<String>,
}

impl Kafka {
    /// Create a new Kafka sender using the given `FutureProducer`.
    ///
    /// Default timeout is 5 seconds.
    pub fn new(producer: FutureProducer) -> Self {
        Self {
            producer,
            timeout: Duration::from_secs(5),
            servers: None,
        }
    }

    /// Create a producer for the comma separated `bootstrap_servers`.
    pub fn connect(bootstrap_servers: &str) -> Result<Self, TransportError> {
        let producer = ClientConfig::new()
            .set("bootstrap.servers", bootstrap_servers)
            .set("message.timeout.ms", "5000")
            .create::<FutureProducer>()
            .map_err(TransportError::connection)?;

        Ok(Self {
            servers: Some(bootstrap_servers.to_owned()),
            ..Self::new(producer)
        })
    }

    /// Set a custom timeout for sending messages.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl Sender for Kafka {
    type Error = TransportError;

    fn address(&self) -> BrokerAddress {
        BrokerAddress::new("kafka", self.servers.clone())
    }

    #[tracing::instrument(skip_all, fields(name = envelope.headers.name()))]
    async fn send(&mut self, envelope: TransportMessage) -> Result<(), Self::Error> {
        let topic = envelope
            .headers
            .name()
            .ok_or_else(|| TransportError::missing_header(keys::MESSAGE_NAME))?;
        let key = envelope
            .headers
            .get(keys::CORRELATION_ID)
            .or_else(|| envelope.headers.id())
            .unwrap_or_default();

        let record = FutureRecord::to(topic)
            .payload(envelope.message.as_bytes())
            .key(key)
            .headers(kafka_headers(&envelope.headers));

        self.producer
            .send(record, self.timeout)
            .await
            .map_err(|(e, _)| TransportError::publish(e))?;

        tracing::debug!("Message sent to Kafka");
        Ok(())
    }
}

fn kafka_headers(headers: &Headers) -> OwnedHeaders {
    headers
        .iter()
        .fold(OwnedHeaders::new(), |acc, (key, value)| {
            acc.insert(Header { key, value })
        })
}
