use std::sync::Arc;

use async_trait::async_trait;
use lapin::{
    BasicProperties, Connection, ConnectionProperties,
    options::{BasicPublishOptions, ConfirmSelectOptions},
    types::{AMQPValue, FieldTable, LongString, ShortString},
};
use tokio::sync::Mutex;

use crate::{
    TransportMessage,
    headers::{Headers, keys},
    transport::{BrokerAddress, Sender, TransportError},
};

/// RabbitMQ transport sender.
///
/// Publishes to a single exchange through a shared `lapin::Channel`.
///
/// - the message name is the routing key
/// - every header becomes an AMQP header; null values are sent as `Void`
/// - the message id header is also set as the AMQP `message-id` property
///
/// The channel sits behind a mutex since `send` may be called from clones
/// of the sender concurrently.
#[derive(Clone)]
pub struct RabbitMq {
    channel: Arc<Mutex<lapin::Channel>>,
    exchange: String,
    uri: Option<String>,
}

impl RabbitMq {
    /// Publish through `channel` into `exchange`.
    ///
    /// The channel should have publisher confirms enabled; `send` waits for
    /// the broker confirmation.
    pub fn new(channel: lapin::Channel, exchange: impl Into<String>) -> Self {
        Self {
            channel: Arc::new(Mutex::new(channel)),
            exchange: exchange.into(),
            uri: None,
        }
    }

    /// Open a connection and a confirming channel to `uri`.
    pub async fn connect(uri: &str, exchange: impl Into<String>) -> Result<Self, TransportError> {
        let connection = Connection::connect(uri, ConnectionProperties::default())
            .await
            .map_err(TransportError::connection)?;
        let channel = connection
            .create_channel()
            .await
            .map_err(TransportError::connection)?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(TransportError::connection)?;

        Ok(Self {
            uri: Some(uri.to_owned()),
            ..Self::new(channel, exchange)
        })
    }
}

#[async_trait]
impl Sender for RabbitMq {
    type Error = TransportError;

    fn address(&self) -> BrokerAddress {
        BrokerAddress::new("rabbitmq", self.uri.clone())
    }

    #[tracing::instrument(skip_all, fields(name = envelope.headers.name(), exchange = %self.exchange))]
    async fn send(&mut self, envelope: TransportMessage) -> Result<(), Self::Error> {
        let routing_key = envelope
            .headers
            .name()
            .ok_or_else(|| TransportError::missing_header(keys::MESSAGE_NAME))?;

        let mut properties = BasicProperties::default().with_headers(amqp_headers(&envelope.headers));
        if let Some(id) = envelope.headers.id() {
            properties = properties.with_message_id(ShortString::from(id));
        }

        let channel = self.channel.lock().await;
        channel
            .basic_publish(
                &self.exchange,
                routing_key,
                BasicPublishOptions::default(),
                envelope.message.as_bytes(),
                properties,
            )
            .await
            .map_err(TransportError::publish)?
            .await
            .map_err(TransportError::publish)?;

        tracing::debug!("Message sent to RabbitMQ");
        Ok(())
    }
}

fn amqp_headers(headers: &Headers) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in headers.iter() {
        let value = value.map_or(AMQPValue::Void, |v| AMQPValue::LongString(LongString::from(v)));
        table.insert(ShortString::from(key), value);
    }
    table
}
