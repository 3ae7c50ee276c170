use std::sync::Arc;

use crate::{
    TransportMessage,
    broker::InMemoryQueue,
    transport::{BrokerAddress, Sender, TransportError},
};

/// In-memory transport for testing or local pipelines.
///
/// This transport hands messages to a shared [`InMemoryQueue`], which fans
/// them out to every consumer group subscribed to the message name. It is
/// useful for:
/// - Unit and integration testing
/// - Running the whole pipeline without a real broker
/// - Checking the behavior other broker adapters must match
#[derive(Clone)]
pub struct InMemory {
    queue: Arc<InMemoryQueue>,
}

impl InMemory {
    /// Create a sender publishing into `queue`.
    pub fn new(queue: Arc<InMemoryQueue>) -> Self {
        Self { queue }
    }

    /// The broker this sender publishes into.
    pub fn queue(&self) -> &Arc<InMemoryQueue> {
        &self.queue
    }
}

#[async_trait::async_trait]
impl Sender for InMemory {
    type Error = TransportError;

    fn address(&self) -> BrokerAddress {
        BrokerAddress::new("inmemory", None)
    }

    /// "Send" a message by fanning it out through the in-memory queue.
    #[tracing::instrument(skip_all, fields(name = envelope.headers.name()))]
    async fn send(&mut self, envelope: TransportMessage) -> Result<(), Self::Error> {
        self.queue.send(envelope).await?;
        tracing::debug!("Message sent to in-memory queue");
        Ok(())
    }
}
