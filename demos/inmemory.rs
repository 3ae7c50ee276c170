use std::{sync::Arc, time::Duration};

use courier::{
    ConsumerExecutorDescriptor, ConsumerRegister, Message, Options, Outbox, Producer, Transport,
    broker::InMemoryQueue,
    consumer::{InMemoryConsumerClientFactory, JsonHandler},
    outbox::{MessageStatistics as _, inmemory::InMemoryOutbox},
    topic::TopicAttribute,
    transport::InMemory,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing_error::ErrorLayer;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

#[derive(Clone, Debug, Serialize, Deserialize)]
struct Greeting {
    id: u32,
    text: String,
}

#[tokio::main]
async fn main() {
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(ErrorLayer::default())
        .init();

    let options = Options::default()
        .with_topic_name_prefix("demo")
        .with_group_concurrency(4)
        .with_polling_interval(Duration::from_millis(200));

    let queue = Arc::new(InMemoryQueue::new());
    let published = InMemoryOutbox::default();
    let received = InMemoryOutbox::default();

    let cancel = CancellationToken::new();
    let cancel_signal = cancel.clone();
    let cancel_handle = tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
        cancel_signal.cancel();
    });

    let consumers = ConsumerRegister::new(
        InMemoryConsumerClientFactory::with_options(queue.clone(), &options),
        received.clone(),
        options.clone(),
    )
    .register(
        ConsumerExecutorDescriptor::new(
            TopicAttribute::partial(".hello"),
            JsonHandler::new(|msg: Message<Greeting>| async move {
                tracing::info!(id = msg.message.id, text = %msg.message.text, "Greeting received");
                Ok::<_, tower::BoxError>(())
            }),
        )
        .with_class(TopicAttribute::partial("greetings."))
        .with_group("greeters"),
    )
    .expect("valid handler registration")
    .start(cancel.clone())
    .await
    .expect("consumers started");

    let cancel_outbox = cancel.clone();
    let outbox = Outbox::new(published.clone()).with_options(&options);
    let outbox_handle = tokio::spawn(async move {
        let mut id = 0;
        while !cancel_outbox.is_cancelled() {
            let greeting = Greeting {
                id,
                text: "Hello".to_owned(),
            };
            outbox
                .publish_messages([Message::builder("greetings.hello", greeting).build()], &mut ())
                .await
                .expect("Failed to insert message");
            id += 1;
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    });

    let transport = Transport::new(InMemory::new(queue));
    let producer = Producer::new(published.clone(), transport).with_options(&options);
    let producer_handle = tokio::spawn(producer.run(cancel.clone()));

    let (cancel_result, outbox_result, producer_result) =
        tokio::join!(cancel_handle, outbox_handle, producer_handle);
    cancel_result.unwrap();
    outbox_result.unwrap();
    producer_result.unwrap().unwrap();
    consumers.join().await.unwrap();

    tracing::info!(
        published = ?published.statistics().await.unwrap(),
        received = ?received.statistics().await.unwrap(),
        "Pipeline stopped"
    );
}
