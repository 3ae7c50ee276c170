use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use courier::{
    ConsumerExecutorDescriptor, ConsumerRegister, Message, Options, Outbox, Producer, Transport,
    broker::InMemoryQueue,
    consumer::{ConsumerHandle, DefaultConsumerHook, InMemoryConsumerClientFactory, JsonHandler},
    outbox::{
        MessageStatistics as _, Statistics,
        inmemory::InMemoryOutbox,
        lifecycle::{FixedBackoff, MessageState, RetryPolicy},
    },
    topic::TopicAttribute,
    transport::{InMemory, RawPayload},
};
use tokio_util::sync::CancellationToken;

struct Pipeline {
    queue: Arc<InMemoryQueue>,
    published: InMemoryOutbox,
    received: InMemoryOutbox,
    cancel: CancellationToken,
}

impl Pipeline {
    fn new() -> Self {
        Self {
            queue: Arc::new(InMemoryQueue::new()),
            published: InMemoryOutbox::default(),
            received: InMemoryOutbox::default(),
            cancel: CancellationToken::new(),
        }
    }

    fn options() -> Options {
        Options::default().with_polling_interval(Duration::from_millis(10))
    }

    fn register(
        &self,
        options: Options,
    ) -> ConsumerRegister<InMemoryConsumerClientFactory, InMemoryOutbox, DefaultConsumerHook> {
        ConsumerRegister::new(
            InMemoryConsumerClientFactory::new(self.queue.clone()),
            self.received.clone(),
            options,
        )
        .with_retry_policy(RetryPolicy::new(FixedBackoff(Duration::from_millis(20))))
    }

    async fn publish<M: serde::Serialize>(&self, messages: Vec<Message<M>>) -> Vec<String> {
        Outbox::new(self.published.clone())
            .publish_messages(messages, &mut ())
            .await
            .unwrap()
    }

    async fn deliver(&self) -> usize {
        Producer::new(
            self.published.clone(),
            Transport::new(InMemory::new(self.queue.clone())),
        )
        .dispatch_due()
        .await
        .unwrap()
    }

    async fn shutdown(self, handle: ConsumerHandle<InMemoryOutbox, DefaultConsumerHook>) {
        self.cancel.cancel();
        handle.join().await.unwrap();
    }
}

async fn wait_until(store: &InMemoryOutbox, done: impl Fn(&Statistics) -> bool) {
    for _ in 0..400 {
        if done(&store.statistics().await.unwrap()) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("pipeline did not settle: {:?}", store.statistics().await.unwrap());
}

fn recording(
    topic: &str,
    group: &str,
    seen: Arc<Mutex<Vec<(Option<String>, String)>>>,
) -> ConsumerExecutorDescriptor {
    ConsumerExecutorDescriptor::new(
        TopicAttribute::new(topic),
        JsonHandler::new(move |msg: Message<String>| {
            seen.lock()
                .unwrap()
                .push((msg.headers.group().map(str::to_owned), msg.message));
            async { Ok::<_, tower::BoxError>(()) }
        }),
    )
    .with_group(group)
}

#[tokio::test]
async fn published_message_reaches_the_subscribed_group() {
    let pipeline = Pipeline::new();
    let seen = Arc::new(Mutex::new(Vec::new()));

    let handle = pipeline
        .register(Pipeline::options())
        .register(recording("demo.ping", "g1", seen.clone()))
        .unwrap()
        .start(pipeline.cancel.clone())
        .await
        .unwrap();

    let ids = pipeline
        .publish(vec![Message::builder("demo.ping", "hi".to_owned()).build()])
        .await;
    assert_eq!(pipeline.deliver().await, 1);
    wait_until(&pipeline.received, |s| s.succeeded == 1).await;

    assert_eq!(
        *seen.lock().unwrap(),
        [(Some("g1".to_owned()), "hi".to_owned())]
    );
    let record = pipeline.published.get(&ids[0]).await.unwrap();
    assert_eq!(record.state(), MessageState::Succeeded);

    pipeline.shutdown(handle).await;
}

#[tokio::test]
async fn every_subscribed_group_gets_its_own_copy() {
    let pipeline = Pipeline::new();
    let seen = Arc::new(Mutex::new(Vec::new()));

    let handle = pipeline
        .register(Pipeline::options())
        .register(recording("demo.ping", "g1", seen.clone()))
        .unwrap()
        .register(recording("demo.ping", "g2", seen.clone()))
        .unwrap()
        .start(pipeline.cancel.clone())
        .await
        .unwrap();

    pipeline
        .publish(vec![Message::builder("demo.ping", "hi".to_owned()).build()])
        .await;
    pipeline.deliver().await;
    wait_until(&pipeline.received, |s| s.succeeded == 2).await;

    let mut groups: Vec<_> = seen
        .lock()
        .unwrap()
        .iter()
        .map(|(group, _)| group.clone())
        .collect();
    groups.sort();
    assert_eq!(groups, [Some("g1".to_owned()), Some("g2".to_owned())]);

    pipeline.shutdown(handle).await;
}

#[tokio::test]
async fn sending_without_subscribers_is_a_routing_failure() {
    let queue = Arc::new(InMemoryQueue::new());
    let mut transport = Transport::new(InMemory::new(queue));

    let err = transport
        .send(Message::builder("demo.work", RawPayload::from("hi")).build())
        .await
        .unwrap_err();

    assert!(err.is_routing());
    assert_eq!(
        err.description(),
        "Cannot find the corresponding group for demo.work. Have you subscribed?"
    );
}

#[tokio::test]
async fn handler_failing_twice_succeeds_on_the_third_attempt() {
    let pipeline = Pipeline::new();
    let attempts = Arc::new(AtomicUsize::new(0));

    let counter = attempts.clone();
    let flaky = ConsumerExecutorDescriptor::new(
        TopicAttribute::new("demo.ping"),
        JsonHandler::new(move |_msg: Message<String>| {
            let attempt = counter.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if attempt <= 2 {
                    Err::<(), tower::BoxError>(format!("attempt {attempt} failed").into())
                } else {
                    Ok(())
                }
            }
        }),
    )
    .with_group("g1");

    let handle = pipeline
        .register(Pipeline::options())
        .register(flaky)
        .unwrap()
        .start(pipeline.cancel.clone())
        .await
        .unwrap();

    pipeline
        .publish(vec![Message::builder("demo.ping", "hi".to_owned()).build()])
        .await;
    pipeline.deliver().await;
    wait_until(&pipeline.received, |s| s.succeeded == 1).await;

    let record = pipeline.received.snapshot().await.remove(0);
    assert_eq!(record.state(), MessageState::Succeeded);
    assert_eq!(record.retries(), 2);
    assert_eq!(
        record.headers().exception(),
        Some("HandlerFailed-->attempt 2 failed")
    );
    assert_eq!(attempts.load(Ordering::SeqCst), 3);

    pipeline.shutdown(handle).await;
}

#[tokio::test]
async fn always_failing_handler_stops_at_the_retry_count() {
    let pipeline = Pipeline::new();
    let attempts = Arc::new(AtomicUsize::new(0));

    let counter = attempts.clone();
    let broken = ConsumerExecutorDescriptor::new(
        TopicAttribute::new("demo.ping"),
        JsonHandler::new(move |_msg: Message<String>| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), tower::BoxError>("down".into()) }
        }),
    )
    .with_group("g1");

    let handle = pipeline
        .register(Pipeline::options())
        .with_retry_policy(
            RetryPolicy::new(FixedBackoff(Duration::from_millis(5))).with_failed_retry_count(4),
        )
        .register(broken)
        .unwrap()
        .start(pipeline.cancel.clone())
        .await
        .unwrap();

    pipeline
        .publish(vec![Message::builder("demo.ping", "hi".to_owned()).build()])
        .await;
    pipeline.deliver().await;
    wait_until(&pipeline.received, |s| s.failed == 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let record = pipeline.received.snapshot().await.remove(0);
    assert_eq!(record.state(), MessageState::Failed);
    assert_eq!(record.retries(), 4);
    assert_eq!(attempts.load(Ordering::SeqCst), 4);

    pipeline.shutdown(handle).await;
}

#[tokio::test]
async fn group_concurrency_bounds_running_handlers() {
    let pipeline = Pipeline::new();
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let (current, max) = (running.clone(), peak.clone());
    let slow = ConsumerExecutorDescriptor::new(
        TopicAttribute::new("demo.work"),
        JsonHandler::new(move |_msg: Message<u32>| {
            let (current, max) = (current.clone(), max.clone());
            async move {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                max.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                current.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, tower::BoxError>(())
            }
        }),
    )
    .with_group("g1");

    let handle = pipeline
        .register(Pipeline::options().with_group_concurrency(3))
        .register(slow)
        .unwrap()
        .start(pipeline.cancel.clone())
        .await
        .unwrap();

    let messages = (0..10)
        .map(|i| Message::builder("demo.work", i).build())
        .collect();
    pipeline.publish::<u32>(messages).await;
    assert_eq!(pipeline.deliver().await, 10);
    wait_until(&pipeline.received, |s| s.succeeded == 10).await;

    assert_eq!(peak.load(Ordering::SeqCst), 3);
    assert_eq!(running.load(Ordering::SeqCst), 0);

    pipeline.shutdown(handle).await;
}
