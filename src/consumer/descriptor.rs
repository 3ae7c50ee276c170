use std::{
    any::type_name,
    fmt,
    marker::PhantomData,
    sync::{Arc, OnceLock},
};

use serde::de::DeserializeOwned;
use tracing_error::SpanTrace;

use crate::{
    Envelope, Message, TransportMessage,
    topic::{self, TopicAttribute},
};

/// Code run for every message routed to a descriptor.
#[async_trait::async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, message: &TransportMessage) -> Result<(), HandlerError>;
}

/// Handler deserializing the body into `T` with `serde_json` before calling
/// the wrapped function.
///
/// A body that does not deserialize is a terminal failure: retrying cannot
/// fix it.
pub struct JsonHandler<T, F> {
    f: F,
    _marker: PhantomData<fn() -> T>,
}

impl<T, F, Fut> JsonHandler<T, F>
where
    F: Fn(Message<T>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), tower::BoxError>> + Send,
{
    pub fn new(f: F) -> Self {
        Self {
            f,
            _marker: PhantomData,
        }
    }
}

#[async_trait::async_trait]
impl<T, F, Fut> Handler for JsonHandler<T, F>
where
    T: DeserializeOwned + Send + 'static,
    F: Fn(Message<T>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), tower::BoxError>> + Send + 'static,
{
    async fn handle(&self, message: &TransportMessage) -> Result<(), HandlerError> {
        let value: T = serde_json::from_slice(message.message.as_bytes())
            .map_err(|err| HandlerError::deserialize(type_name::<T>(), err))?;

        (self.f)(Envelope {
            headers: message.headers.clone(),
            message: value,
        })
        .await
        .map_err(HandlerError::failed)
    }
}

/// Handler over the raw wire envelope; see [`handler_fn`].
pub struct FnHandler<F> {
    f: F,
}

/// Wrap an async function of the raw [`TransportMessage`] as a [`Handler`].
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(TransportMessage) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    FnHandler { f }
}

#[async_trait::async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(TransportMessage) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, message: &TransportMessage) -> Result<(), HandlerError> {
        (self.f)(message.clone()).await
    }
}

/// Routing descriptor of one handler.
///
/// Carries the routing fragments the topic is resolved from, the explicit
/// group if any, and the handler itself. The topic is resolved on first use
/// and cached for the descriptor's lifetime.
pub struct ConsumerExecutorDescriptor {
    name: String,
    class: Option<TopicAttribute>,
    method: TopicAttribute,
    topic_prefix: Option<String>,
    group: Option<String>,
    topic: OnceLock<String>,
    handler: Arc<dyn Handler>,
}

impl ConsumerExecutorDescriptor {
    /// Descriptor for `handler`, routed by the method-level fragment
    /// `method`. The handler name defaults to the fragment.
    pub fn new(method: TopicAttribute, handler: impl Handler + 'static) -> Self {
        Self {
            name: method.name().to_owned(),
            class: None,
            method,
            topic_prefix: None,
            group: None,
            topic: OnceLock::new(),
            handler: Arc::new(handler),
        }
    }

    /// Set the class-level fragment.
    pub fn with_class(mut self, class: TopicAttribute) -> Self {
        self.class = Some(class);
        self.topic = OnceLock::new();
        self
    }

    /// Set the topic-name prefix.
    pub fn with_topic_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.topic_prefix = Some(prefix.into());
        self.topic = OnceLock::new();
        self
    }

    /// Consume in `group` instead of the default group.
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    /// Name used in logs and failure records.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The explicit group, before prefix and version are applied.
    pub fn group(&self) -> Option<&str> {
        self.group.as_deref()
    }

    pub fn topic_prefix(&self) -> Option<&str> {
        self.topic_prefix.as_deref()
    }

    /// Resolved topic.
    pub fn topic(&self) -> &str {
        self.topic.get_or_init(|| {
            topic::resolve_topic(
                self.class.as_ref(),
                &self.method,
                self.topic_prefix.as_deref(),
            )
        })
    }

    pub fn handler(&self) -> &Arc<dyn Handler> {
        &self.handler
    }
}

impl fmt::Debug for ConsumerExecutorDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerExecutorDescriptor")
            .field("name", &self.name)
            .field("class", &self.class)
            .field("method", &self.method)
            .field("topic_prefix", &self.topic_prefix)
            .field("group", &self.group)
            .finish_non_exhaustive()
    }
}

/// Error returned by a [`Handler`].
#[derive(Debug)]
pub struct HandlerError {
    context: SpanTrace,
    kind: HandlerErrorKind,
}

/// Handler errors kind.
#[derive(Debug)]
pub enum HandlerErrorKind {
    /// The handler ran and failed; the message is retried.
    Failed(tower::BoxError),
    /// The body cannot be mapped to the handler's parameter type.
    Deserialize {
        type_name: &'static str,
        source: serde_json::Error,
    },
}

impl HandlerError {
    pub fn failed(err: impl Into<tower::BoxError>) -> Self {
        Self::new(HandlerErrorKind::Failed(err.into()))
    }

    pub fn deserialize(type_name: &'static str, source: serde_json::Error) -> Self {
        Self::new(HandlerErrorKind::Deserialize { type_name, source })
    }

    fn new(kind: HandlerErrorKind) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind,
        }
    }

    pub fn kind(&self) -> &HandlerErrorKind {
        &self.kind
    }

    /// Whether retrying can never succeed.
    pub fn is_terminal(&self) -> bool {
        matches!(self.kind, HandlerErrorKind::Deserialize { .. })
    }

    /// Stable error code.
    pub fn code(&self) -> &'static str {
        match &self.kind {
            HandlerErrorKind::Failed(_) => "HandlerFailed",
            HandlerErrorKind::Deserialize { .. } => "DeserializationFailed",
        }
    }

    /// Human readable description.
    pub fn description(&self) -> String {
        match &self.kind {
            HandlerErrorKind::Failed(err) => err.to_string(),
            HandlerErrorKind::Deserialize { type_name, source } => {
                format!("Cannot deserialize body into {type_name}: {source}")
            }
        }
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}: {}", self.code(), self.description())?;
        self.context.fmt(f)
    }
}

impl std::error::Error for HandlerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            HandlerErrorKind::Failed(err) => Some(err.as_ref()),
            HandlerErrorKind::Deserialize { source, .. } => Some(source),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde::Deserialize;

    use super::*;
    use crate::transport::RawPayload;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Ping {
        text: String,
    }

    fn wire(body: &str) -> TransportMessage {
        Message::builder("demo.ping", RawPayload::from(body)).build()
    }

    #[tokio::test]
    async fn json_handler_receives_the_typed_value() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handler = JsonHandler::new(move |msg: Message<Ping>| {
            let sink = sink.clone();
            async move {
                sink.lock().unwrap().push(msg.message.text);
                Ok::<_, tower::BoxError>(())
            }
        });

        handler.handle(&wire(r#"{"text":"hi"}"#)).await.unwrap();

        assert_eq!(*seen.lock().unwrap(), ["hi"]);
    }

    #[tokio::test]
    async fn undecodable_body_is_a_terminal_failure() {
        let handler = JsonHandler::new(|_msg: Message<Ping>| async { Ok::<_, tower::BoxError>(()) });

        let err = handler.handle(&wire("not json")).await.unwrap_err();

        assert!(err.is_terminal());
        assert_eq!(err.code(), "DeserializationFailed");
        assert!(err.description().contains("Ping"));
    }

    #[tokio::test]
    async fn handler_failure_is_retryable() {
        let handler = JsonHandler::new(|_msg: Message<Ping>| async {
            Err::<(), tower::BoxError>("boom".into())
        });

        let err = handler.handle(&wire(r#"{"text":"hi"}"#)).await.unwrap_err();

        assert!(!err.is_terminal());
        assert_eq!(err.description(), "boom");
    }

    #[test]
    fn topic_is_resolved_from_fragments_and_prefix() {
        let descriptor = ConsumerExecutorDescriptor::new(
            TopicAttribute::partial(".ping"),
            handler_fn(|_msg| async { Ok::<_, HandlerError>(()) }),
        )
        .with_class(TopicAttribute::partial("demo."))
        .with_topic_prefix("v1")
        .with_group("g1");

        assert_eq!(descriptor.topic(), "v1.demo.ping");
        assert_eq!(descriptor.topic(), "v1.demo.ping");
        assert_eq!(descriptor.group(), Some("g1"));
        assert_eq!(descriptor.name(), ".ping");
    }
}
