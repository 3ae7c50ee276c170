use crate::{
    Envelope, Message,
    headers::keys,
    transport::{RawPayload, TransportError},
};
use std::{future::Future, pin::Pin};
use tower::{Layer, Service};

/// Tower `Service` wrapper that serializes message values to JSON.
///
/// This service converts a [`Message<M>`] whose value implements
/// `serde::Serialize` into a [`TransportMessage`](crate::TransportMessage)
/// containing the serialized JSON bytes before passing it to the inner
/// service. A payload-type hint is added when the message carries none.
#[derive(Clone)]
pub struct JsonService<T> {
    inner: T,
}

impl<T, M> Service<Message<M>> for JsonService<T>
where
    M: serde::Serialize + Send + 'static,
    T: Service<crate::TransportMessage> + Clone + Send + 'static,
    <T as Service<crate::TransportMessage>>::Error: Into<tower::BoxError>,
    T::Future: Send + 'static,
{
    type Response = T::Response;
    type Error = tower::BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, req: Message<M>) -> Self::Future {
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let bytes = serde_json::to_vec(&req.message).map_err(TransportError::serde)?;
            let mut headers = req.headers;
            if headers.get(keys::TYPE).is_none() {
                headers.insert(keys::TYPE, std::any::type_name::<M>());
            }
            let envelope = Envelope {
                headers,
                message: RawPayload::from(bytes),
            };

            inner.call(envelope).await.map_err(Into::into)
        })
    }
}

/// Tower `Layer` that applies `JsonService` to a service stack.
///
/// Wraps an existing service so that all outgoing messages are serialized
/// to JSON automatically.
pub struct JsonLayer;

impl<S> Layer<S> for JsonLayer {
    type Service = JsonService<S>;

    fn layer(&self, service: S) -> Self::Service {
        JsonService { inner: service }
    }
}
