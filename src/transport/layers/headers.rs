use std::{future::Future, pin::Pin};

use tower::{Layer, Service};

use crate::{Envelope, headers::Headers, transport::TransportError};

/// Tower `Service` that refuses envelopes breaking the header contract.
///
/// A message must carry a message id, a non-empty message name and a
/// sent-time before it reaches a sender; anything else fails with a
/// `MissingHeader` [`TransportError`] and the inner service is not called.
#[derive(Clone)]
pub struct HeaderContract<S> {
    inner: S,
}

impl<S, M> Service<Envelope<Headers, M>> for HeaderContract<S>
where
    M: Send + 'static,
    S: Service<Envelope<Headers, M>> + Clone + Send + 'static,
    S::Error: Into<tower::BoxError>,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = tower::BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, req: Envelope<Headers, M>) -> Self::Future {
        if let Some(key) = req.headers.missing_required() {
            tracing::warn!(header = key, "Refusing message without required header");
            return Box::pin(async move { Err(TransportError::missing_header(key).into()) });
        }

        // The clone stays behind; the instance driven to readiness serves
        // this call.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        Box::pin(async move { inner.call(req).await.map_err(Into::into) })
    }
}

/// Tower `Layer` installing [`HeaderContract`].
pub struct HeaderContractLayer;

impl<S> Layer<S> for HeaderContractLayer {
    type Service = HeaderContract<S>;

    fn layer(&self, service: S) -> Self::Service {
        HeaderContract { inner: service }
    }
}
