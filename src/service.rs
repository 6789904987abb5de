use crate::config::Settings;
use crate::future::ResponseFuture;
use crate::negotiate::{VaryHandle, negotiate};
use http::{Method, Request};
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::Service;

/// A Tower service that compresses HTTP response bodies with brotli.
#[derive(Debug, Clone)]
pub struct CompressionService<S> {
    inner: S,
    settings: Arc<Settings>,
}

impl<S> CompressionService<S> {
    /// Creates a new compression service wrapping the given inner service.
    pub fn new(inner: S, settings: Arc<Settings>) -> Self {
        Self { inner, settings }
    }

    /// Returns the settings in effect.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Returns a reference to the inner service.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Returns a mutable reference to the inner service.
    pub fn inner_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    /// Consumes this service, returning the inner service.
    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for CompressionService<S>
where
    S: Service<Request<ReqBody>, Response = http::Response<ResBody>>,
{
    type Response = http::Response<crate::body::CompressionBody<ResBody>>;
    type Error = S::Error;
    type Future = ResponseFuture<S::Future>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<ReqBody>) -> Self::Future {
        // Negotiation leaves a marker on the request, so an inner static
        // variant stage reuses this decision.
        let accepted = self.settings.enable && negotiate(&mut req, false);
        let head = req.method() == Method::HEAD;

        let vary = VaryHandle::default();
        req.extensions_mut().insert(vary.clone());

        let inner = self.inner.call(req);

        ResponseFuture::new(inner, accepted, head, self.settings.clone(), vary)
    }
}
