//! Adapter between a host HTTP client pipeline and the dispatcher

use crate::dispatcher::dispatch;
use crate::error::InterceptError;
use crate::registry::Registry;
use crate::request::{BodyBuffer, InterceptedRequest};
use http_body_util::combinators::BoxBody;
use http_body_util::BodyExt;
use hyper::body::{Body, Bytes};
use hyper::{Request, Response};
use std::io;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Message-handler seam: plugs the dispatcher into whatever the host HTTP
/// stack's extension point looks like (a `service_fn`, a middleware, a
/// transport mock). Stateless beyond the registry reference.
///
/// A [`CancellationToken`] found in the request extensions is adopted as
/// the request's cancellation signal.
#[derive(Clone)]
pub struct InterceptHook {
    registry: Arc<Registry>,
}

impl InterceptHook {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Resolve one wire-shaped request into a wire-shaped response without
    /// touching the network.
    pub async fn handle<B>(
        &self,
        request: Request<B>,
    ) -> Result<Response<BoxBody<Bytes, io::Error>>, InterceptError>
    where
        B: Body,
        B::Error: Into<crate::error::BoxError>,
    {
        let (parts, body) = request.into_parts();
        let cancellation = parts
            .extensions
            .get::<CancellationToken>()
            .cloned()
            .unwrap_or_default();
        let collected = body
            .collect()
            .await
            .map_err(|err| InterceptError::Callback(err.into()))?
            .to_bytes();

        let request = InterceptedRequest::new(
            parts.method,
            parts.uri,
            parts.headers,
            BodyBuffer::from_bytes(collected),
        )
        .with_cancellation(cancellation);

        let response = dispatch(&self.registry, &request).await?;
        Ok(response.into_http_response())
    }
}
