//! Registered match-and-respond entries and response synthesis

use crate::error::{BoxError, InterceptError};
use crate::matcher::{CanonicalKey, RequestPredicate, SubMatcher};
use crate::request::InterceptedRequest;
use futures::future::BoxFuture;
use futures::TryStreamExt;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Bytes, Frame};
use hyper::header::HeaderName;
use hyper::{HeaderMap, Response, StatusCode, Version};
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::io::ReaderStream;

/// Opaque per-recipe map handed to callbacks
pub type UserData = HashMap<String, serde_json::Value>;

/// Readable stream opened fresh on every dispatch
pub type BodyReader = Pin<Box<dyn AsyncRead + Send + Sync>>;

pub type ContentThunk = Arc<dyn Fn() -> Result<Vec<u8>, BoxError> + Send + Sync>;
pub type AsyncContentThunk =
    Arc<dyn Fn() -> BoxFuture<'static, Result<Vec<u8>, BoxError>> + Send + Sync>;
pub type StreamThunk = Arc<dyn Fn() -> Result<BodyReader, BoxError> + Send + Sync>;
pub type HeaderThunk = Arc<dyn Fn() -> Result<HeaderMap, BoxError> + Send + Sync>;

/// How a recipe produces its entity body.
///
/// Thunk variants are re-evaluated on every dispatch; only static bytes are
/// shared by reference across dispatches.
#[derive(Clone)]
pub enum ContentProducer {
    Empty,
    Static(Bytes),
    Thunk(ContentThunk),
    AsyncThunk(AsyncContentThunk),
    Stream(StreamThunk),
}

impl fmt::Debug for ContentProducer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContentProducer::Empty => f.write_str("Empty"),
            ContentProducer::Static(bytes) => write!(f, "Static({} bytes)", bytes.len()),
            ContentProducer::Thunk(_) => f.write_str("Thunk(..)"),
            ContentProducer::AsyncThunk(_) => f.write_str("AsyncThunk(..)"),
            ContentProducer::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// Static headers plus an optional thunk evaluated at dispatch time.
/// Thunk output replaces static entries of the same name.
#[derive(Clone, Default)]
pub struct HeaderSource {
    pub(crate) fixed: HeaderMap,
    pub(crate) thunk: Option<HeaderThunk>,
}

impl HeaderSource {
    pub(crate) fn materialize(&self) -> Result<HeaderMap, InterceptError> {
        let mut merged = self.fixed.clone();
        if let Some(thunk) = &self.thunk {
            let dynamic = thunk().map_err(InterceptError::Callback)?;
            let names: Vec<HeaderName> = dynamic.keys().cloned().collect();
            for name in &names {
                merged.remove(name);
            }
            for (name, value) in dynamic.iter() {
                merged.append(name.clone(), value.clone());
            }
        }
        Ok(merged)
    }
}

/// Pre-dispatch callback: observes the request before synthesis.
///
/// The async variant receives owned copies (the request clone shares the
/// body buffer) so its future borrows nothing.
#[derive(Clone)]
pub enum InterceptCallback {
    Sync(Arc<dyn Fn(&InterceptedRequest, &UserData) -> Result<(), BoxError> + Send + Sync>),
    Async(
        Arc<
            dyn Fn(InterceptedRequest, UserData) -> BoxFuture<'static, Result<(), BoxError>>
                + Send
                + Sync,
        >,
    ),
}

impl InterceptCallback {
    pub(crate) async fn invoke(
        &self,
        req: &InterceptedRequest,
        user_data: &UserData,
    ) -> Result<(), BoxError> {
        match self {
            InterceptCallback::Sync(callback) => callback(req, user_data),
            InterceptCallback::Async(callback) => callback(req.clone(), user_data.clone()).await,
        }
    }
}

/// Immutable snapshot of what to match and how to respond.
///
/// Built by [`crate::builder::RecipeBuilder`]; once registered, later
/// builder mutations are invisible to it.
pub struct Recipe {
    pub(crate) key: Option<CanonicalKey>,
    pub(crate) predicate: Option<RequestPredicate>,
    pub(crate) matchers: Vec<SubMatcher>,
    pub(crate) priority: Option<u32>,
    pub(crate) status: StatusCode,
    pub(crate) reason: Option<String>,
    pub(crate) version: Option<Version>,
    pub(crate) response_headers: HeaderSource,
    pub(crate) content_headers: HeaderSource,
    pub(crate) content: ContentProducer,
    pub(crate) callback: Option<InterceptCallback>,
    pub(crate) delay: Option<Duration>,
    pub(crate) reusable: bool,
    pub(crate) user_data: UserData,
    pub(crate) hits: AtomicU64,
}

impl Recipe {
    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn priority(&self) -> Option<u32> {
        self.priority
    }

    pub fn is_reusable(&self) -> bool {
        self.reusable
    }

    pub fn user_data(&self) -> &UserData {
        &self.user_data
    }

    pub(crate) fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Materialize the response for one dispatch: header thunks first, then
    /// the content producer (stream producers open a fresh stream).
    pub(crate) async fn synthesize(
        &self,
        req: &InterceptedRequest,
    ) -> Result<InterceptedResponse, InterceptError> {
        let message_headers = self.response_headers.materialize()?;
        let entity_headers = self.content_headers.materialize()?;

        let body = match &self.content {
            ContentProducer::Empty => EntityBody::Buffered(Bytes::new()),
            ContentProducer::Static(bytes) => EntityBody::Buffered(bytes.clone()),
            ContentProducer::Thunk(thunk) => {
                EntityBody::Buffered(Bytes::from(thunk().map_err(InterceptError::Callback)?))
            }
            ContentProducer::AsyncThunk(thunk) => {
                let produced = tokio::select! {
                    _ = req.cancellation().cancelled() => return Err(InterceptError::Cancelled),
                    produced = thunk() => produced.map_err(InterceptError::Callback)?,
                };
                EntityBody::Buffered(Bytes::from(produced))
            }
            ContentProducer::Stream(open) => {
                EntityBody::Streamed(open().map_err(InterceptError::Callback)?)
            }
        };

        Ok(InterceptedResponse {
            status: self.status,
            reason: self.reason.clone(),
            version: self.version,
            message_headers,
            entity_headers,
            body,
        })
    }
}

impl fmt::Debug for Recipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Recipe")
            .field("key", &self.key)
            .field("predicate", &self.predicate)
            .field("priority", &self.priority)
            .field("status", &self.status)
            .field("reusable", &self.reusable)
            .field("content", &self.content)
            .finish()
    }
}

/// Entity body of a synthesized response
pub enum EntityBody {
    Buffered(Bytes),
    Streamed(BodyReader),
}

impl EntityBody {
    /// Collect the body into memory (drains streamed bodies)
    pub async fn bytes(self) -> io::Result<Bytes> {
        match self {
            EntityBody::Buffered(bytes) => Ok(bytes),
            EntityBody::Streamed(mut reader) => {
                let mut buf = Vec::new();
                reader.read_to_end(&mut buf).await?;
                Ok(Bytes::from(buf))
            }
        }
    }

    pub(crate) fn into_http_body(self) -> BoxBody<Bytes, io::Error> {
        match self {
            EntityBody::Buffered(bytes) => Full::new(bytes).map_err(io::Error::other).boxed(),
            EntityBody::Streamed(reader) => {
                StreamBody::new(ReaderStream::new(reader).map_ok(Frame::data)).boxed()
            }
        }
    }
}

impl fmt::Debug for EntityBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityBody::Buffered(bytes) => write!(f, "Buffered({} bytes)", bytes.len()),
            EntityBody::Streamed(_) => f.write_str("Streamed(..)"),
        }
    }
}

/// Structured response handed back to the host client.
///
/// Message headers and entity headers are kept apart so hosts that model
/// the split (content headers on the entity) can route them; wire-shaped
/// hosts get both merged by [`InterceptedResponse::into_http_response`].
#[derive(Debug)]
pub struct InterceptedResponse {
    pub status: StatusCode,
    pub reason: Option<String>,
    pub version: Option<Version>,
    pub message_headers: HeaderMap,
    pub entity_headers: HeaderMap,
    pub body: EntityBody,
}

impl InterceptedResponse {
    /// The permissive-mode sentinel: empty 200 with no headers
    pub fn empty_ok() -> Self {
        Self {
            status: StatusCode::OK,
            reason: None,
            version: None,
            message_headers: HeaderMap::new(),
            entity_headers: HeaderMap::new(),
            body: EntityBody::Buffered(Bytes::new()),
        }
    }

    /// Collect the entity body into memory
    pub async fn bytes(self) -> io::Result<Bytes> {
        self.body.bytes().await
    }

    /// Convert into a wire-shaped `hyper` response with entity headers
    /// appended after message headers.
    ///
    /// The `http` response type carries no custom reason phrase, so
    /// `reason` is dropped at this seam.
    pub fn into_http_response(self) -> Response<BoxBody<Bytes, io::Error>> {
        let mut builder = Response::builder().status(self.status);
        if let Some(version) = self.version {
            builder = builder.version(version);
        }
        let mut response = builder
            .body(self.body.into_http_body())
            .expect("status and version are always valid");
        let headers = response.headers_mut();
        for (name, value) in self.message_headers.iter() {
            headers.append(name.clone(), value.clone());
        }
        for (name, value) in self.entity_headers.iter() {
            headers.append(name.clone(), value.clone());
        }
        response
    }
}
