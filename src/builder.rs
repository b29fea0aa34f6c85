//! Fluent assembly of recipes
//!
//! The builder is deliberately mutable so one builder can be tweaked and
//! re-registered many times; [`RecipeBuilder::register_with`] snapshots it,
//! so recipes already in a registry never see later mutations.

use crate::error::{BoxError, InterceptError};
use crate::matcher::{
    canonical_path, default_port, parse_query_params, CanonicalKey, ContentPredicate,
    KeyComponent, QueryKey, RequestPredicate, SubMatcher,
};
use crate::recipe::{
    AsyncContentThunk, BodyReader, ContentProducer, ContentThunk, HeaderSource, HeaderThunk,
    InterceptCallback, Recipe, UserData,
};
use crate::registry::{RecipeHandle, Registry};
use crate::request::InterceptedRequest;
use futures::future::BoxFuture;
use hyper::body::Bytes;
use hyper::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use hyper::{Method, StatusCode, Uri, Version};
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;

/// Fluent builder for [`Recipe`]s.
///
/// Precondition setters (`for_*`, `matching*`) describe what to match;
/// postcondition setters (`with_*`, `single_use`) describe the response.
/// The [`RecipeBuilder::requests`] and [`RecipeBuilder::responds`] markers
/// separate the two phases in chained call sites and do nothing else.
///
/// Setters that parse user input never fail in place; the first defect is
/// remembered and reported by [`RecipeBuilder::register_with`].
#[derive(Clone, Default)]
pub struct RecipeBuilder {
    method: Option<Method>,
    scheme: Option<String>,
    host: Option<String>,
    port: Option<u16>,
    path: Option<String>,
    query: Option<QueryKey>,
    predicate: Option<RequestPredicate>,
    matchers: Vec<SubMatcher>,
    priority: Option<u32>,
    status: Option<StatusCode>,
    reason: Option<String>,
    version: Option<Version>,
    response_headers: HeaderSource,
    content_headers: HeaderSource,
    content: Option<ContentProducer>,
    callback: Option<InterceptCallback>,
    delay: Option<Duration>,
    single_use: bool,
    user_data: UserData,
    defect: Option<String>,
}

impl RecipeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Phase marker: the setters that follow describe the request
    pub fn requests(self) -> Self {
        self
    }

    /// Phase marker: the setters that follow describe the response
    pub fn responds(self) -> Self {
        self
    }

    // --- preconditions -----------------------------------------------------

    pub fn for_method(mut self, method: Method) -> Self {
        self.method = Some(method);
        self
    }

    pub fn for_any_method(mut self) -> Self {
        self.method = None;
        self
    }

    pub fn for_scheme(mut self, scheme: &str) -> Self {
        self.scheme = Some(scheme.to_ascii_lowercase());
        self
    }

    pub fn for_host(mut self, host: &str) -> Self {
        self.host = Some(host.to_ascii_lowercase());
        self
    }

    /// Widen the key so any host matches; the port is widened with it,
    /// since a pinned port rarely survives a host change
    pub fn for_any_host(mut self) -> Self {
        self.host = None;
        self.port = None;
        self
    }

    /// Widen only the host component, leaving a pinned port in place.
    /// Used by the bundle loader, whose `ignoreHost` flag substitutes
    /// "any" for the host field alone.
    pub(crate) fn for_any_host_only(mut self) -> Self {
        self.host = None;
        self
    }

    pub fn for_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn for_path(mut self, path: &str) -> Self {
        self.path = Some(canonical_path(path));
        self
    }

    /// Widen the key so any path matches
    pub fn for_any_path(mut self) -> Self {
        self.path = None;
        self
    }

    /// Widen the key so any query matches
    pub fn for_any_query(mut self) -> Self {
        self.query = None;
        self
    }

    /// Require this exact query string (a leading `?` is tolerated)
    pub fn for_query(mut self, query: &str) -> Self {
        self.query = Some(QueryKey::Verbatim(
            query.strip_prefix('?').unwrap_or(query).to_string(),
        ));
        self
    }

    /// Require this set of query parameters, in any order
    pub fn for_query_params<'a>(mut self, params: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let joined = params
            .into_iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&");
        self.query = Some(QueryKey::Params(parse_query_params(&joined)));
        self
    }

    /// Decompose an absolute URI into scheme, host, port, path and verbatim
    /// query components
    pub fn for_uri(mut self, uri: &str) -> Self {
        let parsed: Uri = match uri.parse() {
            Ok(parsed) => parsed,
            Err(err) => {
                return self.with_defect(format!("invalid uri '{}': {}", uri, err));
            }
        };
        let Some(host) = parsed.host() else {
            return self.with_defect(format!("uri '{}' has no host", uri));
        };
        let scheme = parsed.scheme_str().unwrap_or("http").to_ascii_lowercase();
        self.port = parsed.port_u16().or_else(|| default_port(&scheme));
        self.host = Some(host.to_ascii_lowercase());
        self.scheme = Some(scheme);
        self.path = Some(canonical_path(parsed.path()));
        self.query = Some(QueryKey::Verbatim(
            parsed.query().unwrap_or("").to_string(),
        ));
        self
    }

    /// Require a header. An empty value list means "present with any
    /// value"; otherwise the request's values must equal the list as a set.
    pub fn for_header<'a>(
        mut self,
        name: &str,
        values: impl IntoIterator<Item = &'a str>,
    ) -> Self {
        let name = match HeaderName::try_from(name) {
            Ok(name) => name,
            Err(err) => {
                return self.with_defect(format!("invalid header name '{}': {}", name, err));
            }
        };
        self.matchers.push(SubMatcher::Header {
            name,
            values: values.into_iter().map(str::to_string).collect(),
        });
        self
    }

    /// Attach a predicate over the buffered request body
    pub fn for_content(mut self, predicate: impl Fn(&Bytes) -> bool + Send + Sync + 'static) -> Self {
        self.matchers
            .push(SubMatcher::Content(Arc::new(predicate) as ContentPredicate));
        self
    }

    /// Attach a predicate over the whole request, on top of the canonical key
    pub fn for_request(
        mut self,
        predicate: impl Fn(&InterceptedRequest) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.matchers.push(SubMatcher::Request(Arc::new(predicate)));
        self
    }

    /// Replace key-based matching with a free-form predicate; the recipe
    /// joins the registry's predicate list and competes by priority.
    pub fn matching(
        mut self,
        predicate: impl Fn(&InterceptedRequest) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.predicate = Some(RequestPredicate::Sync(Arc::new(predicate)));
        self
    }

    /// Free-form predicate that may suspend (e.g. to read the body).
    /// Receives an owned request clone sharing the original's body buffer.
    pub fn matching_async(
        mut self,
        predicate: impl Fn(InterceptedRequest) -> BoxFuture<'static, bool> + Send + Sync + 'static,
    ) -> Self {
        self.predicate = Some(RequestPredicate::Async(Arc::new(predicate)));
        self
    }

    /// Rank this recipe among predicate recipes; absent means lowest
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = Some(priority);
        self
    }

    // --- postconditions ----------------------------------------------------

    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_reason(mut self, reason: &str) -> Self {
        self.reason = Some(reason.to_string());
        self
    }

    pub fn with_version(mut self, version: Version) -> Self {
        self.version = Some(version);
        self
    }

    /// Respond with fixed bytes
    pub fn with_content(mut self, content: impl Into<Bytes>) -> Self {
        self.content = Some(ContentProducer::Static(content.into()));
        self
    }

    /// Respond with bytes produced fresh on every dispatch
    pub fn with_content_fn(
        mut self,
        thunk: impl Fn() -> Result<Vec<u8>, BoxError> + Send + Sync + 'static,
    ) -> Self {
        self.content = Some(ContentProducer::Thunk(Arc::new(thunk) as ContentThunk));
        self
    }

    /// Respond with bytes produced by an async thunk on every dispatch
    pub fn with_content_async(
        mut self,
        thunk: impl Fn() -> BoxFuture<'static, Result<Vec<u8>, BoxError>> + Send + Sync + 'static,
    ) -> Self {
        self.content = Some(ContentProducer::AsyncThunk(
            Arc::new(thunk) as AsyncContentThunk
        ));
        self
    }

    /// Respond by opening a fresh readable stream on every dispatch
    pub fn with_content_stream(
        mut self,
        open: impl Fn() -> Result<BodyReader, BoxError> + Send + Sync + 'static,
    ) -> Self {
        self.content = Some(ContentProducer::Stream(Arc::new(open)));
        self
    }

    pub fn with_response_header(mut self, name: &str, value: &str) -> Self {
        match parse_header(name, value) {
            Ok((name, value)) => {
                self.response_headers.fixed.append(name, value);
                self
            }
            Err(defect) => self.with_defect(defect),
        }
    }

    /// Produce response message headers at dispatch time; thunk output
    /// replaces static entries of the same name
    pub fn with_response_headers_fn(
        mut self,
        thunk: impl Fn() -> Result<hyper::HeaderMap, BoxError> + Send + Sync + 'static,
    ) -> Self {
        self.response_headers.thunk = Some(Arc::new(thunk) as HeaderThunk);
        self
    }

    pub fn with_content_header(mut self, name: &str, value: &str) -> Self {
        match parse_header(name, value) {
            Ok((name, value)) => {
                self.content_headers.fixed.append(name, value);
                self
            }
            Err(defect) => self.with_defect(defect),
        }
    }

    /// Produce entity headers at dispatch time
    pub fn with_content_headers_fn(
        mut self,
        thunk: impl Fn() -> Result<hyper::HeaderMap, BoxError> + Send + Sync + 'static,
    ) -> Self {
        self.content_headers.thunk = Some(Arc::new(thunk) as HeaderThunk);
        self
    }

    /// Shorthand for a `Content-Type` entity header
    pub fn with_media_type(mut self, media_type: &str) -> Self {
        match HeaderValue::try_from(media_type) {
            Ok(value) => {
                self.content_headers.fixed.insert(CONTENT_TYPE, value);
                self
            }
            Err(err) => self.with_defect(format!("invalid media type '{}': {}", media_type, err)),
        }
    }

    /// Observe the request before the response is synthesized; an error
    /// aborts the dispatch and propagates unchanged
    pub fn with_callback(
        mut self,
        callback: impl Fn(&InterceptedRequest, &UserData) -> Result<(), BoxError>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.callback = Some(InterceptCallback::Sync(Arc::new(callback)));
        self
    }

    /// Async pre-dispatch callback; receives owned copies so the returned
    /// future borrows nothing
    pub fn with_callback_async(
        mut self,
        callback: impl Fn(InterceptedRequest, UserData) -> BoxFuture<'static, Result<(), BoxError>>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.callback = Some(InterceptCallback::Async(Arc::new(callback)));
        self
    }

    /// Sleep this long before synthesizing, cancellable by the request
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Consume the recipe after its first dispatch
    pub fn single_use(mut self) -> Self {
        self.single_use = true;
        self
    }

    /// Attach an opaque value handed to callbacks
    pub fn with_user_data(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.user_data.insert(key.to_string(), value.into());
        self
    }

    // --- registration ------------------------------------------------------

    /// Snapshot the builder into a [`Recipe`] and install it. The builder
    /// stays usable: mutate it further and register again without touching
    /// recipes already installed.
    pub async fn register_with(&self, registry: &Registry) -> Result<RecipeHandle, InterceptError> {
        let recipe = self.build()?;
        Ok(registry.register(recipe).await)
    }

    /// Snapshot without registering
    pub fn build(&self) -> Result<Recipe, InterceptError> {
        if let Some(defect) = &self.defect {
            return Err(InterceptError::BuilderMisuse(defect.clone()));
        }
        let key = if self.predicate.is_some() {
            None
        } else {
            Some(CanonicalKey {
                method: component(self.method.clone()),
                scheme: component(self.scheme.clone()),
                host: component(self.host.clone()),
                port: component(self.port),
                path: component(self.path.clone()),
                query: component(self.query.clone()),
            })
        };
        Ok(Recipe {
            key,
            predicate: self.predicate.clone(),
            matchers: self.matchers.clone(),
            priority: self.priority,
            status: self.status.unwrap_or(StatusCode::OK),
            reason: self.reason.clone(),
            version: self.version,
            response_headers: self.response_headers.clone(),
            content_headers: self.content_headers.clone(),
            content: self.content.clone().unwrap_or(ContentProducer::Empty),
            callback: self.callback.clone(),
            delay: self.delay,
            reusable: !self.single_use,
            user_data: self.user_data.clone(),
            hits: AtomicU64::new(0),
        })
    }

    fn with_defect(mut self, defect: String) -> Self {
        if self.defect.is_none() {
            self.defect = Some(defect);
        }
        self
    }
}

fn component<T>(value: Option<T>) -> KeyComponent<T> {
    match value {
        Some(value) => KeyComponent::Is(value),
        None => KeyComponent::Any,
    }
}

fn parse_header(name: &str, value: &str) -> Result<(HeaderName, HeaderValue), String> {
    let name = HeaderName::try_from(name)
        .map_err(|err| format!("invalid header name '{}': {}", name, err))?;
    let value = HeaderValue::try_from(value)
        .map_err(|err| format!("invalid header value for '{}': {}", name, err))?;
    Ok((name, value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::RequestKey;
    use crate::request::BodyBuffer;
    use hyper::HeaderMap;

    fn request_key(method: Method, uri: &str) -> RequestKey {
        RequestKey::of(&InterceptedRequest::new(
            method,
            uri.parse().unwrap(),
            HeaderMap::new(),
            BodyBuffer::empty(),
        ))
    }

    #[test]
    fn test_for_uri_decomposes_components() {
        let recipe = RecipeBuilder::new()
            .for_method(Method::GET)
            .for_uri("https://API.Example/terms")
            .build()
            .unwrap();

        let key = recipe.key.expect("keyed recipe");
        assert!(key.covers(&request_key(Method::GET, "https://api.example/terms")));
        assert!(!key.covers(&request_key(Method::GET, "https://api.example/other")));
        assert!(!key.covers(&request_key(Method::POST, "https://api.example/terms")));
        // explicit default port is the same key
        assert!(key.covers(&request_key(Method::GET, "https://api.example:443/terms")));
    }

    #[test]
    fn test_unset_components_are_wildcards() {
        let recipe = RecipeBuilder::new()
            .for_host("api.example")
            .build()
            .unwrap();
        let key = recipe.key.expect("keyed recipe");
        assert!(key.covers(&request_key(Method::GET, "http://api.example/")));
        assert!(key.covers(&request_key(Method::DELETE, "https://api.example/x?y=1")));
        assert!(!key.covers(&request_key(Method::GET, "http://other.example/")));
    }

    #[test]
    fn test_invalid_uri_reports_at_build_time() {
        let result = RecipeBuilder::new().for_uri("not a uri").build();
        match result {
            Err(InterceptError::BuilderMisuse(msg)) => assert!(msg.contains("invalid uri")),
            other => panic!("expected BuilderMisuse, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_defect_keeps_first_error(){
        let result = RecipeBuilder::new()
            .for_header("bad name", ["x"])
            .for_uri("also bad")
            .build();
        match result {
            Err(InterceptError::BuilderMisuse(msg)) => assert!(msg.contains("header name")),
            other => panic!("expected BuilderMisuse, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_predicate_recipe_has_no_key() {
        let recipe = RecipeBuilder::new()
            .matching(|req| req.host().contains("google"))
            .with_priority(2)
            .build()
            .unwrap();
        assert!(recipe.key.is_none());
        assert_eq!(recipe.priority(), Some(2));
    }

    #[test]
    fn test_defaults() {
        let recipe = RecipeBuilder::new().build().unwrap();
        assert_eq!(recipe.status(), StatusCode::OK);
        assert!(recipe.is_reusable());
        assert!(matches!(recipe.content, ContentProducer::Empty));
    }
}
