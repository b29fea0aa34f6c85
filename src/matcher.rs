//! Request matching: canonical keys and attached sub-matchers

use crate::request::InterceptedRequest;
use futures::future::BoxFuture;
use hyper::body::Bytes;
use hyper::header::HeaderName;
use hyper::{HeaderMap, Method};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::io;
use std::sync::Arc;

/// One component of a canonical key: either a wildcard or a concrete value
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyComponent<T> {
    Any,
    Is(T),
}

impl<T: PartialEq> KeyComponent<T> {
    fn covers(&self, concrete: &T) -> bool {
        match self {
            KeyComponent::Any => true,
            KeyComponent::Is(value) => value == concrete,
        }
    }
}

/// Query comparison style chosen at build time
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum QueryKey {
    /// The query string must match verbatim (absence compares as "")
    Verbatim(String),
    /// The query must carry exactly this multiset of `k=v` pairs, order-free
    Params(BTreeMap<String, Vec<String>>),
}

/// The identity of a fluent-built recipe: `(method, scheme, host, port,
/// path, query)` with per-component wildcards.
///
/// Two recipes with equal keys occupy the same registry slot in a scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CanonicalKey {
    pub method: KeyComponent<Method>,
    pub scheme: KeyComponent<String>,
    pub host: KeyComponent<String>,
    pub port: KeyComponent<u16>,
    pub path: KeyComponent<String>,
    pub query: KeyComponent<QueryKey>,
}

impl CanonicalKey {
    /// A key that matches every request
    pub fn any() -> Self {
        Self {
            method: KeyComponent::Any,
            scheme: KeyComponent::Any,
            host: KeyComponent::Any,
            port: KeyComponent::Any,
            path: KeyComponent::Any,
            query: KeyComponent::Any,
        }
    }

    /// Componentwise match against the concrete key of a request
    pub fn covers(&self, req: &RequestKey) -> bool {
        if !self.method.covers(&req.method)
            || !self.scheme.covers(&req.scheme)
            || !self.host.covers(&req.host)
        {
            return false;
        }
        match &self.port {
            KeyComponent::Any => {}
            KeyComponent::Is(port) => {
                if req.port != Some(*port) {
                    return false;
                }
            }
        }
        if !self.path.covers(&req.path) {
            return false;
        }
        match &self.query {
            KeyComponent::Any => true,
            KeyComponent::Is(QueryKey::Verbatim(expected)) => {
                expected == req.raw_query.as_deref().unwrap_or("")
            }
            KeyComponent::Is(QueryKey::Params(expected)) => {
                *expected == parse_query_params(req.raw_query.as_deref().unwrap_or(""))
            }
        }
    }
}

/// Concrete (wildcard-free) key derived from a request at lookup time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestKey {
    pub method: Method,
    pub scheme: String,
    pub host: String,
    pub port: Option<u16>,
    pub path: String,
    pub raw_query: Option<String>,
}

impl RequestKey {
    pub fn of(req: &InterceptedRequest) -> Self {
        let scheme = req.scheme().to_ascii_lowercase();
        let port = req.port().or_else(|| default_port(&scheme));
        Self {
            method: req.method().clone(),
            scheme,
            host: req.host().to_ascii_lowercase(),
            port,
            path: canonical_path(req.path()),
            raw_query: req.query().map(|q| q.to_string()),
        }
    }
}

/// Well-known default ports; other schemes keep their port unresolved
pub(crate) fn default_port(scheme: &str) -> Option<u16> {
    match scheme {
        "http" => Some(80),
        "https" => Some(443),
        _ => None,
    }
}

/// Canonicalize a request path: single leading slash, percent-decoding of
/// unreserved octets only (reserved octets stay encoded so `/a%2Fb` and
/// `/a/b` remain distinct)
pub(crate) fn canonical_path(raw: &str) -> String {
    let trimmed = raw.trim_start_matches('/');
    let bytes = trimmed.as_bytes();
    let mut out = Vec::with_capacity(trimmed.len() + 1);
    out.push(b'/');
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let (Some(hi), Some(lo)) = (hex_value(bytes[i + 1]), hex_value(bytes[i + 2])) {
                let decoded = hi * 16 + lo;
                if decoded.is_ascii_alphanumeric() || matches!(decoded, b'-' | b'.' | b'_' | b'~') {
                    out.push(decoded);
                    i += 3;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    // decoded octets are ASCII, the rest was valid UTF-8 already
    String::from_utf8(out).unwrap_or_else(|_| format!("/{}", trimmed))
}

fn hex_value(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}

/// Split a query string into an order-free multiset of pairs.
/// A bare `k` (no `=`) is recorded as `k` with an empty value.
pub(crate) fn parse_query_params(query: &str) -> BTreeMap<String, Vec<String>> {
    let mut params: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for pair in query.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        params
            .entry(key.to_string())
            .or_default()
            .push(value.to_string());
    }
    for values in params.values_mut() {
        values.sort();
    }
    params
}

/// Predicate over the buffered request body
pub type ContentPredicate = Arc<dyn Fn(&Bytes) -> bool + Send + Sync>;

/// Sub-matchers attached to a recipe on top of its canonical key.
/// All attached sub-matchers must accept for the recipe to match.
#[derive(Clone)]
pub enum SubMatcher {
    /// Header must be present and its value list must equal `values` as a
    /// set (names and values compared case-insensitively). An empty list
    /// means "present with any value".
    Header {
        name: HeaderName,
        values: Vec<String>,
    },
    /// Predicate over the request body; reads through the replay buffer
    Content(ContentPredicate),
    /// Predicate over the whole request
    Request(Arc<dyn Fn(&InterceptedRequest) -> bool + Send + Sync>),
}

impl SubMatcher {
    pub async fn accepts(&self, req: &InterceptedRequest) -> io::Result<bool> {
        match self {
            SubMatcher::Header { name, values } => Ok(header_matches(req.headers(), name, values)),
            SubMatcher::Content(predicate) => {
                let body = req.body().bytes().await?;
                Ok(predicate(&body))
            }
            SubMatcher::Request(predicate) => Ok(predicate(req)),
        }
    }
}

impl fmt::Debug for SubMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubMatcher::Header { name, values } => f
                .debug_struct("Header")
                .field("name", name)
                .field("values", values)
                .finish(),
            SubMatcher::Content(_) => f.write_str("Content(..)"),
            SubMatcher::Request(_) => f.write_str("Request(..)"),
        }
    }
}

fn header_matches(headers: &HeaderMap, name: &HeaderName, expected: &[String]) -> bool {
    if !headers.contains_key(name) {
        return false;
    }
    if expected.is_empty() {
        // presence with any value
        return true;
    }
    let actual: BTreeSet<String> = headers
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase())
        .collect();
    let wanted: BTreeSet<String> = expected.iter().map(|v| v.to_ascii_lowercase()).collect();
    actual == wanted
}

/// Describable precondition signature of a recipe: its header matchers in
/// canonical order, or `None` when any attached matcher is an opaque
/// predicate (two opaque predicates can never be proven equal, so such
/// recipes are never treated as re-registrations of one another).
pub(crate) fn matcher_fingerprint(matchers: &[SubMatcher]) -> Option<Vec<(String, Vec<String>)>> {
    let mut fingerprint = Vec::with_capacity(matchers.len());
    for matcher in matchers {
        match matcher {
            SubMatcher::Header { name, values } => {
                let mut values: Vec<String> =
                    values.iter().map(|v| v.to_ascii_lowercase()).collect();
                values.sort();
                fingerprint.push((name.as_str().to_string(), values));
            }
            SubMatcher::Content(_) | SubMatcher::Request(_) => return None,
        }
    }
    fingerprint.sort();
    Some(fingerprint)
}

/// Short-circuit conjunction over attached sub-matchers
pub(crate) async fn match_all(
    matchers: &[SubMatcher],
    req: &InterceptedRequest,
) -> io::Result<bool> {
    for matcher in matchers {
        if !matcher.accepts(req).await? {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Free-form matcher for recipes that cannot be keyed.
///
/// The async variant receives an owned (cheaply cloned) request so the
/// future it returns borrows nothing.
#[derive(Clone)]
pub enum RequestPredicate {
    Sync(Arc<dyn Fn(&InterceptedRequest) -> bool + Send + Sync>),
    Async(Arc<dyn Fn(InterceptedRequest) -> BoxFuture<'static, bool> + Send + Sync>),
}

impl RequestPredicate {
    pub async fn accepts(&self, req: &InterceptedRequest) -> bool {
        match self {
            RequestPredicate::Sync(predicate) => predicate(req),
            RequestPredicate::Async(predicate) => predicate(req.clone()).await,
        }
    }
}

impl fmt::Debug for RequestPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestPredicate::Sync(_) => f.write_str("RequestPredicate::Sync(..)"),
            RequestPredicate::Async(_) => f.write_str("RequestPredicate::Async(..)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{BodyBuffer, InterceptedRequest};
    use hyper::header::{HeaderValue, ACCEPT};
    use hyper::Uri;

    fn request(method: Method, uri: &str) -> InterceptedRequest {
        InterceptedRequest::new(
            method,
            uri.parse::<Uri>().unwrap(),
            HeaderMap::new(),
            BodyBuffer::empty(),
        )
    }

    #[test]
    fn test_canonical_path_normalization() {
        assert_eq!(canonical_path(""), "/");
        assert_eq!(canonical_path("/"), "/");
        assert_eq!(canonical_path("terms"), "/terms");
        assert_eq!(canonical_path("//terms"), "/terms");
        // unreserved octets decode
        assert_eq!(canonical_path("/a%41b"), "/aAb");
        assert_eq!(canonical_path("/x%7Ey"), "/x~y");
        // reserved octets stay encoded
        assert_eq!(canonical_path("/a%2Fb"), "/a%2Fb");
        assert_eq!(canonical_path("/a%20b"), "/a%20b");
    }

    #[test]
    fn test_parse_query_params_is_order_free() {
        let left = parse_query_params("a=1&b=2&a=0");
        let right = parse_query_params("b=2&a=0&a=1");
        assert_eq!(left, right);
        assert_eq!(left.get("a").unwrap(), &vec!["0".to_string(), "1".to_string()]);
    }

    #[test]
    fn test_request_key_defaults_port_from_scheme() {
        let key = RequestKey::of(&request(Method::GET, "https://API.Example/terms"));
        assert_eq!(key.scheme, "https");
        assert_eq!(key.host, "api.example");
        assert_eq!(key.port, Some(443));
        assert_eq!(key.path, "/terms");
    }

    #[test]
    fn test_canonical_key_wildcards() {
        let mut key = CanonicalKey::any();
        key.host = KeyComponent::Is("api.example".to_string());
        let req = RequestKey::of(&request(Method::GET, "http://api.example/anything?x=1"));
        assert!(key.covers(&req));

        key.method = KeyComponent::Is(Method::POST);
        assert!(!key.covers(&req));
    }

    #[test]
    fn test_query_param_set_matching() {
        let mut key = CanonicalKey::any();
        key.query = KeyComponent::Is(QueryKey::Params(parse_query_params("b=2&a=1")));
        assert!(key.covers(&RequestKey::of(&request(Method::GET, "http://h/p?a=1&b=2"))));
        assert!(!key.covers(&RequestKey::of(&request(Method::GET, "http://h/p?a=1"))));
    }

    #[tokio::test]
    async fn test_header_matcher_is_case_insensitive() {
        let matcher = SubMatcher::Header {
            name: ACCEPT,
            values: vec!["application/json".to_string()],
        };

        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("APPLICATION/JSON"));
        let req = InterceptedRequest::new(
            Method::GET,
            "http://h/".parse().unwrap(),
            headers,
            BodyBuffer::empty(),
        );
        assert!(matcher.accepts(&req).await.unwrap());

        let bare = request(Method::GET, "http://h/");
        assert!(!matcher.accepts(&bare).await.unwrap());
    }

    #[tokio::test]
    async fn test_empty_expected_list_means_presence() {
        let matcher = SubMatcher::Header {
            name: ACCEPT,
            values: Vec::new(),
        };
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("anything"));
        let req = InterceptedRequest::new(
            Method::GET,
            "http://h/".parse().unwrap(),
            headers,
            BodyBuffer::empty(),
        );
        assert!(matcher.accepts(&req).await.unwrap());
    }

    #[tokio::test]
    async fn test_content_predicate_reads_through_replay_buffer() {
        let req = InterceptedRequest::new(
            Method::POST,
            "http://h/".parse().unwrap(),
            HeaderMap::new(),
            BodyBuffer::from_reader(std::io::Cursor::new(b"payload".to_vec())),
        );
        let matcher = SubMatcher::Content(Arc::new(|body: &Bytes| body.as_ref() == b"payload"));
        assert!(matcher.accepts(&req).await.unwrap());
        // the body is still readable afterwards, with identical bytes
        assert_eq!(req.body().bytes().await.unwrap().as_ref(), b"payload");
    }
}
