//! Read-only view of an outgoing request, with a replayable body

use hyper::body::Bytes;
use hyper::{HeaderMap, Method, Uri};
use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

enum BodyState {
    Buffered(Bytes),
    Unread(Pin<Box<dyn AsyncRead + Send>>),
}

/// Request body that buffers once on first read and replays the same bytes
/// to every later reader (content predicates, callbacks). Clones share the
/// buffer, so a body drained through one clone is replayed by all.
///
/// Buffering is unbounded: the host test constructed the body in memory to
/// begin with, so no size cap is enforced.
#[derive(Clone)]
pub struct BodyBuffer {
    state: Arc<Mutex<BodyState>>,
}

impl BodyBuffer {
    /// An empty body
    pub fn empty() -> Self {
        Self::from_bytes(Bytes::new())
    }

    /// A body backed by ready bytes
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        Self {
            state: Arc::new(Mutex::new(BodyState::Buffered(bytes.into()))),
        }
    }

    /// A body backed by an unread stream; drained into memory on first read
    pub fn from_reader(reader: impl AsyncRead + Send + 'static) -> Self {
        Self {
            state: Arc::new(Mutex::new(BodyState::Unread(Box::pin(reader)))),
        }
    }

    /// Read the full body. The first call drains the underlying stream;
    /// every call observes identical bytes.
    pub async fn bytes(&self) -> io::Result<Bytes> {
        let mut state = self.state.lock().await;
        match &mut *state {
            BodyState::Buffered(bytes) => Ok(bytes.clone()),
            BodyState::Unread(reader) => {
                let mut buf = Vec::new();
                reader.read_to_end(&mut buf).await?;
                let bytes = Bytes::from(buf);
                *state = BodyState::Buffered(bytes.clone());
                Ok(bytes)
            }
        }
    }
}

impl Default for BodyBuffer {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for BodyBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BodyBuffer")
    }
}

/// An outgoing HTTP request as handed to the core by the host client.
///
/// The core never mutates it; the body is readable any number of times
/// through [`BodyBuffer`]. Cloning is cheap and clones share the body
/// buffer and cancellation signal, which is how owned copies reach async
/// user callbacks.
#[derive(Clone, Debug)]
pub struct InterceptedRequest {
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: BodyBuffer,
    cancellation: CancellationToken,
}

impl InterceptedRequest {
    pub fn new(method: Method, uri: Uri, headers: HeaderMap, body: BodyBuffer) -> Self {
        Self {
            method,
            uri,
            headers,
            body,
            cancellation: CancellationToken::new(),
        }
    }

    /// Attach the host's cancellation signal
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &BodyBuffer {
        &self.body
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Scheme of the target URI; absolute-form requests without a scheme
    /// are treated as plain http
    pub fn scheme(&self) -> &str {
        self.uri.scheme_str().unwrap_or("http")
    }

    pub fn host(&self) -> &str {
        self.uri.host().unwrap_or("")
    }

    pub fn port(&self) -> Option<u16> {
        self.uri.port_u16()
    }

    pub fn path(&self) -> &str {
        self.uri.path()
    }

    pub fn query(&self) -> Option<&str> {
        self.uri.query()
    }
}
