//! Failure kinds surfaced by the interception core

use hyper::{Method, Uri};
use std::error::Error;
use std::fmt;

/// Boxed user-origin error, carried through unchanged
pub type BoxError = Box<dyn Error + Send + Sync>;

/// Errors produced while dispatching or configuring interceptions
#[derive(Debug)]
pub enum InterceptError {
    /// No recipe accepted the request and the registry is strict
    UnmatchedRequest { method: Method, uri: Uri },
    /// A user callback, header thunk, content thunk or stream opener failed
    Callback(BoxError),
    /// The request's cancellation signal fired during dispatch
    Cancelled,
    /// `end_scope` called out of order or with a stale handle
    ScopeMisuse(String),
    /// A builder was registered in an inconsistent state
    BuilderMisuse(String),
    /// A bundle document failed to parse or had an invalid shape
    Bundle(String),
}

impl fmt::Display for InterceptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InterceptError::UnmatchedRequest { method, uri } => {
                write!(f, "no registered recipe matched {} {}", method, uri)
            }
            InterceptError::Callback(err) => write!(f, "user callback failed: {}", err),
            InterceptError::Cancelled => write!(f, "request was cancelled during dispatch"),
            InterceptError::ScopeMisuse(msg) => write!(f, "scope misuse: {}", msg),
            InterceptError::BuilderMisuse(msg) => write!(f, "builder misuse: {}", msg),
            InterceptError::Bundle(msg) => write!(f, "bundle error: {}", msg),
        }
    }
}

impl Error for InterceptError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            InterceptError::Callback(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for InterceptError {
    fn from(err: serde_json::Error) -> Self {
        InterceptError::Bundle(err.to_string())
    }
}
