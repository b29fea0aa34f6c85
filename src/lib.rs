//! In-process HTTP request interception for tests.
//!
//! Instead of dispatching an outgoing request over the network, the host
//! client hands it to an [`InterceptHook`]; the hook resolves it against a
//! [`Registry`] of pre-declared request-response recipes and synthesizes
//! the response locally. No server is started and no port is bound.
//!
//! ```no_run
//! use interpose::{dispatch, BodyBuffer, InterceptedRequest, RecipeBuilder, Registry};
//! use interpose::hyper::{HeaderMap, Method, StatusCode};
//!
//! # async fn demo() -> Result<(), interpose::InterceptError> {
//! let registry = Registry::new();
//!
//! RecipeBuilder::new()
//!     .requests()
//!     .for_method(Method::GET)
//!     .for_uri("https://api.example/terms")
//!     .responds()
//!     .with_status(StatusCode::OK)
//!     .with_media_type("application/json")
//!     .with_content(r#"{"id":1}"#)
//!     .register_with(&registry)
//!     .await?;
//!
//! let request = InterceptedRequest::new(
//!     Method::GET,
//!     "https://api.example/terms".parse().unwrap(),
//!     HeaderMap::new(),
//!     BodyBuffer::empty(),
//! );
//! let response = dispatch(&registry, &request).await?;
//! assert_eq!(response.status, StatusCode::OK);
//! # Ok(())
//! # }
//! ```

pub mod builder;
pub mod bundle;
pub mod dispatcher;
pub mod error;
pub mod hook;
pub mod matcher;
pub mod recipe;
pub mod registry;
pub mod request;

pub use builder::RecipeBuilder;
pub use bundle::Bundle;
pub use dispatcher::dispatch;
pub use error::{BoxError, InterceptError};
pub use hook::InterceptHook;
pub use matcher::{CanonicalKey, KeyComponent, QueryKey, RequestPredicate, SubMatcher};
pub use recipe::{
    BodyReader, ContentProducer, EntityBody, InterceptedResponse, Recipe, UserData,
};
pub use registry::{
    MissingRecipeFallback, RecipeHandle, Registry, ResponseMutator, ScopeHandle,
};
pub use request::{BodyBuffer, InterceptedRequest};

pub use http_body_util;
pub use hyper;
pub use tokio;
pub use tokio_util;
