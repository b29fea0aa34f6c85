//! Declarative recipe bundles: a stable JSON schema translated into
//! builder calls
//!
//! ```json
//! {
//!   "id": "payments",
//!   "version": 1,
//!   "items": [
//!     {
//!       "method": "GET",
//!       "uri": "https://api.example/terms",
//!       "contentFormat": "json",
//!       "contentJson": { "id": 1 }
//!     }
//!   ]
//! }
//! ```

use crate::builder::RecipeBuilder;
use crate::error::InterceptError;
use crate::registry::{RecipeHandle, Registry};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hyper::{Method, StatusCode, Version};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;

/// A parsed bundle document (schema version 1)
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bundle {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default = "schema_version")]
    pub version: u32,
    #[serde(default)]
    pub items: Vec<BundleItem>,
}

fn schema_version() -> u32 {
    1
}

/// String-or-array header values, as the schema allows both
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    fn values(&self) -> Vec<&str> {
        match self {
            OneOrMany::One(value) => vec![value.as_str()],
            OneOrMany::Many(values) => values.iter().map(String::as_str).collect(),
        }
    }
}

/// Integer status or a conventional status name such as `NotFound`
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum StatusValue {
    Code(u16),
    Name(String),
}

/// One request-response recipe in declarative form
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleItem {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub uri: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub status: Option<StatusValue>,
    #[serde(default)]
    pub request_headers: BTreeMap<String, OneOrMany>,
    #[serde(default)]
    pub response_headers: BTreeMap<String, OneOrMany>,
    #[serde(default)]
    pub content_headers: BTreeMap<String, OneOrMany>,
    #[serde(default)]
    pub content_format: Option<String>,
    #[serde(default)]
    pub content_string: Option<String>,
    #[serde(default)]
    pub content_json: Option<Value>,
    #[serde(default)]
    pub content_base64: Option<String>,
    #[serde(default)]
    pub ignore_host: bool,
    #[serde(default)]
    pub ignore_path: bool,
    #[serde(default)]
    pub ignore_query: bool,
    #[serde(default)]
    pub priority: Option<i64>,
    #[serde(default)]
    pub skip: bool,
}

impl Bundle {
    pub fn from_str(json: &str) -> Result<Self, InterceptError> {
        Self::validate(serde_json::from_str(json)?)
    }

    pub fn from_slice(json: &[u8]) -> Result<Self, InterceptError> {
        Self::validate(serde_json::from_slice(json)?)
    }

    pub fn from_value(json: Value) -> Result<Self, InterceptError> {
        Self::validate(serde_json::from_value(json)?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, InterceptError> {
        let json = std::fs::read(path.as_ref())
            .map_err(|err| InterceptError::Bundle(format!("cannot read bundle file: {}", err)))?;
        Self::from_slice(&json)
    }

    fn validate(bundle: Self) -> Result<Self, InterceptError> {
        if bundle.version != 1 {
            return Err(InterceptError::Bundle(format!(
                "unsupported bundle version {}",
                bundle.version
            )));
        }
        Ok(bundle)
    }

    /// Register every non-skipped item, in document order. Each item is
    /// translated into primitive builder calls and nothing else.
    pub async fn register_with(
        &self,
        registry: &Registry,
    ) -> Result<Vec<RecipeHandle>, InterceptError> {
        let mut handles = Vec::with_capacity(self.items.len());
        for (index, item) in self.items.iter().enumerate() {
            if item.skip {
                continue;
            }
            let builder = item.to_builder(index)?;
            handles.push(builder.register_with(registry).await?);
        }
        tracing::debug!(
            bundle = self.id.as_deref().unwrap_or("<unnamed>"),
            recipes = handles.len(),
            "bundle registered"
        );
        Ok(handles)
    }
}

impl BundleItem {
    /// Human-readable identity for error messages
    fn label(&self, index: usize) -> String {
        match &self.id {
            Some(id) => format!("item '{}'", id),
            None => format!("item #{}", index),
        }
    }

    fn to_builder(&self, index: usize) -> Result<RecipeBuilder, InterceptError> {
        let misuse =
            |msg: String| InterceptError::BuilderMisuse(format!("{}: {}", self.label(index), msg));

        let method = match &self.method {
            Some(method) => Method::from_bytes(method.to_ascii_uppercase().as_bytes())
                .map_err(|err| misuse(format!("invalid method '{}': {}", method, err)))?,
            None => Method::GET,
        };
        let uri = self
            .uri
            .as_deref()
            .ok_or_else(|| misuse("missing uri".to_string()))?;

        let mut builder = RecipeBuilder::new()
            .requests()
            .for_method(method)
            .for_uri(uri);
        if self.ignore_host {
            builder = builder.for_any_host_only();
        }
        if self.ignore_path {
            builder = builder.for_any_path();
        }
        if self.ignore_query {
            builder = builder.for_any_query();
        }
        for (name, values) in &self.request_headers {
            builder = builder.for_header(name, values.values());
        }
        if let Some(priority) = self.priority {
            let priority = u32::try_from(priority)
                .map_err(|_| misuse(format!("negative priority {}", priority)))?;
            builder = builder.with_priority(priority);
        }

        builder = builder.responds();
        if let Some(status) = &self.status {
            builder = builder.with_status(parse_status(status).map_err(misuse)?);
        }
        if let Some(version) = &self.version {
            builder = builder.with_version(parse_version(version).map_err(misuse)?);
        }
        for (name, values) in &self.response_headers {
            for value in values.values() {
                builder = builder.with_response_header(name, value);
            }
        }
        for (name, values) in &self.content_headers {
            for value in values.values() {
                builder = builder.with_content_header(name, value);
            }
        }

        let format = self.content_format.as_deref().unwrap_or("string");
        builder = match format {
            "string" => builder.with_content(self.content_string.clone().unwrap_or_default()),
            "json" => {
                let json = self.content_json.clone().unwrap_or(Value::Null);
                builder.with_content(serde_json::to_vec(&json)?)
            }
            "base64" => {
                let encoded = self.content_base64.as_deref().unwrap_or("");
                let decoded = STANDARD
                    .decode(encoded)
                    .map_err(|err| misuse(format!("invalid base64 content: {}", err)))?;
                builder.with_content(decoded)
            }
            other => return Err(misuse(format!("unknown content format '{}'", other))),
        };

        Ok(builder)
    }
}

fn parse_status(value: &StatusValue) -> Result<StatusCode, String> {
    match value {
        StatusValue::Code(code) => {
            StatusCode::from_u16(*code).map_err(|_| format!("invalid status code {}", code))
        }
        StatusValue::Name(name) => status_by_name(name)
            .ok_or_else(|| format!("unknown status name '{}'", name)),
    }
}

/// Conventional camel-case status names, as bundle files written against
/// other tooling spell them
fn status_by_name(name: &str) -> Option<StatusCode> {
    let code = match name {
        "Continue" => 100,
        "SwitchingProtocols" => 101,
        "OK" | "Ok" => 200,
        "Created" => 201,
        "Accepted" => 202,
        "NoContent" => 204,
        "MovedPermanently" => 301,
        "Found" | "Redirect" => 302,
        "SeeOther" => 303,
        "NotModified" => 304,
        "TemporaryRedirect" => 307,
        "PermanentRedirect" => 308,
        "BadRequest" => 400,
        "Unauthorized" => 401,
        "PaymentRequired" => 402,
        "Forbidden" => 403,
        "NotFound" => 404,
        "MethodNotAllowed" => 405,
        "NotAcceptable" => 406,
        "RequestTimeout" => 408,
        "Conflict" => 409,
        "Gone" => 410,
        "PreconditionFailed" => 412,
        "UnsupportedMediaType" => 415,
        "UnprocessableEntity" => 422,
        "TooManyRequests" => 429,
        "InternalServerError" => 500,
        "NotImplemented" => 501,
        "BadGateway" => 502,
        "ServiceUnavailable" => 503,
        "GatewayTimeout" => 504,
        _ => return None,
    };
    StatusCode::from_u16(code).ok()
}

fn parse_version(marker: &str) -> Result<Version, String> {
    match marker.strip_prefix("HTTP/").unwrap_or(marker) {
        "0.9" => Ok(Version::HTTP_09),
        "1.0" | "1" => Ok(Version::HTTP_10),
        "1.1" => Ok(Version::HTTP_11),
        "2.0" | "2" => Ok(Version::HTTP_2),
        "3.0" | "3" => Ok(Version::HTTP_3),
        other => Err(format!("unknown HTTP version '{}'", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_item_gets_defaults() {
        let bundle = Bundle::from_str(
            r#"{ "items": [ { "uri": "https://api.example/terms" } ] }"#,
        )
        .unwrap();
        assert_eq!(bundle.version, 1);
        assert_eq!(bundle.items.len(), 1);

        let recipe = bundle.items[0].to_builder(0).unwrap().build().unwrap();
        assert_eq!(recipe.status(), StatusCode::OK);
    }

    #[test]
    fn test_unsupported_schema_version() {
        let result = Bundle::from_str(r#"{ "version": 2, "items": [] }"#);
        assert!(matches!(result, Err(InterceptError::Bundle(_))));
    }

    #[test]
    fn test_status_names_and_codes() {
        assert_eq!(
            parse_status(&StatusValue::Name("NotFound".into())).unwrap(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            parse_status(&StatusValue::Code(418)).unwrap(),
            StatusCode::IM_A_TEAPOT
        );
        assert!(parse_status(&StatusValue::Name("NoSuchStatus".into())).is_err());
    }

    #[test]
    fn test_header_values_accept_string_or_array() {
        let bundle = Bundle::from_str(
            r#"{
                "items": [ {
                    "uri": "https://api.example/a",
                    "requestHeaders": { "Accept": "application/json" },
                    "responseHeaders": { "X-Tag": ["a", "b"] }
                } ]
            }"#,
        )
        .unwrap();
        let item = &bundle.items[0];
        assert_eq!(item.request_headers["Accept"].values(), vec!["application/json"]);
        assert_eq!(item.response_headers["X-Tag"].values(), vec!["a", "b"]);
    }

    #[test]
    fn test_unknown_content_format_is_misuse() {
        let bundle = Bundle::from_str(
            r#"{ "items": [ { "id": "bad", "uri": "https://h/", "contentFormat": "yaml" } ] }"#,
        )
        .unwrap();
        match bundle.items[0].to_builder(0) {
            Err(InterceptError::BuilderMisuse(msg)) => {
                assert!(msg.contains("item 'bad'"));
                assert!(msg.contains("yaml"));
            }
            other => panic!("expected BuilderMisuse, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_negative_priority_is_misuse() {
        let bundle = Bundle::from_str(
            r#"{ "items": [ { "uri": "https://h/", "priority": -1 } ] }"#,
        )
        .unwrap();
        assert!(matches!(
            bundle.items[0].to_builder(0),
            Err(InterceptError::BuilderMisuse(_))
        ));
    }

    #[test]
    fn test_base64_content_decodes() {
        let bundle = Bundle::from_str(
            r#"{ "items": [ { "uri": "https://h/", "contentFormat": "base64", "contentBase64": "aGVsbG8=" } ] }"#,
        )
        .unwrap();
        let recipe = bundle.items[0].to_builder(0).unwrap().build().unwrap();
        match &recipe.content {
            crate::recipe::ContentProducer::Static(bytes) => {
                assert_eq!(bytes.as_ref(), b"hello")
            }
            other => panic!("expected static content, got {:?}", other),
        }
    }
}
