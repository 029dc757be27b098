//! Request descriptors: the transport-neutral view of an inbound request.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// HTTP request method.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Method {
    /// GET
    Get,
    /// HEAD
    Head,
    /// OPTIONS
    Options,
    /// DELETE
    Delete,
    /// TRACE
    Trace,
    /// CONNECT
    Connect,
    /// POST
    Post,
    /// PUT
    Put,
    /// PATCH
    Patch,
    /// Any other method token, stored upper-cased.
    Extension(String),
}

impl Method {
    /// Returns the canonical upper-case token.
    pub fn as_str(&self) -> &str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Options => "OPTIONS",
            Method::Delete => "DELETE",
            Method::Trace => "TRACE",
            Method::Connect => "CONNECT",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Extension(token) => token,
        }
    }

    /// Whether the request body takes part in request identity.
    ///
    /// Create, replace and partial-update methods carry a meaningful body.
    /// Unknown extension methods are treated as body-bearing so that two
    /// requests with different payloads are never merged.
    pub fn carries_body(&self) -> bool {
        matches!(
            self,
            Method::Post | Method::Put | Method::Patch | Method::Extension(_)
        )
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an empty or malformed method token.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid method token: {0:?}")]
pub struct InvalidMethod(pub String);

impl FromStr for Method {
    type Err = InvalidMethod;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let token = s.trim();
        if token.is_empty() || !token.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-') {
            return Err(InvalidMethod(s.to_string()));
        }

        let upper = token.to_ascii_uppercase();
        Ok(match upper.as_str() {
            "GET" => Method::Get,
            "HEAD" => Method::Head,
            "OPTIONS" => Method::Options,
            "DELETE" => Method::Delete,
            "TRACE" => Method::Trace,
            "CONNECT" => Method::Connect,
            "POST" => Method::Post,
            "PUT" => Method::Put,
            "PATCH" => Method::Patch,
            _ => Method::Extension(upper),
        })
    }
}

impl TryFrom<String> for Method {
    type Error = InvalidMethod;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Method> for String {
    fn from(method: Method) -> Self {
        method.as_str().to_string()
    }
}

/// Body of a request as seen by the coalescing engine.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RequestBody {
    /// No body was sent.
    #[default]
    Absent,
    /// The fully buffered body.
    Bytes(Bytes),
    /// The transport failed to read the body stream.
    Unreadable(String),
}

impl From<Bytes> for RequestBody {
    fn from(bytes: Bytes) -> Self {
        RequestBody::Bytes(bytes)
    }
}

impl From<Vec<u8>> for RequestBody {
    fn from(bytes: Vec<u8>) -> Self {
        RequestBody::Bytes(Bytes::from(bytes))
    }
}

impl From<&'static str> for RequestBody {
    fn from(s: &'static str) -> Self {
        RequestBody::Bytes(Bytes::from_static(s.as_bytes()))
    }
}

/// Immutable description of an inbound request.
///
/// # Example
///
/// ```
/// use stampede_core::{Method, RequestDescriptor};
///
/// let request = RequestDescriptor::new(Method::Get, "/items/")
///     .with_query([("sort", "asc"), ("limit", "10")]);
///
/// assert_eq!(request.path(), "/items");
/// assert_eq!(request.query().len(), 2);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestDescriptor {
    method: Method,
    path: String,
    query: Vec<(String, String)>,
    body: RequestBody,
    upgrade: bool,
}

impl RequestDescriptor {
    /// Creates a descriptor with a normalized path and no query or body.
    pub fn new(method: Method, path: impl AsRef<str>) -> Self {
        Self {
            method,
            path: normalize_path(path.as_ref()),
            query: Vec::new(),
            body: RequestBody::Absent,
            upgrade: false,
        }
    }

    /// Appends query pairs, preserving order and repeated keys.
    pub fn with_query<I, K, V>(mut self, pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.query
            .extend(pairs.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Sets the request body.
    pub fn with_body(mut self, body: impl Into<RequestBody>) -> Self {
        self.body = body.into();
        self
    }

    /// Marks the request as a protocol upgrade (e.g. WebSocket handshake).
    pub fn upgrade(mut self, upgrade: bool) -> Self {
        self.upgrade = upgrade;
        self
    }

    /// Request method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Normalized request path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Query pairs in transmission order.
    pub fn query(&self) -> &[(String, String)] {
        &self.query
    }

    /// Request body.
    pub fn body(&self) -> &RequestBody {
        &self.body
    }

    /// Whether this request is a protocol upgrade.
    pub fn is_upgrade(&self) -> bool {
        self.upgrade
    }
}

/// Trims trailing slashes so `/items/` and `/items` are the same resource.
///
/// The root path stays `/`. An empty input is left empty so that the
/// fingerprinter can reject it.
pub fn normalize_path(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() && !path.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_parse_case_insensitive() {
        assert_eq!("get".parse::<Method>().unwrap(), Method::Get);
        assert_eq!("Patch".parse::<Method>().unwrap(), Method::Patch);
        assert_eq!(
            "purge".parse::<Method>().unwrap(),
            Method::Extension("PURGE".to_string())
        );
        assert!("".parse::<Method>().is_err());
        assert!("GE T".parse::<Method>().is_err());
    }

    #[test]
    fn test_method_carries_body() {
        assert!(!Method::Get.carries_body());
        assert!(!Method::Head.carries_body());
        assert!(!Method::Delete.carries_body());
        assert!(Method::Post.carries_body());
        assert!(Method::Put.carries_body());
        assert!(Method::Patch.carries_body());
        assert!(Method::Extension("PURGE".into()).carries_body());
    }

    #[test]
    fn test_method_serde() {
        let method: Method = serde_json::from_str("\"post\"").unwrap();
        assert_eq!(method, Method::Post);
        assert_eq!(serde_json::to_string(&Method::Get).unwrap(), "\"GET\"");
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("/items/"), "/items");
        assert_eq!(normalize_path("/items//"), "/items");
        assert_eq!(normalize_path("/items"), "/items");
        assert_eq!(normalize_path("/"), "/");
        assert_eq!(normalize_path("///"), "/");
        assert_eq!(normalize_path(""), "");
    }

    #[test]
    fn test_descriptor_builder() {
        let request = RequestDescriptor::new(Method::Post, "/test/")
            .with_query([("a", "1"), ("a", "2")])
            .with_body("payload")
            .upgrade(false);

        assert_eq!(request.path(), "/test");
        assert_eq!(request.query()[1], ("a".to_string(), "2".to_string()));
        assert_eq!(
            request.body(),
            &RequestBody::Bytes(Bytes::from_static(b"payload"))
        );
        assert!(!request.is_upgrade());
    }
}
