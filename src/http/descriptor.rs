//! Request descriptors and raw transport responses.
//!
//! A [`RequestDescriptor`] is the engine-facing description of an HTTP-like
//! request: everything the key canonicalizer fingerprints and everything the
//! transport collaborator needs to execute the call. A [`RawResponse`] is
//! what the transport hands back — status, headers, and an opaque body
//! buffer. The engine never decodes bodies; decoding is the caller's concern,
//! downstream of the cache.

use bytes::Bytes;

use super::{Headers, Method};

/// A request body, as it participates in cache-key fingerprinting.
///
/// - `Json` bodies are canonicalized (object keys recursively sorted) before
///   hashing, so key order in the source payload never affects the
///   fingerprint.
/// - `Text` bodies that parse as JSON are canonicalized the same way;
///   non-JSON text hashes its direct string form.
/// - `Bytes` bodies hash their raw bytes. This is deliberate: a string-form
///   fallback for binary payloads could collide two distinct payloads with
///   the same display representation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    /// A structured JSON payload.
    Json(serde_json::Value),
    /// A UTF-8 text payload.
    Text(String),
    /// An opaque binary payload.
    Bytes(Bytes),
}

impl Body {
    /// Returns the body as the byte slice the transport should send.
    pub fn as_transport_bytes(&self) -> Bytes {
        match self {
            Self::Json(value) => Bytes::from(value.to_string()),
            Self::Text(text) => Bytes::copy_from_slice(text.as_bytes()),
            Self::Bytes(bytes) => bytes.clone(),
        }
    }
}

impl From<serde_json::Value> for Body {
    fn from(value: serde_json::Value) -> Self {
        Self::Json(value)
    }
}

impl From<String> for Body {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for Body {
    fn from(text: &str) -> Self {
        Self::Text(text.to_owned())
    }
}

impl From<Bytes> for Body {
    fn from(bytes: Bytes) -> Self {
        Self::Bytes(bytes)
    }
}

/// A description of one HTTP-like request.
///
/// Built fluently, in the same style as a response builder:
///
/// # Examples
///
/// ```
/// use refetch::http::{Method, RequestDescriptor};
///
/// let descriptor = RequestDescriptor::new(Method::Post, "/api/posts")
///     .json(serde_json::json!({"title": "hello"}))
///     .header("Accept", "application/json")
///     .with_auth_scope("user:42")
///     .with_variant("mobile");
///
/// assert_eq!(descriptor.url(), "/api/posts");
/// assert_eq!(descriptor.auth_scope(), Some("user:42"));
/// ```
#[derive(Debug, Clone)]
pub struct RequestDescriptor {
    method: Method,
    url: String,
    body: Option<Body>,
    headers: Headers,
    auth_scope: Option<String>,
    variant: Option<String>,
}

impl RequestDescriptor {
    /// Creates a descriptor for the given method and URL.
    ///
    /// The URL may be absolute (`https://host/path?q=1`) or relative
    /// (`/path?q=1`); the canonicalizer parses out path and query either way.
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            body: None,
            headers: Headers::new(),
            auth_scope: None,
            variant: None,
        }
    }

    /// Shorthand for a `GET` descriptor.
    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::Get, url)
    }

    /// Sets the request body.
    #[must_use]
    pub fn body(mut self, body: impl Into<Body>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Sets a structured JSON body.
    #[must_use]
    pub fn json(mut self, value: serde_json::Value) -> Self {
        self.body = Some(Body::Json(value));
        self
    }

    /// Appends a request header. Multiple calls with the same name are additive.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Sets the opaque authorization scope that partitions the cache per
    /// caller identity (e.g. a user or tenant id). Never derived from the
    /// `Authorization` header.
    #[must_use]
    pub fn with_auth_scope(mut self, scope: impl Into<String>) -> Self {
        self.auth_scope = Some(scope.into());
        self
    }

    /// Sets an opaque variant namespace (e.g. a rendering mode or locale
    /// bucket) that further partitions the cache.
    #[must_use]
    pub fn with_variant(mut self, variant: impl Into<String>) -> Self {
        self.variant = Some(variant.into());
        self
    }

    /// Returns the request method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Returns the raw URL string as given.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Returns the request body, if any.
    pub fn request_body(&self) -> Option<&Body> {
        self.body.as_ref()
    }

    /// Returns the request headers.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Returns the authorization scope, if any.
    pub fn auth_scope(&self) -> Option<&str> {
        self.auth_scope.as_deref()
    }

    /// Returns the variant namespace, if any.
    pub fn variant(&self) -> Option<&str> {
        self.variant.as_deref()
    }
}

/// A raw response handed back by the transport collaborator.
///
/// The engine treats the body as opaque bytes; it is stored in the cache
/// verbatim and round-trips byte-for-byte through persistence.
#[derive(Debug, Clone)]
pub struct RawResponse {
    status: u16,
    headers: Headers,
    body: Bytes,
}

impl RawResponse {
    /// Creates a response with the given status and an empty body.
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    /// Appends a response header.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Sets the response body bytes.
    #[must_use]
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Returns the HTTP status code.
    pub fn status(&self) -> u16 {
        self.status
    }

    /// Returns the response headers.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Returns the response body bytes.
    pub fn body_bytes(&self) -> &Bytes {
        &self.body
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_chain() {
        let d = RequestDescriptor::new(Method::Put, "https://api.example.com/items/7")
            .body("payload")
            .header("Accept", "application/json")
            .with_variant("v2");

        assert_eq!(d.method(), &Method::Put);
        assert_eq!(d.url(), "https://api.example.com/items/7");
        assert!(matches!(d.request_body(), Some(Body::Text(t)) if t == "payload"));
        assert_eq!(d.headers().get("accept"), Some("application/json"));
        assert_eq!(d.variant(), Some("v2"));
        assert_eq!(d.auth_scope(), None);
    }

    #[test]
    fn json_body_transport_bytes() {
        let body = Body::Json(serde_json::json!({"a": 1}));
        assert_eq!(&body.as_transport_bytes()[..], br#"{"a":1}"#);
    }

    #[test]
    fn raw_response_accessors() {
        let r = RawResponse::new(200)
            .header("Content-Type", "application/json")
            .body(Bytes::from_static(b"{}"));
        assert_eq!(r.status(), 200);
        assert_eq!(r.headers().get("content-type"), Some("application/json"));
        assert_eq!(&r.body_bytes()[..], b"{}");
    }
}
