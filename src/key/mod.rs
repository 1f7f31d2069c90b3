//! Deterministic request fingerprinting.
//!
//! Every request entering the engine is reduced to a [`RequestKey`]: a
//! canonical string identity derived from the method, normalized path and
//! query, a body fingerprint (for body-carrying verbs), a fingerprint over a
//! fixed allow-list of identity-affecting headers, and the opaque
//! auth-scope/variant partitions. Two requests that differ only in query
//! parameter order, header insertion order, or JSON object key order produce
//! the same key — that property is what makes coalescing and cache lookups
//! safe.

use std::fmt;
use std::hash::{Hash, Hasher};

use percent_encoding::{AsciiSet, CONTROLS, percent_decode_str, utf8_percent_encode};
use sha2::{Digest, Sha256};

use crate::http::{Body, Headers, Method, RequestDescriptor};

/// Hex length of truncated SHA-256 fingerprints (64 bits of digest).
///
/// Sufficient collision resistance for cache-key purposes at the scale of a
/// single client's request population.
const FINGERPRINT_HEX_LEN: usize = 16;

/// Headers that participate in cache identity.
///
/// Content-negotiation and API-versioning headers only. Everything else —
/// `user-agent`, `cookie`, `cache-control`, and notably `authorization` —
/// is excluded; authorization identity is carried by the descriptor's
/// explicit auth scope instead.
const IDENTITY_HEADERS: &[&str] = &[
    "accept",
    "accept-charset",
    "accept-encoding",
    "accept-language",
    "content-type",
    "x-api-version",
];

/// Characters percent-encoded in normalized query keys and values.
///
/// Controls plus the delimiters that would make the canonical form ambiguous.
const QUERY_ENCODE_SET: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'<')
    .add(b'>')
    .add(b'%')
    .add(b'&')
    .add(b'=')
    .add(b'+');

/// A deterministic fingerprint for one request.
///
/// Construction is a pure function of the descriptor: identical inputs, in
/// any header/query/JSON-key order, produce the identical canonical string.
/// Equality and hashing are defined over the canonical string alone, so
/// value equality and key-identity are the same relation.
///
/// The canonical string starts with `METHOD:PATH` and conditionally appends
/// `?QUERY`, `#BODYHASH`, `^HEADERHASH`, `@AUTHSCOPE`, and `~VARIANT`. Each
/// component has a distinct prefix character, so no two distinct attribute
/// combinations can collide on the same canonical string.
///
/// # Examples
///
/// ```
/// use refetch::http::RequestDescriptor;
/// use refetch::key::RequestKey;
///
/// let a = RequestKey::for_request(&RequestDescriptor::get("/Posts/?b=2&a=1"));
/// let b = RequestKey::for_request(&RequestDescriptor::get("/posts?a=1&b=2"));
/// assert_eq!(a, b);
/// assert_eq!(a.canonical(), "GET:/posts?a=1&b=2");
/// ```
#[derive(Debug, Clone)]
pub struct RequestKey {
    method: String,
    path: String,
    query: Option<String>,
    body_fingerprint: Option<String>,
    header_fingerprint: Option<String>,
    auth_scope: Option<String>,
    variant: Option<String>,
    canonical: String,
}

impl RequestKey {
    /// Builds the canonical key for a request descriptor.
    pub fn for_request(descriptor: &RequestDescriptor) -> Self {
        Self::build(
            descriptor.method(),
            descriptor.url(),
            descriptor.request_body(),
            descriptor.headers(),
            descriptor.auth_scope(),
            descriptor.variant(),
        )
    }

    /// Builds a key from individual request attributes.
    ///
    /// [`for_request`](Self::for_request) is the usual entry point; this
    /// exists for callers that construct keys without a full descriptor
    /// (e.g. to invalidate an entry for a known request shape).
    pub fn build(
        method: &Method,
        url: &str,
        body: Option<&Body>,
        headers: &Headers,
        auth_scope: Option<&str>,
        variant: Option<&str>,
    ) -> Self {
        let method = method.as_str().to_ascii_uppercase();
        let (raw_path, raw_query) = split_url(url);
        let path = normalize_path(raw_path);
        let query = normalize_query(raw_query);

        let body_fingerprint = match body {
            Some(body) if carries_body(&method) => Some(fingerprint_body(body)),
            _ => None,
        };
        let header_fingerprint = fingerprint_headers(headers);

        let mut canonical = format!("{method}:{path}");
        if let Some(q) = &query {
            canonical.push('?');
            canonical.push_str(q);
        }
        if let Some(b) = &body_fingerprint {
            canonical.push('#');
            canonical.push_str(b);
        }
        if let Some(h) = &header_fingerprint {
            canonical.push('^');
            canonical.push_str(h);
        }
        if let Some(scope) = auth_scope {
            canonical.push('@');
            canonical.push_str(scope);
        }
        if let Some(variant) = variant {
            canonical.push('~');
            canonical.push_str(variant);
        }

        Self {
            method,
            path,
            query,
            body_fingerprint,
            header_fingerprint,
            auth_scope: auth_scope.map(str::to_owned),
            variant: variant.map(str::to_owned),
            canonical,
        }
    }

    /// Returns the full canonical string.
    pub fn canonical(&self) -> &str {
        &self.canonical
    }

    /// Returns the uppercased method component.
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Returns the normalized path component.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns the normalized query component, if any.
    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    /// Returns the truncated body hash, present only for body-carrying verbs.
    pub fn body_fingerprint(&self) -> Option<&str> {
        self.body_fingerprint.as_deref()
    }

    /// Returns the truncated identity-header hash, if any allow-listed
    /// header was present.
    pub fn header_fingerprint(&self) -> Option<&str> {
        self.header_fingerprint.as_deref()
    }

    /// Returns the auth-scope partition, if any.
    pub fn auth_scope(&self) -> Option<&str> {
        self.auth_scope.as_deref()
    }

    /// Returns the variant partition, if any.
    pub fn variant(&self) -> Option<&str> {
        self.variant.as_deref()
    }
}

impl PartialEq for RequestKey {
    fn eq(&self, other: &Self) -> bool {
        self.canonical == other.canonical
    }
}

impl Eq for RequestKey {}

impl Hash for RequestKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.canonical.hash(state);
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical)
    }
}

/// Returns the namespace of a canonical key: its first colon-delimited
/// segment (the method component for keys built here).
pub fn namespace_of(canonical: &str) -> &str {
    canonical.split(':').next().unwrap_or(canonical)
}

fn carries_body(method: &str) -> bool {
    matches!(method, "POST" | "PUT" | "PATCH")
}

/// Splits a URL into raw path and raw query, tolerating absolute URLs.
///
/// The scheme/authority of absolute URLs is dropped: two clients hitting the
/// same logical endpoint through different host aliases still share a key
/// only if the caller wants that — callers needing host-distinct caching put
/// the host in the variant.
fn split_url(url: &str) -> (&str, Option<&str>) {
    // Drop any fragment first; fragments never reach the server.
    let url = url.split('#').next().unwrap_or(url);

    let after_authority = match url.find("://") {
        Some(scheme_end) => {
            let rest = &url[scheme_end + 3..];
            match rest.find('/') {
                Some(slash) => &rest[slash..],
                None => "/",
            }
        }
        None => url,
    };

    match after_authority.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (after_authority, None),
    }
}

/// Normalizes a request path: lowercase, leading slash ensured, repeated
/// slashes collapsed, a single trailing slash stripped (root excepted).
fn normalize_path(raw: &str) -> String {
    let lowered = raw.to_lowercase();

    let mut path = String::with_capacity(lowered.len() + 1);
    if !lowered.starts_with('/') {
        path.push('/');
    }
    let mut prev_slash = false;
    for ch in lowered.chars() {
        if ch == '/' {
            if prev_slash {
                continue;
            }
            prev_slash = true;
        } else {
            prev_slash = false;
        }
        path.push(ch);
    }

    if path.len() > 1 && path.ends_with('/') {
        path.pop();
    }
    if path.is_empty() {
        path.push('/');
    }
    path
}

/// Normalizes a query string into its canonical sorted-and-encoded form.
///
/// Keys are lowercased and sorted lexicographically; multiple values per key
/// are sorted lexicographically as well. Both keys and values are
/// percent-decoded and then re-encoded against a fixed set, so differently
/// pre-encoded inputs converge on one spelling. Returns `None` for an empty
/// or absent query.
fn normalize_query(raw: Option<&str>) -> Option<String> {
    let raw = raw?;
    if raw.is_empty() {
        return None;
    }

    let mut pairs: Vec<(String, String)> = raw
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (
                encode_component(&decode_component(key).to_lowercase()),
                encode_component(&decode_component(value)),
            )
        })
        .collect();

    if pairs.is_empty() {
        return None;
    }
    pairs.sort();

    let joined = pairs
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&");
    Some(joined)
}

fn decode_component(component: &str) -> String {
    // `+` is the form-encoding spelling of space.
    let component = component.replace('+', " ");
    percent_decode_str(&component)
        .decode_utf8()
        .map(|cow| cow.into_owned())
        .unwrap_or(component)
}

fn encode_component(component: &str) -> String {
    utf8_percent_encode(component, QUERY_ENCODE_SET).to_string()
}

/// Hashes a body into its truncated fingerprint.
///
/// Structured payloads (and text that parses as a JSON object/array) are
/// canonicalized with recursively sorted object keys before hashing. Other
/// text hashes its direct form. Binary payloads hash their raw bytes — never
/// a lossy string rendering.
fn fingerprint_body(body: &Body) -> String {
    match body {
        Body::Json(value) => digest_str(&canonical_json(value)),
        Body::Text(text) => match serde_json::from_str::<serde_json::Value>(text) {
            Ok(value) if value.is_object() || value.is_array() => {
                digest_str(&canonical_json(&value))
            }
            _ => digest_str(text),
        },
        Body::Bytes(bytes) => digest_bytes(bytes),
    }
}

/// Hashes the allow-listed identity headers, or returns `None` if no
/// allow-listed header is present.
fn fingerprint_headers(headers: &Headers) -> Option<String> {
    let mut entries: Vec<String> = headers
        .iter()
        .filter(|(name, _)| {
            IDENTITY_HEADERS
                .iter()
                .any(|allowed| name.eq_ignore_ascii_case(allowed))
        })
        .map(|(name, value)| format!("{}={}", name.to_lowercase(), value.to_lowercase()))
        .collect();

    if entries.is_empty() {
        return None;
    }
    entries.sort();
    Some(digest_str(&entries.join("\n")))
}

/// Serializes a JSON value with all object keys recursively sorted.
fn canonical_json(value: &serde_json::Value) -> String {
    use serde_json::Value;

    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let fields = keys
                .iter()
                .map(|k| {
                    format!(
                        "{}:{}",
                        serde_json::to_string(k).unwrap_or_default(),
                        canonical_json(&map[*k])
                    )
                })
                .collect::<Vec<_>>()
                .join(",");
            format!("{{{fields}}}")
        }
        Value::Array(items) => {
            let items = items
                .iter()
                .map(canonical_json)
                .collect::<Vec<_>>()
                .join(",");
            format!("[{items}]")
        }
        other => other.to_string(),
    }
}

fn digest_str(input: &str) -> String {
    digest_bytes(input.as_bytes())
}

fn digest_bytes(input: &[u8]) -> String {
    let digest = Sha256::digest(input);
    let mut hexed = hex::encode(digest);
    hexed.truncate(FINGERPRINT_HEX_LEN);
    hexed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::RequestDescriptor;
    use bytes::Bytes;
    use serde_json::json;

    #[test]
    fn query_order_does_not_matter() {
        let a = RequestKey::for_request(&RequestDescriptor::get("/posts?b=2&a=1&a=0"));
        let b = RequestKey::for_request(&RequestDescriptor::get("/posts?a=0&a=1&b=2"));
        assert_eq!(a.canonical(), b.canonical());
        assert_eq!(a.query(), Some("a=0&a=1&b=2"));
    }

    #[test]
    fn path_normalization() {
        let key = RequestKey::for_request(&RequestDescriptor::get("//Posts//1/"));
        assert_eq!(key.path(), "/posts/1");

        let root = RequestKey::for_request(&RequestDescriptor::get("/"));
        assert_eq!(root.path(), "/");
        assert_eq!(root.canonical(), "GET:/");
    }

    #[test]
    fn absolute_and_relative_urls_agree() {
        let abs = RequestKey::for_request(&RequestDescriptor::get(
            "https://api.example.com/posts?x=1",
        ));
        let rel = RequestKey::for_request(&RequestDescriptor::get("/posts?x=1"));
        assert_eq!(abs, rel);
    }

    #[test]
    fn json_body_key_order_does_not_matter() {
        let a = RequestKey::for_request(
            &RequestDescriptor::new(Method::Post, "/items")
                .json(json!({"b": [1, 2], "a": {"y": 2, "x": 1}})),
        );
        let b = RequestKey::for_request(
            &RequestDescriptor::new(Method::Post, "/items")
                .json(json!({"a": {"x": 1, "y": 2}, "b": [1, 2]})),
        );
        assert_eq!(a, b);
        assert!(a.body_fingerprint().is_some());
    }

    #[test]
    fn text_body_that_parses_as_json_canonicalizes() {
        let a = RequestKey::for_request(
            &RequestDescriptor::new(Method::Post, "/items").body(r#"{"b":2,"a":1}"#),
        );
        let b = RequestKey::for_request(
            &RequestDescriptor::new(Method::Post, "/items").body(r#"{"a":1,"b":2}"#),
        );
        assert_eq!(a, b);
    }

    #[test]
    fn body_ignored_for_non_body_verbs() {
        let with = RequestKey::for_request(&RequestDescriptor::get("/posts").body("ignored"));
        let without = RequestKey::for_request(&RequestDescriptor::get("/posts"));
        assert_eq!(with, without);
        assert!(with.body_fingerprint().is_none());
    }

    #[test]
    fn distinct_binary_bodies_distinct_keys() {
        let a = RequestKey::for_request(
            &RequestDescriptor::new(Method::Post, "/upload").body(Bytes::from_static(&[0, 1, 2])),
        );
        let b = RequestKey::for_request(
            &RequestDescriptor::new(Method::Post, "/upload").body(Bytes::from_static(&[0, 1, 3])),
        );
        assert_ne!(a, b);
    }

    #[test]
    fn header_order_does_not_matter() {
        let a = RequestKey::for_request(
            &RequestDescriptor::get("/posts")
                .header("Accept", "application/json")
                .header("Accept-Language", "en"),
        );
        let b = RequestKey::for_request(
            &RequestDescriptor::get("/posts")
                .header("accept-language", "EN")
                .header("ACCEPT", "application/json"),
        );
        assert_eq!(a, b);
        assert!(a.header_fingerprint().is_some());
    }

    #[test]
    fn excluded_headers_do_not_affect_key() {
        let a = RequestKey::for_request(
            &RequestDescriptor::get("/posts")
                .header("User-Agent", "curl/8.0")
                .header("Authorization", "Bearer secret")
                .header("Cookie", "session=1"),
        );
        let b = RequestKey::for_request(&RequestDescriptor::get("/posts"));
        assert_eq!(a, b);
        assert!(a.header_fingerprint().is_none());
    }

    #[test]
    fn auth_scope_and_variant_partition() {
        let base = RequestKey::for_request(&RequestDescriptor::get("/posts"));
        let scoped =
            RequestKey::for_request(&RequestDescriptor::get("/posts").with_auth_scope("u1"));
        let variant =
            RequestKey::for_request(&RequestDescriptor::get("/posts").with_variant("mobile"));
        assert_ne!(base, scoped);
        assert_ne!(base, variant);
        assert_ne!(scoped, variant);
        assert_eq!(scoped.canonical(), "GET:/posts@u1");
        assert_eq!(variant.canonical(), "GET:/posts~mobile");
    }

    #[test]
    fn differently_encoded_queries_converge() {
        let a = RequestKey::for_request(&RequestDescriptor::get("/s?q=hello%20world"));
        let b = RequestKey::for_request(&RequestDescriptor::get("/s?q=hello+world"));
        assert_eq!(a, b);
    }

    #[test]
    fn namespace_is_first_segment() {
        let key = RequestKey::for_request(&RequestDescriptor::get("/posts/1"));
        assert_eq!(namespace_of(key.canonical()), "GET");
    }
}
