//! Cached response records and their persisted encoding.
//!
//! A [`CacheRecord`] is the immutable value object stored in both cache
//! tiers: the raw response body, status, a small preserved header subset,
//! timestamps, and revalidation validators. Records store **raw bytes**,
//! never a decoded value — decoding happens downstream of the cache, so
//! multiple callers decoding the same cached bytes into different shapes
//! never fragment the cache.
//!
//! Persistence uses a versioned, length-prefixed binary format written by
//! hand with [`bytes`] buffers; the body round-trips byte-for-byte.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::http::{Headers, RawResponse};
use crate::key::RequestKey;

/// Current version byte of the persisted record format.
const FORMAT_VERSION: u8 = 1;

/// Response headers preserved on a record; everything else is dropped.
const PRESERVED_HEADERS: &[&str] = &["content-type", "etag", "last-modified", "cache-control"];

/// Fixed per-record overhead charged by [`CacheRecord::size_bytes`] beyond
/// the measured body/key/header bytes.
const RECORD_OVERHEAD: usize = 64;

/// Errors produced while decoding a persisted record blob.
///
/// Never surfaced to callers: the store treats a blob that fails to decode
/// as a cache miss and deletes the underlying entry.
#[derive(Debug, Error)]
pub enum RecordDecodeError {
    #[error("unsupported record format version {0}")]
    UnsupportedVersion(u8),

    #[error("record blob is truncated")]
    Truncated,

    #[error("record field is not valid UTF-8")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
}

/// One cached response plus its metadata.
///
/// Immutable once constructed; cloning is cheap (the body is a shared
/// [`Bytes`] buffer).
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use refetch::http::{RawResponse, RequestDescriptor};
/// use refetch::key::RequestKey;
/// use refetch::record::CacheRecord;
///
/// let key = RequestKey::for_request(&RequestDescriptor::get("/posts/1"));
/// let response = RawResponse::new(200)
///     .header("Content-Type", "application/json")
///     .header("ETag", "\"v1\"")
///     .body(&b"{\"id\":1}"[..]);
///
/// let record = CacheRecord::from_response(&key, &response, Some(Duration::from_secs(60)));
/// assert_eq!(record.status(), 200);
/// assert_eq!(record.etag(), Some("\"v1\""));
/// assert!(!record.is_expired());
/// ```
#[derive(Debug, Clone)]
pub struct CacheRecord {
    canonical_key: String,
    body: Bytes,
    status: u16,
    headers: Headers,
    cached_at: SystemTime,
    expires_at: Option<SystemTime>,
    etag: Option<String>,
    last_modified: Option<String>,
}

impl CacheRecord {
    /// Creates a record from a raw transport response.
    ///
    /// `ttl = None` means the record never auto-expires; it lives until
    /// explicit invalidation or size-pressure eviction. The preserved header
    /// subset and the `etag`/`last-modified` validators are captured from
    /// the response headers.
    pub fn from_response(key: &RequestKey, response: &RawResponse, ttl: Option<Duration>) -> Self {
        let now = SystemTime::now();
        let headers: Headers = response
            .headers()
            .iter()
            .filter(|(name, _)| {
                PRESERVED_HEADERS
                    .iter()
                    .any(|preserved| name.eq_ignore_ascii_case(preserved))
            })
            .collect();

        Self {
            canonical_key: key.canonical().to_owned(),
            body: response.body_bytes().clone(),
            status: response.status(),
            etag: headers.get("etag").map(str::to_owned),
            last_modified: headers.get("last-modified").map(str::to_owned),
            headers,
            cached_at: now,
            expires_at: ttl.map(|ttl| now + ttl),
        }
    }

    /// Returns the canonical key this record was stored under.
    pub fn canonical_key(&self) -> &str {
        &self.canonical_key
    }

    /// Returns the raw response body.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Returns the HTTP status code of the cached response.
    pub fn status(&self) -> u16 {
        self.status
    }

    /// Returns the preserved response headers.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Returns when the record was created.
    pub fn cached_at(&self) -> SystemTime {
        self.cached_at
    }

    /// Returns the expiry instant, or `None` for records with no TTL.
    pub fn expires_at(&self) -> Option<SystemTime> {
        self.expires_at
    }

    /// Returns the entity tag validator, if the response carried one.
    pub fn etag(&self) -> Option<&str> {
        self.etag.as_deref()
    }

    /// Returns the last-modified validator, if the response carried one.
    pub fn last_modified(&self) -> Option<&str> {
        self.last_modified.as_deref()
    }

    /// Returns `true` if the record has outlived its TTL.
    ///
    /// Records without an expiry never expire.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(SystemTime::now())
    }

    /// Expiry check against an explicit clock instant.
    pub fn is_expired_at(&self, now: SystemTime) -> bool {
        match self.expires_at {
            Some(expires_at) => now > expires_at,
            None => false,
        }
    }

    /// Returns how long this record has been cached.
    pub fn age(&self) -> Duration {
        SystemTime::now()
            .duration_since(self.cached_at)
            .unwrap_or(Duration::ZERO)
    }

    /// Returns the TTL still remaining, or `None` for non-expiring records.
    ///
    /// An already-expired record reports `Some(Duration::ZERO)`.
    pub fn remaining_ttl(&self) -> Option<Duration> {
        self.expires_at.map(|expires_at| {
            expires_at
                .duration_since(SystemTime::now())
                .unwrap_or(Duration::ZERO)
        })
    }

    /// Returns the byte size charged against cache budgets.
    ///
    /// Counts the body, key, preserved headers, and a fixed structural
    /// overhead — incremental size accounting in the store sums these.
    pub fn size_bytes(&self) -> usize {
        let header_bytes: usize = self
            .headers
            .iter()
            .map(|(name, value)| name.len() + value.len())
            .sum();
        self.body.len() + self.canonical_key.len() + header_bytes + RECORD_OVERHEAD
    }

    /// Serializes the record into the versioned persisted format.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.size_bytes() + 32);

        buf.put_u8(FORMAT_VERSION);
        buf.put_u16(self.status);
        buf.put_u64(unix_millis(self.cached_at));
        match self.expires_at {
            Some(expires_at) => {
                buf.put_u8(1);
                buf.put_u64(unix_millis(expires_at));
            }
            None => buf.put_u8(0),
        }

        put_str(&mut buf, &self.canonical_key);
        put_opt_str(&mut buf, self.etag.as_deref());
        put_opt_str(&mut buf, self.last_modified.as_deref());

        buf.put_u16(self.headers.len() as u16);
        for (name, value) in self.headers.iter() {
            put_str(&mut buf, name);
            put_str(&mut buf, value);
        }

        buf.put_u64(self.body.len() as u64);
        buf.put_slice(&self.body);

        buf.freeze()
    }

    /// Decodes a record from its persisted form.
    ///
    /// # Errors
    ///
    /// Returns [`RecordDecodeError`] for unknown versions, truncated blobs,
    /// or invalid UTF-8 in string fields.
    pub fn from_bytes(mut blob: Bytes) -> Result<Self, RecordDecodeError> {
        let version = take_u8(&mut blob)?;
        if version != FORMAT_VERSION {
            return Err(RecordDecodeError::UnsupportedVersion(version));
        }

        let status = take_u16(&mut blob)?;
        let cached_at = from_unix_millis(take_u64(&mut blob)?);
        let expires_at = match take_u8(&mut blob)? {
            0 => None,
            _ => Some(from_unix_millis(take_u64(&mut blob)?)),
        };

        let canonical_key = take_str(&mut blob)?;
        let etag = take_opt_str(&mut blob)?;
        let last_modified = take_opt_str(&mut blob)?;

        let header_count = take_u16(&mut blob)?;
        let mut headers = Headers::with_capacity(header_count as usize);
        for _ in 0..header_count {
            let name = take_str(&mut blob)?;
            let value = take_str(&mut blob)?;
            headers.insert(name, value);
        }

        let body_len = take_u64(&mut blob)? as usize;
        if blob.remaining() < body_len {
            return Err(RecordDecodeError::Truncated);
        }
        let body = blob.split_to(body_len);

        Ok(Self {
            canonical_key,
            body,
            status,
            headers,
            cached_at,
            expires_at,
            etag,
            last_modified,
        })
    }
}

fn unix_millis(instant: SystemTime) -> u64 {
    instant
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}

fn from_unix_millis(millis: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(millis)
}

fn put_str(buf: &mut BytesMut, s: &str) {
    buf.put_u32(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

fn put_opt_str(buf: &mut BytesMut, s: Option<&str>) {
    match s {
        Some(s) => {
            buf.put_u8(1);
            put_str(buf, s);
        }
        None => buf.put_u8(0),
    }
}

fn take_u8(blob: &mut Bytes) -> Result<u8, RecordDecodeError> {
    if blob.remaining() < 1 {
        return Err(RecordDecodeError::Truncated);
    }
    Ok(blob.get_u8())
}

fn take_u16(blob: &mut Bytes) -> Result<u16, RecordDecodeError> {
    if blob.remaining() < 2 {
        return Err(RecordDecodeError::Truncated);
    }
    Ok(blob.get_u16())
}

fn take_u64(blob: &mut Bytes) -> Result<u64, RecordDecodeError> {
    if blob.remaining() < 8 {
        return Err(RecordDecodeError::Truncated);
    }
    Ok(blob.get_u64())
}

fn take_str(blob: &mut Bytes) -> Result<String, RecordDecodeError> {
    let len = take_u32(blob)? as usize;
    if blob.remaining() < len {
        return Err(RecordDecodeError::Truncated);
    }
    Ok(String::from_utf8(blob.split_to(len).to_vec())?)
}

fn take_u32(blob: &mut Bytes) -> Result<u32, RecordDecodeError> {
    if blob.remaining() < 4 {
        return Err(RecordDecodeError::Truncated);
    }
    Ok(blob.get_u32())
}

fn take_opt_str(blob: &mut Bytes) -> Result<Option<String>, RecordDecodeError> {
    match take_u8(blob)? {
        0 => Ok(None),
        _ => Ok(Some(take_str(blob)?)),
    }
}
