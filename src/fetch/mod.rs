//! Policy-driven fetch orchestration.
//!
//! [`FetchOrchestrator`] composes the cache store, the in-flight registry,
//! and an external [`Transport`] into one entry point: [`fetch`] takes a
//! request descriptor and a [`CachePolicy`] and returns a cached or freshly
//! fetched record. Every network call — under any policy — is routed through
//! the registry keyed by the canonicalized descriptor, so concurrent
//! identical requests coalesce to one transport call.
//!
//! Policy semantics:
//!
//! | Policy | Checks cache first? | Fetches network? | Stores to cache? | Stale-on-error fallback? |
//! |---|---|---|---|---|
//! | `NetworkOnly` | no | always | no | no |
//! | `CacheOnly` | yes | never | no | no |
//! | `CacheFirst` | yes | only on cache miss | yes | no |
//! | `NetworkFirst` | no | always | yes | yes |
//! | `StaleWhileRevalidate` | yes (including stale) | always | yes | yes |
//!
//! [`fetch`]: FetchOrchestrator::fetch

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use thiserror::Error;
use tracing::{debug, warn};

use crate::http::{RawResponse, RequestDescriptor};
use crate::inflight::{Cancelled, InflightRegistry};
use crate::key::RequestKey;
use crate::record::CacheRecord;
use crate::store::{CacheStats, CacheStore};

/// Boxed error type raised by transport implementations.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// The external HTTP client collaborator.
///
/// The engine delegates all actual networking — TLS, pooling, redirects,
/// timeouts — to this seam. Implementations receive the original descriptor
/// untouched; canonicalization affects only the cache key.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Executes the described request against the network.
    async fn execute(&self, request: RequestDescriptor) -> Result<RawResponse, BoxError>;
}

/// Opaque wrapper for whatever the transport raised.
///
/// The cause is reference-counted so a single failure can propagate
/// identically to every coalesced caller.
#[derive(Debug, Clone, Error)]
#[error("transport error: {0}")]
pub struct TransportError(Arc<dyn std::error::Error + Send + Sync>);

impl TransportError {
    /// Wraps a transport failure.
    pub fn new(cause: impl Into<BoxError>) -> Self {
        Self(Arc::from(cause.into()))
    }

    /// Returns the underlying transport failure.
    pub fn cause(&self) -> &(dyn std::error::Error + Send + Sync) {
        self.0.as_ref()
    }
}

/// Errors surfaced by [`FetchOrchestrator::fetch`].
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    /// `CacheOnly` was requested and nothing usable was cached.
    #[error("no cached response for {key}")]
    CacheMiss { key: String },

    /// The transport failed and no policy fallback applied.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The engine was closed, or in-flight tracking was force-dropped,
    /// while this call was waiting.
    #[error("fetch cancelled: {reason}")]
    Cancelled { reason: String },
}

impl From<Cancelled> for FetchError {
    fn from(cancelled: Cancelled) -> Self {
        Self::Cancelled {
            reason: cancelled.reason,
        }
    }
}

/// How a single fetch interacts with the two cache tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePolicy {
    /// Bypass the cache entirely; never store the response.
    NetworkOnly,
    /// Serve from cache or fail with [`FetchError::CacheMiss`]; never touch
    /// the network.
    CacheOnly,
    /// Serve from cache when fresh; fetch and store on a miss.
    CacheFirst,
    /// Always fetch and store; fall back to a stale cached value if the
    /// network fails.
    NetworkFirst,
    /// Return any cached value — fresh or stale — immediately, while a
    /// detached background refresh updates the cache for future callers.
    StaleWhileRevalidate,
}

/// Shared outcome type republished to coalesced callers.
type SharedOutcome = Result<CacheRecord, FetchError>;

/// The engine's entry point: cache-policy orchestration over the store,
/// the in-flight registry, and the transport.
///
/// Owns its collaborators by explicit constructor injection — there are no
/// process-wide registries. Created once at application start and torn down
/// with [`close`](Self::close).
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use refetch::fetch::{CachePolicy, FetchOrchestrator, Transport};
/// use refetch::http::RequestDescriptor;
/// use refetch::store::CacheStore;
///
/// async fn example(transport: Arc<dyn Transport>) -> Result<(), Box<dyn std::error::Error>> {
///     let engine = FetchOrchestrator::new(transport, Arc::new(CacheStore::in_memory()));
///     let record = engine
///         .fetch(RequestDescriptor::get("/posts/1"), CachePolicy::CacheFirst, None)
///         .await?;
///     println!("{} bytes cached", record.body().len());
///     engine.close();
///     Ok(())
/// }
/// ```
pub struct FetchOrchestrator {
    transport: Arc<dyn Transport>,
    store: Arc<CacheStore>,
    inflight: InflightRegistry<SharedOutcome>,
    default_ttl: Option<Duration>,
    closed: AtomicBool,
}

impl FetchOrchestrator {
    /// Creates an orchestrator over the given transport and store.
    pub fn new(transport: Arc<dyn Transport>, store: Arc<CacheStore>) -> Self {
        Self {
            transport,
            store,
            inflight: InflightRegistry::new(),
            default_ttl: None,
            closed: AtomicBool::new(false),
        }
    }

    /// Sets the TTL applied when `fetch` is called without an explicit one.
    ///
    /// Without this, records default to no TTL: cached until evicted or
    /// invalidated.
    #[must_use]
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = Some(ttl);
        self
    }

    /// Fetches a record for `descriptor` according to `policy`.
    ///
    /// `ttl` overrides the orchestrator-level default for any record stored
    /// by this call; `None` falls back to that default.
    ///
    /// # Errors
    ///
    /// - [`FetchError::CacheMiss`] — `CacheOnly` with nothing cached.
    /// - [`FetchError::Transport`] — the network failed and no stale
    ///   fallback applied.
    /// - [`FetchError::Cancelled`] — the engine was closed underneath this
    ///   call.
    pub async fn fetch(
        &self,
        descriptor: RequestDescriptor,
        policy: CachePolicy,
        ttl: Option<Duration>,
    ) -> Result<CacheRecord, FetchError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(FetchError::Cancelled {
                reason: "engine closed".to_owned(),
            });
        }

        let key = RequestKey::for_request(&descriptor);
        debug!(key = %key, ?policy, "fetch");

        match policy {
            CachePolicy::NetworkOnly => {
                self.network_fetch(&key, &descriptor, ttl, false).await
            }
            CachePolicy::CacheOnly => match self.store.get(&key).await {
                Some(record) => Ok(record),
                None => Err(FetchError::CacheMiss {
                    key: key.canonical().to_owned(),
                }),
            },
            CachePolicy::CacheFirst => match self.store.get(&key).await {
                Some(record) => Ok(record),
                None => self.network_fetch(&key, &descriptor, ttl, true).await,
            },
            CachePolicy::NetworkFirst => {
                match self.network_fetch(&key, &descriptor, ttl, true).await {
                    Ok(record) => Ok(record),
                    Err(FetchError::Transport(error)) => match self.store.get_stale(&key).await {
                        Some(stale) => {
                            debug!(key = %key, "network failed; serving stale record");
                            Ok(stale)
                        }
                        None => Err(FetchError::Transport(error)),
                    },
                    Err(other) => Err(other),
                }
            }
            CachePolicy::StaleWhileRevalidate => {
                match self.store.get_stale(&key).await {
                    Some(record) => {
                        // The caller gets the cached value immediately; the
                        // refresh result only matters to future callers.
                        self.spawn_revalidation(key, descriptor, ttl);
                        Ok(record)
                    }
                    None => self.network_fetch(&key, &descriptor, ttl, true).await,
                }
            }
        }
    }

    /// Removes any cached record for `key` from both tiers.
    pub async fn invalidate(&self, key: &RequestKey) -> bool {
        self.store.delete(key).await
    }

    /// Removes every cached record whose canonical key matches `pattern`.
    pub async fn invalidate_pattern(&self, pattern: &Regex) -> usize {
        self.store.delete_pattern(pattern).await
    }

    /// Removes every cached record in the given key namespace.
    pub async fn invalidate_namespace(&self, prefix: &str) -> usize {
        self.store.delete_namespace(prefix).await
    }

    /// Wipes the cache entirely.
    pub async fn clear(&self) {
        self.store.clear().await;
    }

    /// Removes expired records, optionally scoped to a namespace prefix.
    pub async fn cleanup_expired(&self, namespace: Option<&str>) -> usize {
        self.store.cleanup_expired(namespace).await
    }

    /// Number of distinct keys with an in-flight network call.
    pub fn inflight_count(&self) -> usize {
        self.inflight.inflight_count()
    }

    /// Cumulative number of callers served by joining another caller's
    /// network call.
    pub fn coalesced_total(&self) -> u64 {
        self.inflight.coalesced_total()
    }

    /// Entry/byte counts for both cache tiers.
    pub fn cache_stats(&self) -> CacheStats {
        self.store.stats()
    }

    /// Shuts the engine down: subsequent fetches fail with
    /// [`FetchError::Cancelled`], and all waiting callers are released with
    /// the same error.
    ///
    /// In-progress transport calls are not aborted; their results are
    /// discarded.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.inflight.cancel_all("engine closed");
    }

    /// Executes the network call for `key` through the in-flight registry
    /// and optionally stores the resulting record.
    async fn network_fetch(
        &self,
        key: &RequestKey,
        descriptor: &RequestDescriptor,
        ttl: Option<Duration>,
        store_result: bool,
    ) -> Result<CacheRecord, FetchError> {
        let ttl = ttl.or(self.default_ttl);
        let transport = Arc::clone(&self.transport);
        let request = descriptor.clone();
        let record_key = key.clone();

        let (outcome, _joined) = self
            .inflight
            .coalesce(key, move || async move {
                match transport.execute(request).await {
                    Ok(response) => {
                        Ok(CacheRecord::from_response(&record_key, &response, ttl))
                    }
                    Err(cause) => Err(FetchError::from(TransportError::new(cause))),
                }
            })
            .await;

        let record = outcome.map_err(FetchError::from)??;
        if store_result {
            self.store.put(record.clone()).await;
        }
        Ok(record)
    }

    /// Spawns the detached stale-while-revalidate refresh.
    ///
    /// The task owns clones of the engine's collaborators and nothing scoped
    /// to the original caller, so it survives the caller's return. Failures
    /// are logged and never surfaced.
    fn spawn_revalidation(
        &self,
        key: RequestKey,
        descriptor: RequestDescriptor,
        ttl: Option<Duration>,
    ) {
        let ttl = ttl.or(self.default_ttl);
        let transport = Arc::clone(&self.transport);
        let store = Arc::clone(&self.store);
        let inflight = self.inflight.clone();

        tokio::spawn(async move {
            let request_key = key.clone();
            let (outcome, _joined) = inflight
                .coalesce(&key, move || async move {
                    match transport.execute(descriptor).await {
                        Ok(response) => {
                            Ok(CacheRecord::from_response(&request_key, &response, ttl))
                        }
                        Err(cause) => Err(FetchError::from(TransportError::new(cause))),
                    }
                })
                .await;

            match outcome {
                Ok(Ok(record)) => {
                    debug!(key = %key, "background revalidation stored fresh record");
                    store.put(record).await;
                }
                Ok(Err(error)) => {
                    warn!(key = %key, error = %error, "background revalidation failed");
                }
                Err(cancelled) => {
                    warn!(key = %key, reason = %cancelled.reason, "background revalidation dropped");
                }
            }
        });
    }
}
