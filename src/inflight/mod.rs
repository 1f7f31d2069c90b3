//! Single-flight request coalescing.
//!
//! [`InflightRegistry`] guarantees at most one in-flight execution per
//! canonical request key. The first caller for a key becomes the leader and
//! starts the execution; every caller that arrives while it is pending joins
//! the same shared outcome instead of executing again. Success and failure
//! propagate identically to the leader and every joiner.
//!
//! The execution itself runs on a detached task, so a caller cancelling its
//! wait never cancels the shared work other joiners may depend on. Only
//! [`cancel_all`](InflightRegistry::cancel_all) (or
//! [`clear`](InflightRegistry::clear)) drops tracking, and even that does
//! not abort the underlying transport call; cancelling the actual I/O is the
//! transport collaborator's responsibility.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::key::RequestKey;

/// Error delivered to callers whose tracked entry was force-dropped.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("in-flight request cancelled: {reason}")]
pub struct Cancelled {
    /// Why tracking was dropped (e.g. "engine closed").
    pub reason: String,
}

/// Key lifecycle notifications for external inflight-count tracking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InflightEvent {
    /// A key transitioned Idle → Pending.
    Started(String),
    /// A key transitioned Pending → Idle.
    Settled(String),
}

/// Callback invoked on every [`InflightEvent`].
pub type InflightHook = Arc<dyn Fn(InflightEvent) + Send + Sync>;

struct Entry<T> {
    /// Distinguishes this pending execution from any successor under the
    /// same key, so a cancelled leader can never remove a successor's entry.
    token: u64,
    started_at: Instant,
    waiters: Vec<oneshot::Sender<Result<T, Cancelled>>>,
}

struct Inner<T> {
    entries: Mutex<HashMap<String, Entry<T>>>,
    next_token: AtomicU64,
    coalesced_total: AtomicU64,
    hook: Option<InflightHook>,
}

impl<T> Inner<T> {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry<T>>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("recovered from poisoned inflight lock");
                poisoned.into_inner()
            }
        }
    }

    fn emit(&self, event: InflightEvent) {
        if let Some(hook) = &self.hook {
            hook(event);
        }
    }
}

/// Tracks one pending execution per request key and joins duplicate callers
/// to the shared result.
///
/// Generic over the shared outcome type; the orchestrator instantiates it
/// with its fetch result. The outcome must be `Clone` because it is
/// republished to every joiner.
pub struct InflightRegistry<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for InflightRegistry<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for InflightRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> InflightRegistry<T> {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::with_hook(None)
    }

    /// Creates a registry that reports key transitions through `hook`.
    pub fn with_hook(hook: Option<InflightHook>) -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: Mutex::new(HashMap::new()),
                next_token: AtomicU64::new(0),
                coalesced_total: AtomicU64::new(0),
                hook,
            }),
        }
    }

    /// Number of keys currently pending.
    pub fn inflight_count(&self) -> usize {
        self.inner.lock().len()
    }

    /// Cumulative number of callers that joined an existing execution
    /// instead of starting one (incremented once per joining caller).
    pub fn coalesced_total(&self) -> u64 {
        self.inner.coalesced_total.load(Ordering::Relaxed)
    }

    /// Drops all tracked entries, delivering a [`Cancelled`] error carrying
    /// `reason` to every waiting caller.
    ///
    /// Does **not** cancel the underlying executions; those keep running to
    /// completion and their results are discarded.
    pub fn cancel_all(&self, reason: &str) {
        let drained: Vec<(String, Entry<T>)> = self.inner.lock().drain().collect();
        for (key, entry) in drained {
            debug!(key = %key, reason, "dropping in-flight entry");
            for waiter in entry.waiters {
                let _ = waiter.send(Err(Cancelled {
                    reason: reason.to_owned(),
                }));
            }
            self.inner.emit(InflightEvent::Settled(key));
        }
    }

    /// [`cancel_all`](Self::cancel_all) with a generic reason.
    pub fn clear(&self) {
        self.cancel_all("registry cleared");
    }
}

impl<T: Clone + Send + 'static> InflightRegistry<T> {
    /// Runs `execute` at most once per key, joining duplicate concurrent
    /// callers to the shared outcome.
    ///
    /// Returns the outcome and whether this caller was coalesced onto an
    /// execution started by someone else. The pending entry is removed
    /// before any caller observes the outcome, so a caller arriving at the
    /// exact moment of completion either joins the still-pending entry or
    /// starts a fresh execution — never neither.
    ///
    /// The execution runs on a detached task: dropping this future (e.g. a
    /// caller-side timeout) does not abort it, and other joiners still
    /// receive its result.
    pub async fn coalesce<F, Fut>(&self, key: &RequestKey, execute: F) -> (Result<T, Cancelled>, bool)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let canonical = key.canonical();
        let (receiver, leadership) = self.register(canonical);

        let Some(token) = leadership else {
            self.inner.coalesced_total.fetch_add(1, Ordering::Relaxed);
            debug!(key = canonical, "joined in-flight request");
            return (flatten(receiver.await), true);
        };

        debug!(key = canonical, "starting in-flight request");
        self.inner.emit(InflightEvent::Started(canonical.to_owned()));

        // Invoked exactly once, before this caller can be cancelled.
        let execution = execute();
        let inner = Arc::clone(&self.inner);
        let owned_key = canonical.to_owned();
        tokio::spawn(async move {
            let outcome = execution.await;
            settle(&inner, &owned_key, token, outcome);
        });

        (flatten(receiver.await), false)
    }

    /// Registers this caller under `canonical`, creating the pending entry
    /// if the key is idle. Returns the caller's receiver, plus the new
    /// entry's token when this caller became the leader.
    fn register(&self, canonical: &str) -> (oneshot::Receiver<Result<T, Cancelled>>, Option<u64>) {
        let (tx, rx) = oneshot::channel();
        let mut entries = self.inner.lock();
        match entries.get_mut(canonical) {
            Some(entry) => {
                entry.waiters.push(tx);
                (rx, None)
            }
            None => {
                let token = self.inner.next_token.fetch_add(1, Ordering::Relaxed);
                entries.insert(
                    canonical.to_owned(),
                    Entry {
                        token,
                        started_at: Instant::now(),
                        waiters: vec![tx],
                    },
                );
                (rx, Some(token))
            }
        }
    }
}

/// Removes the pending entry (if this execution still owns it) and
/// republishes the outcome to every waiter.
fn settle<T: Clone>(inner: &Inner<T>, key: &str, token: u64, outcome: T) {
    let entry = {
        let mut entries = inner.lock();
        match entries.get(key) {
            Some(entry) if entry.token == token => entries.remove(key),
            // A cancel_all (or a successor execution) already owns the key;
            // its waiters were, or will be, notified elsewhere.
            _ => None,
        }
    };

    let Some(entry) = entry else {
        return;
    };

    debug!(
        key = %key,
        elapsed = ?entry.started_at.elapsed(),
        waiters = entry.waiters.len(),
        "in-flight request settled"
    );
    for waiter in entry.waiters {
        let _ = waiter.send(Ok(outcome.clone()));
    }
    inner.emit(InflightEvent::Settled(key.to_owned()));
}

fn flatten<T>(received: Result<Result<T, Cancelled>, oneshot::error::RecvError>) -> Result<T, Cancelled> {
    match received {
        Ok(outcome) => outcome,
        // The settling task can only disappear without sending if the
        // runtime is shutting down.
        Err(_) => Err(Cancelled {
            reason: "executor dropped".to_owned(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::RequestDescriptor;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn key_for(url: &str) -> RequestKey {
        RequestKey::for_request(&RequestDescriptor::get(url))
    }

    #[tokio::test]
    async fn five_concurrent_callers_one_execution() {
        let registry: InflightRegistry<u32> = InflightRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let key = key_for("/posts");

        let run = |_: usize| {
            let registry = registry.clone();
            let calls = Arc::clone(&calls);
            let key = key.clone();
            async move {
                registry
                    .coalesce(&key, move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        42u32
                    })
                    .await
            }
        };

        let (a, b, c, d, e) = tokio::join!(run(0), run(1), run(2), run(3), run(4));

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        for (outcome, _) in [&a, &b, &c, &d, &e] {
            assert_eq!(outcome.as_ref().unwrap(), &42);
        }
        // Exactly one leader; the other four joined.
        let joined = [a.1, b.1, c.1, d.1, e.1].iter().filter(|j| **j).count();
        assert_eq!(joined, 4);
        assert_eq!(registry.coalesced_total(), 4);
        assert_eq!(registry.inflight_count(), 0);
    }

    #[tokio::test]
    async fn failure_propagates_to_all_joiners() {
        let registry: InflightRegistry<Result<u32, String>> = InflightRegistry::new();
        let key = key_for("/fails");

        let run = || {
            let registry = registry.clone();
            let key = key.clone();
            async move {
                registry
                    .coalesce(&key, || async {
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        Err::<u32, String>("boom".to_owned())
                    })
                    .await
            }
        };

        let (a, b) = tokio::join!(run(), run());
        assert_eq!(a.0.unwrap(), Err("boom".to_owned()));
        assert_eq!(b.0.unwrap(), Err("boom".to_owned()));
    }

    #[tokio::test]
    async fn distinct_keys_do_not_coalesce() {
        let registry: InflightRegistry<u32> = InflightRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let run = |url: &'static str| {
            let registry = registry.clone();
            let calls = Arc::clone(&calls);
            async move {
                registry
                    .coalesce(&key_for(url), move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        1u32
                    })
                    .await
            }
        };

        let _ = tokio::join!(run("/a"), run("/b"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(registry.coalesced_total(), 0);
    }

    #[tokio::test]
    async fn sequential_calls_execute_each_time() {
        let registry: InflightRegistry<u32> = InflightRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let key = key_for("/seq");

        for _ in 0..3 {
            let calls = Arc::clone(&calls);
            let (outcome, joined) = registry
                .coalesce(&key, move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    7u32
                })
                .await;
            assert_eq!(outcome.unwrap(), 7);
            assert!(!joined);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn cancel_all_delivers_reason_and_frees_key() {
        let registry: InflightRegistry<u32> = InflightRegistry::new();
        let key = key_for("/slow");

        let waiter = {
            let registry = registry.clone();
            let key = key.clone();
            tokio::spawn(async move {
                registry
                    .coalesce(&key, || async {
                        tokio::time::sleep(Duration::from_secs(60)).await;
                        1u32
                    })
                    .await
            })
        };

        // Let the leader register before dropping tracking.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(registry.inflight_count(), 1);
        registry.cancel_all("engine closed");

        let (outcome, _) = waiter.await.unwrap();
        assert_eq!(
            outcome,
            Err(Cancelled {
                reason: "engine closed".to_owned()
            })
        );
        assert_eq!(registry.inflight_count(), 0);

        // The key is immediately reusable by a fresh execution.
        let (outcome, joined) = registry.coalesce(&key, || async { 9u32 }).await;
        assert_eq!(outcome.unwrap(), 9);
        assert!(!joined);
    }

    #[tokio::test]
    async fn transition_events_fire_in_order() {
        let events: Arc<Mutex<Vec<InflightEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let hook: InflightHook = Arc::new(move |event| sink.lock().unwrap().push(event));

        let registry: InflightRegistry<u32> = InflightRegistry::with_hook(Some(hook));
        let key = key_for("/events");
        let _ = registry.coalesce(&key, || async { 1u32 }).await;

        let events = events.lock().unwrap();
        assert_eq!(
            *events,
            vec![
                InflightEvent::Started("GET:/events".to_owned()),
                InflightEvent::Settled("GET:/events".to_owned()),
            ]
        );
    }
}
