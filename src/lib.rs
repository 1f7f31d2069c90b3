//! # refetch
//!
//! Request deduplication and tiered response caching for async HTTP clients.
//!
//! The crate sits between your application and whatever HTTP client you
//! already use. You describe requests with a [`RequestDescriptor`], pick a
//! [`CachePolicy`], and the [`FetchOrchestrator`] decides whether to serve
//! from the hot in-memory tier, the persistent tier, or the network —
//! coalescing concurrent identical requests into a single transport call.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use refetch::{CachePolicy, FetchOrchestrator, RequestDescriptor};
//! use refetch::store::CacheStore;
//! # fn transport() -> Arc<dyn refetch::fetch::Transport> { unimplemented!() }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = FetchOrchestrator::new(transport(), Arc::new(CacheStore::in_memory()))
//!         .with_default_ttl(Duration::from_secs(300));
//!
//!     // First call hits the network; identical concurrent calls coalesce;
//!     // later calls within the TTL are served from cache.
//!     let record = engine
//!         .fetch(RequestDescriptor::get("/api/posts?page=1"), CachePolicy::CacheFirst, None)
//!         .await?;
//!     println!("status {} ({} bytes)", record.status(), record.body().len());
//!
//!     engine.close();
//!     Ok(())
//! }
//! ```

pub mod fetch;
pub mod http;
pub mod inflight;
pub mod key;
pub mod record;
pub mod store;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use fetch::{CachePolicy, FetchError, FetchOrchestrator};
pub use http::{Body, Headers, Method, RawResponse, RequestDescriptor};
pub use key::RequestKey;
pub use record::CacheRecord;
pub use store::{CacheConfig, CacheStore};
