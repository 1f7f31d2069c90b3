//! HTTP-shaped primitives consumed by the cache engine.
//!
//! This module provides the request-side types the engine canonicalizes and
//! caches: [`Method`], [`Headers`], [`RequestDescriptor`], [`Body`], and
//! [`RawResponse`]. There is deliberately no wire parsing or transport here;
//! executing a descriptor against a real network is the job of the external
//! [`Transport`](crate::fetch::Transport) collaborator.

pub mod descriptor;
pub mod headers;
pub mod method;

pub use descriptor::{Body, RawResponse, RequestDescriptor};
pub use headers::Headers;
pub use method::Method;
