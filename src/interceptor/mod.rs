//! Network interceptor for offline support.
//!
//! Every outgoing GET is classified and answered with one strategy:
//! - static files: cache-first
//! - API calls: network-first, falling back to the last cached copy
//! - navigations: network-first, falling back to a cached or built-in offline page
//! - everything else: network-only
//!
//! Install prefetches the manifest into the static cache; activate drops
//! caches from older generations.

mod classify;
mod http;
mod layer;

pub use classify::{RequestClass, RouteRules};
pub use http::{FetchError, Fetcher, HttpFetcher, Request, RequestMode, Response, ResponseSource};
pub use layer::{CacheNames, Interceptor, Outcome, OFFLINE_PAGE};

#[cfg(test)]
pub(crate) use http::testing;
