//! `refetch` is a caching, retrying HTTP request pipeline for remote data
//! integrations.
//!
//! A [`Client`] composes a fixed middleware stack — retry, base-header
//! injection, response cache, wire logging — over a pluggable transport
//! adapter. HTTP error responses are returned to the caller as values; only
//! transport-level failures are errors.
//!
//! # Quick Start
//!
//! ```no_run
//! use refetch::prelude::{Client, RequestOptions, RetryPolicy};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::builder("https://api.example.com")
//!         .try_default_header("x-api-key", "secret")?
//!         .default_cache_ttl_secs(120)
//!         .retry_policy(RetryPolicy::standard())
//!         .try_build()?;
//!
//!     let response = client.get("/v1/items", RequestOptions::new()).await?;
//!     println!("{} {}", response.status(), response.text_lossy());
//!     Ok(())
//! }
//! ```
//!
//! # Parallel batches
//!
//! Queued requests execute together and settle independently — one failure
//! never cancels the rest:
//!
//! ```no_run
//! # use refetch::prelude::{Client, RequestOptions};
//! # use http::Method;
//! # async fn demo(client: &Client) {
//! client.queue_request(Method::GET, "/v1/a", RequestOptions::new());
//! client.queue_request(Method::GET, "/v1/b", RequestOptions::new());
//! let results = client.execute_parallel().await;
//! assert_eq!(results.len(), 2);
//! # }
//! ```

mod cache;
mod client;
mod error;
mod observe;
mod pipeline;
mod proxy;
mod request;
mod response;
mod retry;
mod transport;
mod util;

pub use crate::cache::{
    CacheEntry, CacheHit, CacheStore, CacheStrategy, InMemoryCacheStore, CACHE_STATUS_HEADER,
};
pub use crate::client::{Client, ClientBuilder};
pub use crate::error::{Error, ErrorCode, TransportErrorKind};
pub use crate::observe::{
    CacheDisposition, MetricsSnapshot, RequestObserver, RequestRecord,
};
pub use crate::pipeline::Handler;
pub use crate::proxy::{SandboxProxy, FORWARD_HEADERS_HEADER, PROXY_URL_PARAM};
pub use crate::request::{Request, RequestOptions};
pub use crate::response::Response;
pub use crate::retry::{
    RetryContext, RetryDecisionHook, RetryDelayHook, RetryPolicy, MAX_RETRIES,
};
pub use crate::transport::{HyperTransport, Transport};

pub type Result<T> = std::result::Result<T, Error>;

pub mod prelude {
    pub use crate::{
        CacheDisposition, CacheEntry, CacheHit, CacheStore, CacheStrategy, Client, ClientBuilder,
        Error, ErrorCode, InMemoryCacheStore, MetricsSnapshot, RequestObserver, RequestOptions,
        RequestRecord, Response, Result, RetryPolicy, SandboxProxy, Transport, TransportErrorKind,
    };
}

#[cfg(test)]
mod tests;
