use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use http::header::{HeaderName, AUTHORIZATION, CACHE_CONTROL, ETAG, LAST_MODIFIED};
use http::{HeaderMap, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::request::Request;
use crate::response::Response;
use crate::util::{lock_unpoisoned, redact_uri_for_logs, sha256_hex};

pub(crate) const DEFAULT_CACHE_TTL_SECS: i64 = 300;
pub(crate) const ERROR_RESPONSE_TTL: Duration = Duration::from_secs(30);

/// Header added to responses that passed through an enabled cache layer,
/// valued `HIT` or `MISS`.
pub const CACHE_STATUS_HEADER: HeaderName = HeaderName::from_static("x-cache-status");

/// A stored response plus the metadata needed to expire and introspect it.
///
/// Entries are plain data so external stores can persist them; expiry
/// (`now > created_at + ttl`) is enforced by the store, not the strategy.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheEntry {
    status: u16,
    headers: Vec<(String, String)>,
    body: Bytes,
    created_at: u64,
    ttl_secs: u64,
}

impl CacheEntry {
    pub(crate) fn from_parts(
        status: StatusCode,
        headers: &HeaderMap,
        body: Bytes,
        ttl: Duration,
        now: SystemTime,
    ) -> Self {
        let headers = headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_owned(), value.to_owned()))
            })
            .collect();
        Self {
            status: status.as_u16(),
            headers,
            body,
            created_at: unix_seconds(now),
            ttl_secs: ttl.as_secs(),
        }
    }

    /// Rebuilds the stored response. Returns `None` when the entry cannot be
    /// reconstructed (e.g. a corrupt status from a foreign store).
    pub fn to_response(&self) -> Option<Response> {
        let status = StatusCode::from_u16(self.status).ok()?;
        let mut headers = HeaderMap::with_capacity(self.headers.len());
        for (name, value) in &self.headers {
            let Ok(name) = name.parse::<HeaderName>() else {
                continue;
            };
            let Ok(value) = value.parse() else {
                continue;
            };
            headers.append(name, value);
        }
        Some(Response::new(status, headers, self.body.clone()))
    }

    pub fn age(&self, now: SystemTime) -> Duration {
        Duration::from_secs(unix_seconds(now).saturating_sub(self.created_at))
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn is_fresh(&self, now: SystemTime) -> bool {
        unix_seconds(now) <= self.created_at.saturating_add(self.ttl_secs)
    }
}

fn unix_seconds(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

/// A shared key/value backend for cached responses.
///
/// Stores are assumed to be shared with other writers: the last writer for a
/// key wins and a slightly stale read is acceptable. Implementations signal
/// failure by returning `None`/`false` — a failed read is a miss, a failed
/// write is skipped, and neither reaches the caller as an error.
pub trait CacheStore: Send + Sync {
    fn get(&self, key: &str) -> Option<CacheEntry>;
    fn set(&self, key: &str, entry: CacheEntry, ttl: Duration) -> bool;
}

/// Process-local store used when no external backend is supplied.
#[derive(Default)]
pub struct InMemoryCacheStore {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl InMemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CacheStore for InMemoryCacheStore {
    fn get(&self, key: &str) -> Option<CacheEntry> {
        let now = SystemTime::now();
        let mut entries = lock_unpoisoned(&self.entries);
        let expired = match entries.get(key) {
            Some(entry) => {
                if entry.is_fresh(now) {
                    return Some(entry.clone());
                }
                true
            }
            None => false,
        };
        if expired {
            entries.remove(key);
        }
        None
    }

    fn set(&self, key: &str, entry: CacheEntry, _ttl: Duration) -> bool {
        lock_unpoisoned(&self.entries).insert(key.to_owned(), entry);
        true
    }
}

/// A cache read that found a fresh entry.
#[derive(Clone, Debug)]
pub struct CacheHit {
    pub response: Response,
    pub age: Duration,
    pub ttl: Duration,
}

/// Decides what is cacheable, under which key, and for how long.
///
/// Keys are derived from method + full URI + the body's content hash (when
/// present) + the values of a fixed allow-list of cache-invalidating headers.
/// Including those headers guarantees a cached response is never served to a
/// request carrying different credentials or cache directives; every other
/// header is deliberately excluded to keep the hit rate high.
pub struct CacheStrategy {
    store: Arc<dyn CacheStore>,
    default_ttl_secs: i64,
    error_ttl: Duration,
    accepted_status_codes: BTreeSet<u16>,
    invalidating_headers: Vec<HeaderName>,
}

impl CacheStrategy {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self {
            store,
            default_ttl_secs: DEFAULT_CACHE_TTL_SECS,
            error_ttl: ERROR_RESPONSE_TTL,
            accepted_status_codes: default_accepted_status_codes(),
            invalidating_headers: vec![AUTHORIZATION, CACHE_CONTROL],
        }
    }

    /// Default TTL in seconds for accepted responses. A negative value
    /// disables caching entirely.
    pub fn default_ttl_secs(mut self, default_ttl_secs: i64) -> Self {
        self.default_ttl_secs = default_ttl_secs;
        self
    }

    /// TTL for responses outside the accepted status set. Kept short so a
    /// cached transient failure has a bounded blast radius.
    pub fn error_ttl(mut self, error_ttl: Duration) -> Self {
        self.error_ttl = error_ttl;
        self
    }

    pub fn accepted_status_codes(mut self, codes: impl IntoIterator<Item = u16>) -> Self {
        self.accepted_status_codes = codes.into_iter().collect();
        self
    }

    pub fn invalidating_headers(mut self, names: impl IntoIterator<Item = HeaderName>) -> Self {
        self.invalidating_headers = names.into_iter().collect();
        self
    }

    pub fn enabled(&self) -> bool {
        self.default_ttl_secs >= 0
    }

    /// Deterministic cache key for `request`.
    pub fn cache_key(&self, request: &Request) -> String {
        let mut material = format!("{} {}", request.method(), request.uri());
        for name in &self.invalidating_headers {
            for value in request.headers().get_all(name) {
                material.push('\n');
                material.push_str(name.as_str());
                material.push(':');
                material.push_str(&String::from_utf8_lossy(value.as_bytes()));
            }
        }
        if !request.body().is_empty() {
            material.push_str("\nbody:");
            material.push_str(&sha256_hex(request.body()));
        }
        sha256_hex(material.as_bytes())
    }

    pub fn ttl_for(&self, response: &Response) -> Duration {
        if self.accepted_status_codes.contains(&response.status().as_u16()) {
            Duration::from_secs(self.default_ttl_secs.max(0) as u64)
        } else {
            self.error_ttl
        }
    }

    /// Looks up `request` in the store. Store failures and unreadable
    /// entries are misses; this path never fails.
    pub fn fetch(&self, request: &Request) -> Option<CacheHit> {
        if !self.enabled() {
            return None;
        }

        let key = self.cache_key(request);
        let uri = redact_uri_for_logs(&request.uri().to_string());
        let Some(entry) = self.store.get(&key) else {
            debug!(
                method = %request.method(),
                %uri,
                has_body = !request.body().is_empty(),
                cache_key = %key,
                "cache miss"
            );
            return None;
        };

        let Some(response) = entry.to_response() else {
            debug!(
                method = %request.method(),
                %uri,
                has_body = !request.body().is_empty(),
                cache_key = %key,
                "cache entry unreadable, treating as miss"
            );
            return None;
        };

        let age = entry.age(SystemTime::now());
        debug!(
            method = %request.method(),
            %uri,
            has_body = !request.body().is_empty(),
            cache_key = %key,
            age_secs = age.as_secs(),
            ttl_secs = entry.ttl().as_secs(),
            "cache hit"
        );
        Some(CacheHit {
            response,
            age,
            ttl: entry.ttl(),
        })
    }

    /// Stores `response` under the key for `request`. Conditional-request
    /// headers are stripped from the stored copy since this strategy does no
    /// revalidation. Returns whether the write occurred.
    pub fn write(&self, request: &Request, response: &Response) -> bool {
        if !self.enabled() {
            return false;
        }

        let key = self.cache_key(request);
        let ttl = self.ttl_for(response);
        let mut headers = response.headers().clone();
        headers.remove(ETAG);
        headers.remove(LAST_MODIFIED);
        let entry = CacheEntry::from_parts(
            response.status(),
            &headers,
            response.body().clone(),
            ttl,
            SystemTime::now(),
        );

        let stored = self.store.set(&key, entry, ttl);
        debug!(
            method = %request.method(),
            uri = %redact_uri_for_logs(&request.uri().to_string()),
            has_body = !request.body().is_empty(),
            cache_key = %key,
            status = response.status().as_u16(),
            ttl_secs = ttl.as_secs(),
            stored,
            "cache write"
        );
        stored
    }
}

fn default_accepted_status_codes() -> BTreeSet<u16> {
    [200_u16, 201, 202, 204, 206].into_iter().collect()
}
