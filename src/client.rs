use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use http::header::{HeaderName, HeaderValue, USER_AGENT};
use http::{HeaderMap, Method};

use crate::cache::{CacheStore, CacheStrategy, InMemoryCacheStore, CACHE_STATUS_HEADER};
use crate::observe::{CacheDisposition, Metrics, MetricsSnapshot, RequestObserver, RequestRecord};
use crate::pipeline::{build_stack, Handler, Stack};
use crate::proxy::SandboxProxy;
use crate::request::{QueuedRequest, Request, RequestOptions, DEFAULT_REQUEST_TIMEOUT};
use crate::response::Response;
use crate::retry::RetryPolicy;
use crate::transport::{HyperTransport, Transport};
use crate::util::{lock_unpoisoned, parse_header_name, parse_header_value, redact_uri_for_logs, resolve_uri};
use crate::Result;

const DEFAULT_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

static SHARED_CLIENT: OnceLock<Arc<Client>> = OnceLock::new();

pub struct ClientBuilder {
    base_url: String,
    default_headers: HeaderMap,
    default_options: RequestOptions,
    request_timeout: Duration,
    retry_policy: RetryPolicy,
    cache_store: Option<Arc<dyn CacheStore>>,
    default_cache_ttl_secs: Option<i64>,
    error_ttl: Option<Duration>,
    accepted_status_codes: Option<Vec<u16>>,
    transport: Option<Arc<dyn Transport>>,
    sandbox_proxy: Option<SandboxProxy>,
    observer: Option<Arc<dyn RequestObserver>>,
}

impl ClientBuilder {
    pub(crate) fn new(base_url: impl Into<String>) -> Self {
        let mut default_headers = HeaderMap::new();
        default_headers.insert(USER_AGENT, HeaderValue::from_static(DEFAULT_USER_AGENT));
        Self {
            base_url: base_url.into(),
            default_headers,
            default_options: RequestOptions::default(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            retry_policy: RetryPolicy::standard(),
            cache_store: None,
            default_cache_ttl_secs: None,
            error_ttl: None,
            accepted_status_codes: None,
            transport: None,
            sandbox_proxy: None,
            observer: None,
        }
    }

    /// Base header injected into every request, replacing any same-named
    /// per-call header.
    pub fn default_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.default_headers.insert(name, value);
        self
    }

    pub fn try_default_header(self, name: &str, value: &str) -> Result<Self> {
        let name = parse_header_name(name)?;
        let value = parse_header_value(name.as_str(), value)?;
        Ok(self.default_header(name, value))
    }

    /// Instance-level options merged under every call's options.
    pub fn default_options(mut self, default_options: RequestOptions) -> Self {
        self.default_options = default_options;
        self
    }

    pub fn request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout.max(Duration::from_millis(1));
        self
    }

    pub fn retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn cache_store(mut self, cache_store: Arc<dyn CacheStore>) -> Self {
        self.cache_store = Some(cache_store);
        self
    }

    /// Default cache TTL in seconds for accepted responses. Negative
    /// disables caching for this client.
    pub fn default_cache_ttl_secs(mut self, default_cache_ttl_secs: i64) -> Self {
        self.default_cache_ttl_secs = Some(default_cache_ttl_secs);
        self
    }

    pub fn error_ttl(mut self, error_ttl: Duration) -> Self {
        self.error_ttl = Some(error_ttl);
        self
    }

    pub fn accepted_status_codes(mut self, codes: impl IntoIterator<Item = u16>) -> Self {
        self.accepted_status_codes = Some(codes.into_iter().collect());
        self
    }

    /// Replaces the production transport; the seam tests use to script wire
    /// behavior.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Routes requests through a same-origin CORS proxy (sandboxed hosts).
    /// Applies to the built-in transport only.
    pub fn sandbox_proxy(mut self, sandbox_proxy: SandboxProxy) -> Self {
        self.sandbox_proxy = Some(sandbox_proxy);
        self
    }

    pub fn observer(mut self, observer: Arc<dyn RequestObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn try_build(self) -> Result<Client> {
        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HyperTransport::with_proxy(self.sandbox_proxy)?),
        };

        let store: Arc<dyn CacheStore> = self
            .cache_store
            .unwrap_or_else(|| Arc::new(InMemoryCacheStore::new()));
        let mut strategy = CacheStrategy::new(store);
        if let Some(default_cache_ttl_secs) = self.default_cache_ttl_secs {
            strategy = strategy.default_ttl_secs(default_cache_ttl_secs);
        }
        if let Some(error_ttl) = self.error_ttl {
            strategy = strategy.error_ttl(error_ttl);
        }
        if let Some(accepted_status_codes) = self.accepted_status_codes {
            strategy = strategy.accepted_status_codes(accepted_status_codes);
        }

        let metrics = Metrics::default();
        let pipeline = build_stack(
            self.retry_policy,
            self.default_headers.clone(),
            Arc::new(strategy),
            transport,
            metrics.clone(),
        );

        Ok(Client {
            base_url: self.base_url,
            default_options: self.default_options,
            request_timeout: self.request_timeout,
            pipeline,
            metrics,
            observer: self.observer,
            queued_requests: Mutex::new(Vec::new()),
        })
    }

    pub fn build(self) -> Client {
        self.try_build()
            .unwrap_or_else(|error| panic!("failed to build refetch client: {error}"))
    }
}

/// The request pipeline's entry point.
///
/// A `Client` owns its middleware stack — built once, immutable afterwards —
/// plus the instance defaults merged into every call. HTTP error responses
/// (4xx/5xx) are returned as [`Response`]s; only transport-level failures
/// surface as [`Error`](crate::Error)s, after retries are exhausted.
pub struct Client {
    base_url: String,
    default_options: RequestOptions,
    request_timeout: Duration,
    pipeline: Stack,
    metrics: Metrics,
    observer: Option<Arc<dyn RequestObserver>>,
    queued_requests: Mutex<Vec<QueuedRequest>>,
}

impl Client {
    pub fn builder(base_url: impl Into<String>) -> ClientBuilder {
        ClientBuilder::new(base_url)
    }

    /// Installs a process-wide shared instance. The first install wins;
    /// later calls return the rejected instance unchanged.
    pub fn set_shared(client: Arc<Client>) -> std::result::Result<(), Arc<Client>> {
        SHARED_CLIENT.set(client)
    }

    /// The process-wide shared instance, if one was installed.
    pub fn shared() -> Option<Arc<Client>> {
        SHARED_CLIENT.get().cloned()
    }

    pub async fn request(
        &self,
        method: Method,
        uri: impl AsRef<str>,
        options: RequestOptions,
    ) -> Result<Response> {
        let options = options.merge_over(&self.default_options);
        let (uri_text, uri) = resolve_uri(&self.base_url, uri.as_ref())?;

        let mut request = Request::new(method.clone(), uri)
            .with_headers(options.headers.clone())
            .with_timeout(options.timeout.unwrap_or(self.request_timeout));
        if let Some(version) = options.http_version {
            request = request.with_version(version);
        }
        if let Some(body) = options.body {
            request = request.with_body(body);
        }

        self.metrics.record_request_started();
        let started = Instant::now();
        let outcome = self.pipeline.handle(request).await;
        let elapsed = started.elapsed();
        self.metrics.record_request_completed(&outcome, elapsed);

        if let Some(observer) = &self.observer {
            observer.on_request(&request_record(&method, &uri_text, &outcome, elapsed));
        }
        outcome
    }

    pub async fn get(&self, uri: impl AsRef<str>, options: RequestOptions) -> Result<Response> {
        self.request(Method::GET, uri, options).await
    }

    pub async fn post(&self, uri: impl AsRef<str>, options: RequestOptions) -> Result<Response> {
        self.request(Method::POST, uri, options).await
    }

    /// Queues a request for the next [`execute_parallel`](Self::execute_parallel)
    /// call. Nothing is executed until then.
    pub fn queue_request(
        &self,
        method: Method,
        uri: impl Into<String>,
        options: RequestOptions,
    ) {
        lock_unpoisoned(&self.queued_requests).push(QueuedRequest {
            method,
            uri: uri.into(),
            options,
        });
    }

    /// Fires every queued request concurrently and waits for all of them to
    /// settle. A failing request never cancels the others; results come back
    /// in queue order, one per queued request. The queue is cleared before
    /// dispatch, so it is empty again by the time this returns.
    pub async fn execute_parallel(&self) -> Vec<Result<Response>> {
        let queued: Vec<QueuedRequest> = {
            let mut queue = lock_unpoisoned(&self.queued_requests);
            queue.drain(..).collect()
        };

        futures::future::join_all(queued.into_iter().map(|queued_request| {
            self.request(
                queued_request.method,
                queued_request.uri,
                queued_request.options,
            )
        }))
        .await
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}

fn request_record(
    method: &Method,
    uri_text: &str,
    outcome: &Result<Response>,
    elapsed: Duration,
) -> RequestRecord {
    let (status, error_code, cache) = match outcome {
        Ok(response) => {
            let cache = match response.headers().get(CACHE_STATUS_HEADER) {
                Some(value) if value.as_bytes() == b"HIT" => CacheDisposition::Hit,
                Some(_) => CacheDisposition::Miss,
                None => CacheDisposition::Uncached,
            };
            (Some(response.status().as_u16()), None, cache)
        }
        Err(error) => (None, Some(error.code()), CacheDisposition::Uncached),
    };

    RequestRecord {
        method: method.clone(),
        uri: redact_uri_for_logs(uri_text),
        status,
        error_code,
        elapsed,
        cache,
    }
}
