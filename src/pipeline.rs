use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use http::header::HeaderValue;
use http::HeaderMap;
use tokio::time::sleep;
use tracing::{debug, info_span, warn, Instrument};

use crate::cache::{CacheStrategy, CACHE_STATUS_HEADER};
use crate::observe::Metrics;
use crate::request::Request;
use crate::response::Response;
use crate::retry::RetryPolicy;
use crate::transport::Transport;
use crate::util::redact_uri_for_logs;
use crate::Result;

/// One stage of the request pipeline.
///
/// Each layer holds its successor and was composed once at client build
/// time; the chain is fixed, ordered, and immutable after construction.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, request: Request) -> Result<Response>;
}

/// Innermost stage: hands the request to the transport adapter.
pub(crate) struct TransportLayer {
    transport: Arc<dyn Transport>,
}

impl TransportLayer {
    pub(crate) fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl Handler for TransportLayer {
    async fn handle(&self, request: Request) -> Result<Response> {
        self.transport.send(&request).await
    }
}

/// Logs every wire attempt with method, redacted target, timing, and
/// outcome. Purely observational; the outcome passes through unchanged.
pub(crate) struct LogLayer<H> {
    inner: H,
}

impl<H> LogLayer<H> {
    pub(crate) fn new(inner: H) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<H: Handler> Handler for LogLayer<H> {
    async fn handle(&self, request: Request) -> Result<Response> {
        let span = info_span!(
            "refetch.request",
            method = %request.method(),
            uri = %redact_uri_for_logs(&request.uri().to_string())
        );
        let inner = &self.inner;
        async move {
            debug!("sending request");
            let started = Instant::now();
            let outcome = inner.handle(request).await;
            let elapsed_ms = started.elapsed().as_millis() as u64;
            match &outcome {
                Ok(response) => {
                    debug!(
                        status = response.status().as_u16(),
                        elapsed_ms,
                        "request completed"
                    );
                }
                Err(error) => {
                    warn!(error = %error, elapsed_ms, "request failed");
                }
            }
            outcome
        }
        .instrument(span)
        .await
    }
}

/// Serves fresh cached responses and stores new ones on the way back up.
pub(crate) struct CacheLayer<H> {
    strategy: Arc<CacheStrategy>,
    metrics: Metrics,
    inner: H,
}

impl<H> CacheLayer<H> {
    pub(crate) fn new(strategy: Arc<CacheStrategy>, metrics: Metrics, inner: H) -> Self {
        Self {
            strategy,
            metrics,
            inner,
        }
    }
}

#[async_trait]
impl<H: Handler> Handler for CacheLayer<H> {
    async fn handle(&self, request: Request) -> Result<Response> {
        if let Some(hit) = self.strategy.fetch(&request) {
            self.metrics.record_cache_hit();
            return Ok(hit
                .response
                .with_header(CACHE_STATUS_HEADER, HeaderValue::from_static("HIT")));
        }
        if self.strategy.enabled() {
            self.metrics.record_cache_miss();
        }

        let outcome = self.inner.handle(request.clone()).await;
        match outcome {
            Ok(response) if self.strategy.enabled() => {
                if self.strategy.write(&request, &response) {
                    self.metrics.record_cache_write();
                }
                Ok(response.with_header(CACHE_STATUS_HEADER, HeaderValue::from_static("MISS")))
            }
            other => other,
        }
    }
}

/// Applies the client's base headers, replacing same-named request headers,
/// before the cache layer derives its key.
pub(crate) struct HeaderLayer<H> {
    headers: HeaderMap,
    inner: H,
}

impl<H> HeaderLayer<H> {
    pub(crate) fn new(headers: HeaderMap, inner: H) -> Self {
        Self { headers, inner }
    }
}

#[async_trait]
impl<H: Handler> Handler for HeaderLayer<H> {
    async fn handle(&self, request: Request) -> Result<Response> {
        let mut request = request;
        for (name, value) in &self.headers {
            request = request.with_header(name.clone(), value.clone());
        }
        self.inner.handle(request).await
    }
}

/// Outermost stage: re-runs the whole inner chain per attempt, so a retried
/// request passes through header injection and the cache again.
pub(crate) struct RetryLayer<H> {
    policy: RetryPolicy,
    metrics: Metrics,
    inner: H,
}

impl<H> RetryLayer<H> {
    pub(crate) fn new(policy: RetryPolicy, metrics: Metrics, inner: H) -> Self {
        Self {
            policy,
            metrics,
            inner,
        }
    }
}

#[async_trait]
impl<H: Handler> Handler for RetryLayer<H> {
    async fn handle(&self, request: Request) -> Result<Response> {
        let mut retries = 0usize;
        loop {
            let outcome = self.inner.handle(request.clone()).await;
            let should_retry = {
                let (response, error) = match &outcome {
                    Ok(response) => (Some(response), None),
                    Err(error) => (None, Some(error)),
                };
                self.policy.should_retry(retries, &request, response, error)
            };
            if !should_retry {
                return outcome;
            }

            retries += 1;
            let delay_ms = self.policy.compute_delay(retries, outcome.as_ref().ok());
            warn!(
                method = %request.method(),
                uri = %redact_uri_for_logs(&request.uri().to_string()),
                retries,
                delay_ms,
                "retrying request"
            );
            self.metrics.record_retry();
            // Negative delays (Retry-After dates in the past) retry
            // immediately; the scheduler cannot sleep backwards.
            if delay_ms > 0 {
                sleep(Duration::from_millis(delay_ms as u64)).await;
            }
        }
    }
}

/// The fixed stack, outermost to innermost: retry, header injection, cache,
/// wire logging, transport.
pub(crate) type Stack = RetryLayer<HeaderLayer<CacheLayer<LogLayer<TransportLayer>>>>;

pub(crate) fn build_stack(
    retry_policy: RetryPolicy,
    base_headers: HeaderMap,
    strategy: Arc<CacheStrategy>,
    transport: Arc<dyn Transport>,
    metrics: Metrics,
) -> Stack {
    RetryLayer::new(
        retry_policy,
        metrics.clone(),
        HeaderLayer::new(
            base_headers,
            CacheLayer::new(
                strategy,
                metrics,
                LogLayer::new(TransportLayer::new(transport)),
            ),
        ),
    )
}
