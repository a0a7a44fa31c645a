use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{HeaderValue, AUTHORIZATION, RETRY_AFTER, USER_AGENT};
use http::{HeaderMap, Method, StatusCode};
use refetch::prelude::{
    CacheDisposition, Client, Error, RequestObserver, RequestOptions, RequestRecord, Response,
    RetryPolicy, Transport, TransportErrorKind,
};
use refetch::{Request, CACHE_STATUS_HEADER, MAX_RETRIES};

fn ok_response(status: u16, body: &'static [u8]) -> refetch::Result<Response> {
    Ok(Response::new(
        StatusCode::from_u16(status).expect("status should be valid"),
        HeaderMap::new(),
        Bytes::from_static(body),
    ))
}

fn response_with_retry_after(status: u16, seconds: &str) -> refetch::Result<Response> {
    let mut headers = HeaderMap::new();
    headers.insert(
        RETRY_AFTER,
        HeaderValue::from_str(seconds).expect("retry-after should parse"),
    );
    Ok(Response::new(
        StatusCode::from_u16(status).expect("status should be valid"),
        headers,
        Bytes::new(),
    ))
}

fn transport_error(kind: TransportErrorKind, uri: &str) -> Error {
    Error::Transport {
        kind,
        method: Method::GET,
        uri: uri.to_owned(),
        source: Box::new(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "scripted failure",
        )),
    }
}

enum Script {
    Sequence(Mutex<VecDeque<refetch::Result<Response>>>),
    Handler(Box<dyn Fn(&Request) -> refetch::Result<Response> + Send + Sync>),
}

struct MockTransport {
    script: Script,
    calls: AtomicUsize,
    captured: Mutex<Vec<Request>>,
}

impl MockTransport {
    fn with_sequence(results: Vec<refetch::Result<Response>>) -> Arc<Self> {
        Arc::new(Self {
            script: Script::Sequence(Mutex::new(results.into())),
            calls: AtomicUsize::new(0),
            captured: Mutex::new(Vec::new()),
        })
    }

    fn with_handler(
        handler: impl Fn(&Request) -> refetch::Result<Response> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            script: Script::Handler(Box::new(handler)),
            calls: AtomicUsize::new(0),
            captured: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn captured(&self) -> Vec<Request> {
        self.captured.lock().expect("captured requests lock").clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, request: &Request) -> refetch::Result<Response> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.captured
            .lock()
            .expect("captured requests lock")
            .push(request.clone());
        match &self.script {
            Script::Sequence(queue) => queue
                .lock()
                .expect("script lock")
                .pop_front()
                .unwrap_or_else(|| ok_response(200, b"unscripted")),
            Script::Handler(handler) => handler(request),
        }
    }
}

fn client_with(transport: Arc<MockTransport>) -> Client {
    Client::builder("https://api.example.com")
        .transport(transport)
        .try_build()
        .expect("client should build")
}

fn uncached_client_with(transport: Arc<MockTransport>) -> Client {
    Client::builder("https://api.example.com")
        .transport(transport)
        .default_cache_ttl_secs(-1)
        .try_build()
        .expect("client should build")
}

#[derive(Default)]
struct RecordingObserver {
    records: Mutex<Vec<RequestRecord>>,
}

impl RequestObserver for RecordingObserver {
    fn on_request(&self, record: &RequestRecord) {
        self.records
            .lock()
            .expect("observer records lock")
            .push(record.clone());
    }
}

#[tokio::test]
async fn get_applies_base_headers_and_returns_the_response() {
    let transport = MockTransport::with_handler(|_| ok_response(200, b"hello"));
    let client = Client::builder("https://api.example.com")
        .transport(Arc::clone(&transport) as Arc<dyn Transport>)
        .try_default_header("x-api-key", "secret")
        .expect("default header should parse")
        .try_build()
        .expect("client should build");

    let response = client
        .get("/v1/items", RequestOptions::new())
        .await
        .expect("request should succeed");

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.body(), &Bytes::from_static(b"hello"));

    let captured = transport.captured();
    assert_eq!(captured.len(), 1);
    let wire_request = &captured[0];
    assert_eq!(wire_request.method(), Method::GET);
    assert_eq!(
        wire_request.uri().to_string(),
        "https://api.example.com/v1/items"
    );
    assert_eq!(
        wire_request
            .headers()
            .get("x-api-key")
            .expect("base header should be injected"),
        "secret"
    );
    let user_agent = wire_request
        .headers()
        .get(USER_AGENT)
        .expect("default user-agent should be set")
        .to_str()
        .expect("user-agent should be ascii");
    assert!(user_agent.starts_with("refetch/"));
}

#[tokio::test]
async fn http_error_statuses_are_responses_not_errors() {
    let transport = MockTransport::with_sequence(vec![ok_response(404, b"missing")]);
    let client = client_with(Arc::clone(&transport));

    let response = client
        .get("/v1/absent", RequestOptions::new())
        .await
        .expect("a 404 is a response, not an error");

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(transport.calls(), 1);
}

#[tokio::test]
async fn base_headers_replace_same_named_request_headers() {
    let transport = MockTransport::with_handler(|_| ok_response(200, b""));
    let client = Client::builder("https://api.example.com")
        .transport(Arc::clone(&transport) as Arc<dyn Transport>)
        .try_default_header("x-tenant", "base")
        .expect("default header should parse")
        .try_build()
        .expect("client should build");

    client
        .get(
            "/v1/items",
            RequestOptions::new()
                .try_header("x-tenant", "per-call")
                .expect("header should parse"),
        )
        .await
        .expect("request should succeed");

    assert_eq!(
        transport.captured()[0]
            .headers()
            .get("x-tenant")
            .expect("header should be present"),
        "base"
    );
}

#[tokio::test]
async fn per_call_options_override_client_defaults() {
    let transport = MockTransport::with_handler(|_| ok_response(200, b""));
    let client = Client::builder("https://api.example.com")
        .transport(Arc::clone(&transport) as Arc<dyn Transport>)
        .request_timeout(Duration::from_secs(30))
        .try_build()
        .expect("client should build");

    client
        .get(
            "/v1/items",
            RequestOptions::new().timeout(Duration::from_secs(2)),
        )
        .await
        .expect("request should succeed");

    assert_eq!(
        transport.captured()[0].timeout(),
        Duration::from_secs(2)
    );
}

#[tokio::test(start_paused = true)]
async fn server_errors_are_retried_until_success() {
    let transport = MockTransport::with_sequence(vec![
        ok_response(503, b""),
        ok_response(503, b""),
        ok_response(200, b"recovered"),
    ]);
    let client = uncached_client_with(Arc::clone(&transport));

    let response = client
        .get("/v1/flaky", RequestOptions::new())
        .await
        .expect("request should succeed after retries");

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.body(), &Bytes::from_static(b"recovered"));
    assert_eq!(transport.calls(), 3);
    assert_eq!(client.metrics_snapshot().retries, 2);
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_surface_the_last_response() {
    let transport = MockTransport::with_sequence(vec![
        ok_response(503, b"first"),
        ok_response(503, b"second"),
        ok_response(503, b"third"),
        ok_response(503, b"last"),
    ]);
    let client = uncached_client_with(Arc::clone(&transport));

    let response = client
        .get("/v1/down", RequestOptions::new())
        .await
        .expect("the final 503 is still a response");

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(response.body(), &Bytes::from_static(b"last"));
    assert_eq!(transport.calls(), 1 + MAX_RETRIES);
}

#[tokio::test(start_paused = true)]
async fn connection_errors_are_retried_then_surfaced() {
    let transport = MockTransport::with_sequence(vec![
        Err(transport_error(TransportErrorKind::Connect, "https://api.example.com/v1/items")),
        Err(transport_error(TransportErrorKind::Connect, "https://api.example.com/v1/items")),
        Err(transport_error(TransportErrorKind::Connect, "https://api.example.com/v1/items")),
        Err(transport_error(TransportErrorKind::Connect, "https://api.example.com/v1/items")),
    ]);
    let client = uncached_client_with(Arc::clone(&transport));

    let error = client
        .get("/v1/items", RequestOptions::new())
        .await
        .expect_err("connection failures should surface after retries");

    match error {
        Error::Transport { kind, .. } => assert_eq!(kind, TransportErrorKind::Connect),
        other => panic!("unexpected error variant: {other}"),
    }
    assert_eq!(transport.calls(), 1 + MAX_RETRIES);
}

#[tokio::test]
async fn non_connection_transport_errors_are_not_retried() {
    let transport = MockTransport::with_sequence(vec![Err(transport_error(
        TransportErrorKind::Other,
        "https://api.example.com/v1/items",
    ))]);
    let client = uncached_client_with(Arc::clone(&transport));

    client
        .get("/v1/items", RequestOptions::new())
        .await
        .expect_err("non-connection failures should not be retried");

    assert_eq!(transport.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn retry_after_header_drives_the_backoff_delay() {
    let transport = MockTransport::with_sequence(vec![
        response_with_retry_after(503, "5"),
        ok_response(200, b"ok"),
    ]);
    let client = uncached_client_with(Arc::clone(&transport));

    let started = tokio::time::Instant::now();
    let response = client
        .get("/v1/throttled", RequestOptions::new())
        .await
        .expect("request should succeed after the throttle");

    assert_eq!(response.status(), StatusCode::OK);
    assert!(started.elapsed() >= Duration::from_secs(5));
    assert_eq!(transport.calls(), 2);
}

#[tokio::test]
async fn repeat_requests_are_served_from_the_cache() {
    let transport = MockTransport::with_sequence(vec![ok_response(200, b"fresh")]);
    let client = client_with(Arc::clone(&transport));

    let first = client
        .get("/v1/items", RequestOptions::new())
        .await
        .expect("first request should succeed");
    let second = client
        .get("/v1/items", RequestOptions::new())
        .await
        .expect("second request should succeed");

    assert_eq!(transport.calls(), 1);
    assert_eq!(first.body(), second.body());
    assert_eq!(
        first
            .headers()
            .get(CACHE_STATUS_HEADER)
            .expect("cache layer should tag the response"),
        "MISS"
    );
    assert_eq!(
        second
            .headers()
            .get(CACHE_STATUS_HEADER)
            .expect("cache layer should tag the response"),
        "HIT"
    );

    let snapshot = client.metrics_snapshot();
    assert_eq!(snapshot.cache_hits, 1);
    assert_eq!(snapshot.cache_misses, 1);
    assert_eq!(snapshot.cache_writes, 1);
}

#[tokio::test]
async fn authorization_changes_bypass_cached_entries() {
    let transport = MockTransport::with_handler(|_| ok_response(200, b"private"));
    let client = client_with(Arc::clone(&transport));

    for token in ["Bearer alpha", "Bearer beta"] {
        client
            .get(
                "/v1/me",
                RequestOptions::new().header(
                    AUTHORIZATION,
                    HeaderValue::from_str(token).expect("token should parse"),
                ),
            )
            .await
            .expect("request should succeed");
    }

    assert_eq!(transport.calls(), 2);
}

#[tokio::test]
async fn post_bodies_key_the_cache_separately() {
    let transport = MockTransport::with_handler(|_| ok_response(200, b"result"));
    let client = client_with(Arc::clone(&transport));

    client
        .post("/graphql", RequestOptions::new().body("{\"q\":1}"))
        .await
        .expect("first query should succeed");
    client
        .post("/graphql", RequestOptions::new().body("{\"q\":2}"))
        .await
        .expect("second query should succeed");
    client
        .post("/graphql", RequestOptions::new().body("{\"q\":1}"))
        .await
        .expect("repeat of the first query should succeed");

    // Distinct bodies miss; the repeated body hits.
    assert_eq!(transport.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn parallel_batch_settles_every_request_independently() {
    let transport = MockTransport::with_handler(|request| {
        if request.uri().path() == "/v1/two" {
            Err(transport_error(
                TransportErrorKind::Other,
                "https://api.example.com/v1/two",
            ))
        } else {
            ok_response(200, b"ok")
        }
    });
    let client = Client::builder("https://api.example.com")
        .transport(Arc::clone(&transport) as Arc<dyn Transport>)
        .default_cache_ttl_secs(-1)
        .retry_policy(RetryPolicy::disabled())
        .try_build()
        .expect("client should build");

    client.queue_request(Method::GET, "/v1/one", RequestOptions::new());
    client.queue_request(Method::GET, "/v1/two", RequestOptions::new());
    client.queue_request(Method::GET, "/v1/three", RequestOptions::new());

    let results = client.execute_parallel().await;
    assert_eq!(results.len(), 3);
    assert!(results[0].is_ok());
    assert!(results[1].is_err());
    assert!(results[2].is_ok());

    // The queue is cleared by execution; a second run dispatches nothing.
    let rerun = client.execute_parallel().await;
    assert!(rerun.is_empty());
    assert_eq!(transport.calls(), 3);
}

#[tokio::test]
async fn observer_sees_success_hit_and_failure_outcomes() {
    let calls = AtomicUsize::new(0);
    let transport = MockTransport::with_handler(move |_| {
        if calls.fetch_add(1, Ordering::SeqCst) < 1 {
            ok_response(200, b"ok")
        } else {
            Err(transport_error(
                TransportErrorKind::Other,
                "https://api.example.com/v1/other",
            ))
        }
    });
    let observer = Arc::new(RecordingObserver::default());
    let client = Client::builder("https://api.example.com")
        .transport(Arc::clone(&transport) as Arc<dyn Transport>)
        .observer(Arc::clone(&observer) as Arc<dyn RequestObserver>)
        .try_build()
        .expect("client should build");

    client
        .get("/v1/items", RequestOptions::new())
        .await
        .expect("first request should succeed");
    client
        .get("/v1/items", RequestOptions::new())
        .await
        .expect("cached request should succeed");
    client
        .get("/v1/other?token=secret", RequestOptions::new())
        .await
        .expect_err("scripted failure should surface");

    let records = observer.records.lock().expect("observer records lock");
    assert_eq!(records.len(), 3);

    assert_eq!(records[0].status, Some(200));
    assert_eq!(records[0].cache, CacheDisposition::Miss);

    assert_eq!(records[1].status, Some(200));
    assert_eq!(records[1].cache, CacheDisposition::Hit);

    assert_eq!(records[2].status, None);
    assert_eq!(records[2].cache, CacheDisposition::Uncached);
    assert!(records[2].error_code.is_some());
    assert_eq!(records[2].uri, "https://api.example.com/v1/other");

    let snapshot = client.metrics_snapshot();
    assert_eq!(snapshot.requests_started, 3);
    assert_eq!(snapshot.requests_succeeded, 2);
    assert_eq!(snapshot.requests_failed, 1);
    assert_eq!(*snapshot.status_counts.get(&200).expect("status count"), 2);
}

#[tokio::test]
async fn retry_decision_hook_can_extend_the_default_triggers() {
    let transport = MockTransport::with_sequence(vec![
        ok_response(404, b"not yet"),
        ok_response(200, b"found"),
    ]);
    let policy = RetryPolicy::standard().decision_hook(Arc::new(
        |default: bool, context: &refetch::RetryContext<'_>| {
            default
                || context
                    .response
                    .is_some_and(|response| response.status() == StatusCode::NOT_FOUND)
        },
    ));
    let client = Client::builder("https://api.example.com")
        .transport(Arc::clone(&transport) as Arc<dyn Transport>)
        .default_cache_ttl_secs(-1)
        .retry_policy(policy)
        .try_build()
        .expect("client should build");

    let response = client
        .get("/v1/eventually", RequestOptions::new())
        .await
        .expect("request should succeed");

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(transport.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn delay_hook_rewrites_the_backoff() {
    let transport = MockTransport::with_sequence(vec![
        ok_response(503, b""),
        ok_response(200, b"ok"),
    ]);
    let policy = RetryPolicy::standard().delay_hook(Arc::new(
        |_delay_ms: i64, _retries: usize, _response: Option<&Response>| 0,
    ));
    let client = Client::builder("https://api.example.com")
        .transport(Arc::clone(&transport) as Arc<dyn Transport>)
        .default_cache_ttl_secs(-1)
        .retry_policy(policy)
        .try_build()
        .expect("client should build");

    let started = tokio::time::Instant::now();
    client
        .get("/v1/flaky", RequestOptions::new())
        .await
        .expect("request should succeed");

    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(transport.calls(), 2);
}
