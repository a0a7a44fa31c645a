use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{Method, Request as WireRequest};
use http_body_util::{BodyExt, Full};
use hyper_rustls::HttpsConnectorBuilder;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client as PooledClient;
use hyper_util::rt::TokioExecutor;
use tokio::time::timeout;

use crate::error::{Error, TransportErrorKind};
use crate::proxy::SandboxProxy;
use crate::request::Request;
use crate::response::Response;
use crate::util::{collapse_header_values, redact_uri_for_logs};
use crate::Result;

const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const POOL_MAX_IDLE_PER_HOST: usize = 8;

/// Executes one outbound network call for a request.
///
/// Any HTTP status — including 4xx/5xx — is a successful `Response`; only
/// failures of the network primitive itself (DNS, connect, TLS, timeout,
/// read) are errors. Implementations are fully substitutable, which is how
/// tests script wire behavior without a network.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &Request) -> Result<Response>;
}

type HttpsClient = PooledClient<hyper_rustls::HttpsConnector<HttpConnector>, Full<Bytes>>;

/// Production transport over a pooled hyper client with rustls.
///
/// Request bodies are fully buffered; the wire call and body collection run
/// under the request's timeout. When a [`SandboxProxy`] is configured and
/// enabled, the target URI is rewritten before anything leaves the adapter.
pub struct HyperTransport {
    client: HttpsClient,
    proxy: Option<SandboxProxy>,
}

impl HyperTransport {
    pub fn new() -> Result<Self> {
        Self::with_proxy(None)
    }

    pub fn with_proxy(proxy: Option<SandboxProxy>) -> Result<Self> {
        let https = HttpsConnectorBuilder::new()
            .with_provider_and_webpki_roots(rustls::crypto::ring::default_provider())
            .map_err(|source| Error::TlsInit {
                message: source.to_string(),
            })?
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .build();
        let client = PooledClient::builder(TokioExecutor::new())
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
            .build(https);
        Ok(Self { client, proxy })
    }

    async fn round_trip(
        &self,
        wire_request: WireRequest<Full<Bytes>>,
        method: &Method,
        uri: &str,
    ) -> Result<Response> {
        let response = self.client.request(wire_request).await.map_err(|source| {
            let kind = classify_transport_error(&source);
            Error::Transport {
                kind,
                method: method.clone(),
                uri: uri.to_owned(),
                source: Box::new(source),
            }
        })?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|source| Error::Transport {
                kind: TransportErrorKind::Read,
                method: method.clone(),
                uri: uri.to_owned(),
                source: Box::new(source),
            })?
            .to_bytes();
        Ok(Response::new(status, headers, body))
    }
}

#[async_trait]
impl Transport for HyperTransport {
    async fn send(&self, request: &Request) -> Result<Response> {
        let request = match &self.proxy {
            Some(proxy) => proxy.rewrite(request.clone())?,
            None => request.clone(),
        };

        let method = request.method().clone();
        let redacted_uri = redact_uri_for_logs(&request.uri().to_string());
        let request_timeout = request.timeout();

        let mut wire_request = WireRequest::builder()
            .method(method.clone())
            .uri(request.uri().clone())
            .version(request.version())
            .body(Full::new(request.body().clone()))
            .map_err(|source| Error::RequestBuild { source })?;
        *wire_request.headers_mut() = collapse_header_values(request.headers());

        match timeout(
            request_timeout,
            self.round_trip(wire_request, &method, &redacted_uri),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => Err(Error::Timeout {
                timeout_ms: request_timeout.as_millis(),
                method,
                uri: redacted_uri,
            }),
        }
    }
}

fn classify_transport_error(error: &hyper_util::client::legacy::Error) -> TransportErrorKind {
    if error.is_connect() {
        let text = error.to_string().to_ascii_lowercase();
        if text.contains("dns")
            || text.contains("name or service not known")
            || text.contains("failed to lookup address")
        {
            return TransportErrorKind::Dns;
        }
        if text.contains("tls") || text.contains("certificate") || text.contains("handshake") {
            return TransportErrorKind::Tls;
        }
        return TransportErrorKind::Connect;
    }

    let text = error.to_string().to_ascii_lowercase();
    if text.contains("read")
        || text.contains("connection reset")
        || text.contains("broken pipe")
        || text.contains("unexpected eof")
    {
        return TransportErrorKind::Read;
    }

    TransportErrorKind::Other
}
