use std::time::Duration;

use bytes::Bytes;
use http::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use http::{HeaderMap, Method, Uri, Version};
use serde::Serialize;

use crate::error::Error;
use crate::util::{merge_headers, parse_header_name, parse_header_value};
use crate::Result;

pub(crate) const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// An immutable request value flowing through the pipeline.
///
/// Middleware never mutates a `Request` in place; the `with_*` methods return
/// a modified copy and leave the original untouched, so a retried attempt
/// always re-enters the stack with the request the caller built.
#[derive(Clone, Debug)]
pub struct Request {
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
    version: Version,
    timeout: Duration,
}

impl Request {
    pub fn new(method: Method, uri: Uri) -> Self {
        Self {
            method,
            uri,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            version: Version::HTTP_11,
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn with_uri(mut self, uri: Uri) -> Self {
        self.uri = uri;
        self
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout.max(Duration::from_millis(1));
        self
    }
}

/// Per-call configuration merged over the client's defaults.
#[derive(Clone, Debug, Default)]
pub struct RequestOptions {
    pub(crate) headers: HeaderMap,
    pub(crate) timeout: Option<Duration>,
    pub(crate) http_version: Option<Version>,
    pub(crate) body: Option<Bytes>,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn try_header(self, name: &str, value: &str) -> Result<Self> {
        let name = parse_header_name(name)?;
        let value = parse_header_value(name.as_str(), value)?;
        Ok(self.header(name, value))
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout.max(Duration::from_millis(1)));
        self
    }

    pub fn http_version(mut self, version: Version) -> Self {
        self.http_version = Some(version);
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Serializes `payload` as the JSON request body and sets the
    /// content-type header.
    pub fn json<T>(mut self, payload: &T) -> Result<Self>
    where
        T: Serialize + ?Sized,
    {
        let encoded =
            serde_json::to_vec(payload).map_err(|source| Error::SerializeJson { source })?;
        self.body = Some(Bytes::from(encoded));
        self.headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(self)
    }

    /// Merges `self` over `defaults`: per-call values win per key, headers
    /// are merged with per-call entries replacing same-named defaults.
    pub(crate) fn merge_over(&self, defaults: &RequestOptions) -> RequestOptions {
        let mut merged = defaults.clone();
        merged.headers = merge_headers(&defaults.headers, &self.headers);
        if self.timeout.is_some() {
            merged.timeout = self.timeout;
        }
        if self.http_version.is_some() {
            merged.http_version = self.http_version;
        }
        if self.body.is_some() {
            merged.body = self.body.clone();
        }
        merged
    }
}

/// A request accumulated by [`Client::queue_request`](crate::Client::queue_request),
/// dispatched by the next `execute_parallel` call.
#[derive(Clone, Debug)]
pub(crate) struct QueuedRequest {
    pub(crate) method: Method,
    pub(crate) uri: String,
    pub(crate) options: RequestOptions,
}
