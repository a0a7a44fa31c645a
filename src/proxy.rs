use http::header::{HeaderName, HeaderValue};
use http::Uri;

use crate::error::Error;
use crate::request::Request;
use crate::Result;

/// Header added to proxied requests listing which of the original request's
/// headers the proxy should relay to the target.
pub const FORWARD_HEADERS_HEADER: HeaderName =
    HeaderName::from_static("x-proxy-forward-headers");

/// Query parameter carrying the original target URL on the proxied request.
pub const PROXY_URL_PARAM: &str = "url";

/// Routes outbound requests through a same-origin CORS proxy.
///
/// Sandboxed/browser-based hosts cannot reach arbitrary origins directly, so
/// the transport adapter rewrites the target URI to the proxy endpoint with
/// the original URL as a query parameter before the request leaves the
/// adapter. The method and body are never altered by the rewrite.
#[derive(Clone, Debug)]
pub struct SandboxProxy {
    endpoint: String,
    enabled: bool,
}

impl SandboxProxy {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            enabled: true,
        }
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Rewrites `request` to target the proxy endpoint. Returns the request
    /// unchanged when the proxy is disabled.
    pub fn rewrite(&self, request: Request) -> Result<Request> {
        if !self.enabled {
            return Ok(request);
        }

        let original_uri = request.uri().to_string();
        let query: String = url::form_urlencoded::Serializer::new(String::new())
            .append_pair(PROXY_URL_PARAM, &original_uri)
            .finish();
        let proxied_text = format!("{}?{query}", self.endpoint);
        let proxied_uri: Uri = proxied_text.parse().map_err(|_| Error::InvalidUri {
            uri: proxied_text.clone(),
        })?;

        let forwarded_names = request
            .headers()
            .keys()
            .map(|name| name.as_str())
            .collect::<Vec<_>>()
            .join(", ");

        let mut proxied = request.with_uri(proxied_uri);
        if !forwarded_names.is_empty() {
            if let Ok(value) = HeaderValue::from_str(&forwarded_names) {
                proxied = proxied.with_header(FORWARD_HEADERS_HEADER, value);
            }
        }
        Ok(proxied)
    }
}
