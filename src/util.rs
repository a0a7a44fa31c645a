use std::sync::Mutex;
use std::time::SystemTime;

use http::header::{HeaderName, HeaderValue, RETRY_AFTER};
use http::{HeaderMap, Uri};
use sha2::{Digest, Sha256};

use crate::error::Error;

const MAX_ERROR_BODY_LEN: usize = 2048;

pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub(crate) fn merge_headers(default_headers: &HeaderMap, request_headers: &HeaderMap) -> HeaderMap {
    let mut merged = default_headers.clone();
    for (name, value) in request_headers {
        merged.insert(name.clone(), value.clone());
    }
    merged
}

/// Collapses repeated header values into one comma-separated value per name.
/// Values that are not valid UTF-8 keep only their first occurrence.
pub(crate) fn collapse_header_values(headers: &HeaderMap) -> HeaderMap {
    let mut collapsed = HeaderMap::with_capacity(headers.keys_len());
    for name in headers.keys() {
        let values: Vec<&str> = headers
            .get_all(name)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .collect();
        if values.len() > 1 {
            if let Ok(joined) = HeaderValue::from_str(&values.join(", ")) {
                collapsed.insert(name.clone(), joined);
                continue;
            }
        }
        if let Some(first) = headers.get(name) {
            collapsed.insert(name.clone(), first.clone());
        }
    }
    collapsed
}

/// Reduces a URI to scheme + host + path for log output. Query strings,
/// fragments, and userinfo are dropped so credentials and tokens passed as
/// query parameters never reach the logs.
pub(crate) fn redact_uri_for_logs(uri_text: &str) -> String {
    let Ok(mut parsed) = url::Url::parse(uri_text) else {
        return uri_text.split('?').next().unwrap_or(uri_text).to_owned();
    };

    let _ = parsed.set_username("");
    let _ = parsed.set_password(None);
    parsed.set_query(None);
    parsed.set_fragment(None);
    parsed.to_string()
}

pub(crate) fn resolve_uri(base_url: &str, path: &str) -> Result<(String, Uri), Error> {
    let uri_text = if path.starts_with("http://") || path.starts_with("https://") {
        path.to_owned()
    } else {
        join_base_path(base_url, path)
    };
    let uri = uri_text.parse().map_err(|_| Error::InvalidUri {
        uri: uri_text.clone(),
    })?;
    Ok((uri_text, uri))
}

pub(crate) fn join_base_path(base_url: &str, path: &str) -> String {
    let base = base_url.trim_end_matches('/');
    let relative = path.trim_start_matches('/');
    match (base.is_empty(), relative.is_empty()) {
        (true, true) => String::new(),
        (true, false) => relative.to_owned(),
        (false, true) => base.to_owned(),
        (false, false) => format!("{base}/{relative}"),
    }
}

pub(crate) fn parse_header_name(name: &str) -> Result<HeaderName, Error> {
    name.parse().map_err(|source| Error::InvalidHeaderName {
        name: name.to_owned(),
        source,
    })
}

pub(crate) fn parse_header_value(name: &str, value: &str) -> Result<HeaderValue, Error> {
    value.parse().map_err(|source| Error::InvalidHeaderValue {
        name: name.to_owned(),
        source,
    })
}

/// Parses a `Retry-After` header into a signed delay in milliseconds.
///
/// Numeric values are seconds. HTTP-date values yield `date - now`, which is
/// negative for dates in the past; callers decide whether to clamp.
pub(crate) fn parse_retry_after_ms(headers: &HeaderMap, now: SystemTime) -> Option<i64> {
    let value = headers.get(RETRY_AFTER)?;
    let raw_value = value.to_str().ok()?.trim();
    if let Ok(seconds) = raw_value.parse::<i64>() {
        return Some(seconds.saturating_mul(1000));
    }

    let date = httpdate::parse_http_date(raw_value).ok()?;
    let delta_secs = match date.duration_since(now) {
        Ok(ahead) => ahead.as_secs() as i64,
        Err(elapsed) => -(elapsed.duration().as_secs() as i64),
    };
    Some(delta_secs.saturating_mul(1000))
}

pub(crate) fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

pub(crate) fn truncate_body(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    if text.chars().count() <= MAX_ERROR_BODY_LEN {
        return text.into_owned();
    }

    let truncated: String = text.chars().take(MAX_ERROR_BODY_LEN).collect();
    format!("{truncated}...(truncated)")
}
