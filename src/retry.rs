use std::sync::Arc;
use std::time::SystemTime;

use crate::error::Error;
use crate::request::Request;
use crate::response::Response;
use crate::util::parse_retry_after_ms;

/// Hard cap on retries per logical call; not overridable by hooks.
pub const MAX_RETRIES: usize = 3;

/// Everything a customization hook may inspect when overriding a retry
/// decision or delay.
pub struct RetryContext<'a> {
    /// Retries attempted so far for this logical call (0 on the first
    /// failure).
    pub retries: usize,
    pub request: &'a Request,
    pub response: Option<&'a Response>,
    pub error: Option<&'a Error>,
}

/// Overrides the default should-retry decision per attempt.
pub trait RetryDecisionHook: Send + Sync {
    fn adjust(&self, should_retry: bool, context: &RetryContext<'_>) -> bool;
}

impl<F> RetryDecisionHook for F
where
    F: Fn(bool, &RetryContext<'_>) -> bool + Send + Sync,
{
    fn adjust(&self, should_retry: bool, context: &RetryContext<'_>) -> bool {
        self(should_retry, context)
    }
}

/// Overrides the computed backoff delay (milliseconds, signed) per attempt.
pub trait RetryDelayHook: Send + Sync {
    fn adjust(&self, delay_ms: i64, retries: usize, response: Option<&Response>) -> i64;
}

impl<F> RetryDelayHook for F
where
    F: Fn(i64, usize, Option<&Response>) -> i64 + Send + Sync,
{
    fn adjust(&self, delay_ms: i64, retries: usize, response: Option<&Response>) -> i64 {
        self(delay_ms, retries, response)
    }
}

/// Decides whether a failed attempt is retried and how long to wait first.
///
/// The policy only returns booleans and numbers; it never fails. Exceeding
/// the retry cap surfaces the last response or error to the caller unchanged.
#[derive(Clone)]
pub struct RetryPolicy {
    max_retries: usize,
    decision_hook: Option<Arc<dyn RetryDecisionHook>>,
    delay_hook: Option<Arc<dyn RetryDelayHook>>,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("RetryPolicy")
            .field("max_retries", &self.max_retries)
            .field("decision_hook", &self.decision_hook.is_some())
            .field("delay_hook", &self.delay_hook.is_some())
            .finish()
    }
}

impl RetryPolicy {
    pub fn standard() -> Self {
        Self {
            max_retries: MAX_RETRIES,
            decision_hook: None,
            delay_hook: None,
        }
    }

    pub fn disabled() -> Self {
        Self::standard().max_retries(0)
    }

    pub fn max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn decision_hook(mut self, hook: Arc<dyn RetryDecisionHook>) -> Self {
        self.decision_hook = Some(hook);
        self
    }

    pub fn delay_hook(mut self, hook: Arc<dyn RetryDelayHook>) -> Self {
        self.delay_hook = Some(hook);
        self
    }

    /// Whether the attempt that just failed should be retried.
    ///
    /// The cap is checked first and wins regardless of any other signal,
    /// including the decision hook. The default triggers are a response
    /// status of 500 or above, or a connection-level transport failure.
    pub fn should_retry(
        &self,
        retries: usize,
        request: &Request,
        response: Option<&Response>,
        error: Option<&Error>,
    ) -> bool {
        if retries >= self.max_retries {
            return false;
        }

        let mut should_retry = response
            .map(|response| response.status().as_u16() >= 500)
            .unwrap_or(false);
        if let Some(error) = error {
            should_retry = should_retry || error.is_connection_error();
        }

        match &self.decision_hook {
            Some(hook) => hook.adjust(
                should_retry,
                &RetryContext {
                    retries,
                    request,
                    response,
                    error,
                },
            ),
            None => should_retry,
        }
    }

    /// Delay before the next attempt, in signed milliseconds.
    ///
    /// A `Retry-After` header wins when present: numeric values are seconds,
    /// HTTP-dates yield `date - now` and may be negative for dates in the
    /// past. Without the header the delay is linear in the retry count
    /// (0 s, 1 s, 2 s, ...).
    pub fn compute_delay(&self, retries: usize, response: Option<&Response>) -> i64 {
        self.compute_delay_at(retries, response, SystemTime::now())
    }

    pub fn compute_delay_at(
        &self,
        retries: usize,
        response: Option<&Response>,
        now: SystemTime,
    ) -> i64 {
        let delay_ms = response
            .and_then(|response| parse_retry_after_ms(response.headers(), now))
            .unwrap_or_else(|| (retries as i64).saturating_mul(1000));

        match &self.delay_hook {
            Some(hook) => hook.adjust(delay_ms, retries, response),
            None => delay_ms,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::standard()
    }
}
