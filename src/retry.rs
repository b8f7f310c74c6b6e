//! A retrying HTTP transport with jittered backoff.
//!
//! Wraps the process-global `reqwest::Client`. Derived clients (for mirrors
//! with their own deadlines) clone the inner client, sharing its connection
//! pool, and override only the per-request timeout.

use std::time::{Duration, SystemTime};

use futures_util::StreamExt;
use rand::Rng;
use reqwest::header::RETRY_AFTER;
use reqwest::{Request, Response, StatusCode};
use tracing::debug;

use crate::config::RetryConfig;
use crate::errors::{FetchError, Result};
use crate::redact;

/// Divisor for the jitter window: sampled delays lie in `[d, d + d/8)`.
const JITTER_DIVISOR: u32 = 8;

/// An HTTP client that retries transient failures with jittered exponential
/// backoff.
///
/// Retries are attempted for connect-level errors and for 429/5xx (except
/// 501) responses, up to `max_retries` additional attempts. URLs embedded in
/// errors leaving this type have their query values redacted.
#[derive(Clone)]
pub struct RetryClient {
    client: reqwest::Client,
    max_retries: u32,
    min_wait: Duration,
    max_wait: Duration,
    request_timeout: Option<Duration>,
}

impl RetryClient {
    /// Builds a client (and its connection pool) from `config`.
    pub fn new(config: &RetryConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder();
        if config.dial_timeout_msec > 0 {
            builder = builder.connect_timeout(Duration::from_millis(config.dial_timeout_msec));
        }
        if config.response_header_timeout_msec > 0 {
            builder =
                builder.read_timeout(Duration::from_millis(config.response_header_timeout_msec));
        }
        let client = builder
            .build()
            .map_err(|e| FetchError::RequestFailed(e.to_string()))?;
        Ok(Self::from_client(client, config))
    }

    /// Wraps an existing `reqwest::Client`, sharing its connection pool.
    pub fn from_client(client: reqwest::Client, config: &RetryConfig) -> Self {
        RetryClient {
            client,
            max_retries: config.max_retries,
            min_wait: config.min_wait(),
            max_wait: config.max_wait(),
            request_timeout: config.request_timeout(),
        }
    }

    /// Derives a client with a different per-request timeout (`None` means
    /// unlimited). The connection pool is shared with `self`.
    pub fn with_request_timeout(&self, timeout: Option<Duration>) -> Self {
        RetryClient {
            client: self.client.clone(),
            request_timeout: timeout,
            ..self.clone()
        }
    }

    /// Derives a client with different retry settings, sharing the pool.
    pub fn with_retry_settings(&self, max_retries: u32, min_wait: Duration, max_wait: Duration) -> Self {
        RetryClient {
            client: self.client.clone(),
            max_retries,
            min_wait,
            max_wait,
            request_timeout: self.request_timeout,
        }
    }

    /// The inner `reqwest::Client`.
    pub fn http_client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Sends `req`, retrying transient failures.
    ///
    /// The request must be cloneable (range GETs and HEADs are); a streaming
    /// body cannot be retried. On exhaustion the error message has the shape
    /// `<METHOD> "<redacted-url>": giving up request after <n> attempt(s)`.
    pub async fn execute(&self, req: Request) -> Result<Response> {
        let method = req.method().to_string();
        let safe_url = redact::safe_url(req.url());
        let mut attempts = 0u32;
        loop {
            let mut attempt_req = req
                .try_clone()
                .ok_or_else(|| FetchError::RequestFailed("request is not cloneable".into()))?;
            if attempt_req.timeout().is_none() {
                *attempt_req.timeout_mut() = self.request_timeout;
            }
            let outcome = self.client.execute(attempt_req).await;
            attempts += 1;
            match outcome {
                Ok(resp) if retryable_status(resp.status()) => {
                    if attempts <= self.max_retries {
                        let delay = jitter(self.backoff(attempts - 1, Some(&resp)));
                        debug!(
                            method = %method,
                            url = %safe_url,
                            status = resp.status().as_u16(),
                            delay_ms = delay.as_millis() as u64,
                            "retrying request"
                        );
                        drain(resp).await;
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    drain(resp).await;
                    return Err(FetchError::GivingUp {
                        method,
                        url: safe_url,
                        attempts,
                        cause: String::new(),
                    });
                }
                Ok(resp) => return Ok(resp),
                Err(err) => {
                    if retryable_error(&err) && attempts <= self.max_retries {
                        let delay = jitter(self.backoff(attempts - 1, None));
                        debug!(
                            method = %method,
                            url = %safe_url,
                            error = %redact::safe_error(&err),
                            delay_ms = delay.as_millis() as u64,
                            "retrying request"
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    return Err(FetchError::GivingUp {
                        method,
                        url: safe_url,
                        attempts,
                        cause: format!(": {}", redact::safe_error(&err)),
                    });
                }
            }
        }
    }

    /// Base delay before the retry following attempt `attempt` (0-based).
    ///
    /// A `Retry-After` header on the response wins, clamped to
    /// `[min_wait, max_wait]`; otherwise `min(max_wait, min_wait * 2^attempt)`.
    fn backoff(&self, attempt: u32, resp: Option<&Response>) -> Duration {
        if let Some(after) = resp.and_then(retry_after) {
            return after.clamp(self.min_wait, self.max_wait);
        }
        let exp = self
            .min_wait
            .saturating_mul(2u32.saturating_pow(attempt.min(31)));
        exp.min(self.max_wait)
    }
}

/// True for statuses worth retrying: 429, and 5xx except 501.
fn retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
        || (status.is_server_error() && status != StatusCode::NOT_IMPLEMENTED)
}

/// True for transport errors worth retrying. Builder and redirect-policy
/// errors are permanent; everything else (connect, timeout, broken body) may
/// be transient.
fn retryable_error(err: &reqwest::Error) -> bool {
    !(err.is_builder() || err.is_redirect())
}

/// Parses `Retry-After` as either delay-seconds or an HTTP date.
fn retry_after(resp: &Response) -> Option<Duration> {
    let value = resp.headers().get(RETRY_AFTER)?.to_str().ok()?;
    if let Ok(secs) = value.trim().parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let when = httpdate::parse_http_date(value).ok()?;
    when.duration_since(SystemTime::now()).ok()
}

/// Adds uniform jitter: the result lies in `[delay, delay + delay/8)`.
fn jitter(delay: Duration) -> Duration {
    let window = delay / JITTER_DIVISOR;
    if window.is_zero() {
        return delay;
    }
    delay + rand::thread_rng().gen_range(Duration::ZERO..window)
}

/// Reads at most 4 KiB of `resp`'s body, then drops it, so the connection
/// can return to the pool.
pub(crate) async fn drain(resp: Response) {
    const RESPONSE_READ_LIMIT: usize = 4096;
    let mut stream = resp.bytes_stream();
    let mut read = 0usize;
    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(bytes) => {
                read += bytes.len();
                if read >= RESPONSE_READ_LIMIT {
                    break;
                }
            }
            Err(_) => break,
        }
    }
}
