//! Configuration types for the registry access layer.
//!
//! These types derive `Deserialize` so a host application can embed them in
//! its own configuration file; parsing that file is the host's concern.

use std::time::Duration;

use serde::Deserialize;

/// Default number of retries after the initial attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 8;
/// Default minimum backoff between attempts.
pub const DEFAULT_MIN_WAIT_MSEC: u64 = 30;
/// Default maximum backoff between attempts.
pub const DEFAULT_MAX_WAIT_MSEC: u64 = 300_000;
/// Default socket dial timeout.
pub const DEFAULT_DIAL_TIMEOUT_MSEC: u64 = 3_000;
/// Default timeout for receiving response headers.
pub const DEFAULT_RESPONSE_HEADER_TIMEOUT_MSEC: u64 = 5_000;
/// Default interval after which a resolved blob must be revalidated.
pub const DEFAULT_VALID_INTERVAL_SEC: u64 = 60;
/// Default per-fetch timeout for blob requests.
pub const DEFAULT_FETCH_TIMEOUT_SEC: u64 = 300;

/// Retry and timeout settings for the shared HTTP transport.
///
/// All durations are milliseconds; a timeout of `0` disables that phase's
/// timeout entirely.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct RetryConfig {
    /// Maximum number of retries after the initial attempt.
    pub max_retries: u32,
    /// Minimum backoff before a retry.
    pub min_wait_msec: u64,
    /// Maximum backoff before a retry. Must be `>= min_wait_msec`.
    pub max_wait_msec: u64,
    /// Overall per-request timeout. `0` means unlimited.
    pub request_timeout_msec: u64,
    /// Socket dial timeout. `0` means unlimited.
    pub dial_timeout_msec: u64,
    /// Timeout for receiving the response headers. `0` means unlimited.
    pub response_header_timeout_msec: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_retries: DEFAULT_MAX_RETRIES,
            min_wait_msec: DEFAULT_MIN_WAIT_MSEC,
            max_wait_msec: DEFAULT_MAX_WAIT_MSEC,
            request_timeout_msec: 0,
            dial_timeout_msec: DEFAULT_DIAL_TIMEOUT_MSEC,
            response_header_timeout_msec: DEFAULT_RESPONSE_HEADER_TIMEOUT_MSEC,
        }
    }
}

impl RetryConfig {
    /// Minimum backoff as a [`Duration`].
    pub fn min_wait(&self) -> Duration {
        Duration::from_millis(self.min_wait_msec)
    }

    /// Maximum backoff as a [`Duration`].
    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_msec)
    }

    /// Per-request timeout, `None` when unlimited.
    pub fn request_timeout(&self) -> Option<Duration> {
        match self.request_timeout_msec {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }
}

/// A mirror of a canonical registry host.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct MirrorConfig {
    /// Host (and optional port) of the mirror.
    pub host: String,
    /// Serve the mirror over plain HTTP even when it is not a localhost
    /// address.
    #[serde(default)]
    pub insecure: bool,
    /// Per-request timeout override in seconds: `0` inherits the global
    /// timeout, a negative value means unlimited, a positive value is used
    /// as-is.
    #[serde(default)]
    pub request_timeout_sec: i64,
}

/// Mirror list for one canonical host.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct HostConfig {
    /// Mirrors tried in order before the canonical host.
    #[serde(default)]
    pub mirrors: Vec<MirrorConfig>,
}

/// Registry resolution configuration: one [`HostConfig`] per canonical host.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RegistryConfig {
    /// Per-host configuration, keyed by canonical hostname.
    #[serde(default)]
    pub hosts: std::collections::HashMap<String, HostConfig>,
}

impl RegistryConfig {
    /// The mirror list configured for `host`, empty when none is.
    pub fn mirrors(&self, host: &str) -> &[MirrorConfig] {
        self.hosts
            .get(host)
            .map(|h| h.mirrors.as_slice())
            .unwrap_or(&[])
    }
}

/// Per-blob fetch behavior.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct BlobConfig {
    /// Seconds a resolved blob stays valid before `check` must revalidate it.
    pub valid_interval_sec: u64,
    /// Per-fetch request timeout in seconds. `0` means unlimited.
    pub fetch_timeout_sec: u64,
    /// Retry budget for blob requests.
    pub max_retries: u32,
    /// Minimum backoff for blob requests.
    pub min_wait_msec: u64,
    /// Maximum backoff for blob requests.
    pub max_wait_msec: u64,
    /// Always coalesce fetches to a single range, for backends known to
    /// reject multi-range requests.
    pub force_single_range_mode: bool,
}

impl Default for BlobConfig {
    fn default() -> Self {
        BlobConfig {
            valid_interval_sec: DEFAULT_VALID_INTERVAL_SEC,
            fetch_timeout_sec: DEFAULT_FETCH_TIMEOUT_SEC,
            max_retries: DEFAULT_MAX_RETRIES,
            min_wait_msec: DEFAULT_MIN_WAIT_MSEC,
            max_wait_msec: DEFAULT_MAX_WAIT_MSEC,
            force_single_range_mode: false,
        }
    }
}

impl BlobConfig {
    /// Validity interval as a [`Duration`].
    pub fn valid_interval(&self) -> Duration {
        Duration::from_secs(self.valid_interval_sec)
    }

    /// Fetch timeout as a [`Duration`], `None` when unlimited.
    pub fn fetch_timeout(&self) -> Option<Duration> {
        match self.fetch_timeout_sec {
            0 => None,
            s => Some(Duration::from_secs(s)),
        }
    }
}
