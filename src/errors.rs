//! Error types for the registry access layer.

/// Convenience alias over [`FetchError`].
pub type Result<T> = std::result::Result<T, FetchError>;

/// The errors that can be raised while resolving hosts, authenticating and
/// fetching blob ranges.
///
/// Any URL embedded in one of these errors has already had its query-string
/// values replaced with `REDACTED`; pre-signed backend URLs carry credentials
/// in their query parameters and must never escape this crate verbatim.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// A registry host entry has an empty name or contains a path separator.
    #[error("invalid registry host {host:?}")]
    InvalidHost {
        /// The offending host name.
        host: String,
    },

    /// The blob descriptor carried no digest.
    #[error("missing digest; a digest is mandatory in a blob descriptor")]
    MissingDigest,

    /// `fetch` was invoked with an empty region list.
    #[error("no regions requested")]
    NoRegion,

    /// The redirect probe against a host's blob endpoint failed.
    #[error("failed to resolve redirect for host {host:?}: {reason}")]
    FailedToRedirect {
        /// The host the probe was issued against.
        host: String,
        /// Redacted description of the underlying failure.
        reason: String,
    },

    /// Every candidate host failed during fetcher construction.
    #[error("unable to create fetcher: {causes}")]
    UnableToCreateFetcher {
        /// The per-host failures, joined in host order.
        causes: String,
    },

    /// The blob size could not be discovered from the remote.
    #[error("failed to retrieve blob size (HEAD={head_status}, GET={get_status})")]
    FailedToRetrieveSize {
        /// Status returned by the HEAD probe.
        head_status: u16,
        /// Status returned by the ranged GET fallback.
        get_status: u16,
    },

    /// A `Content-Length` header was absent or unparseable.
    #[error("cannot parse Content-Length: {0}")]
    CannotParseContentLength(String),

    /// A `Content-Range` header did not match `bytes <b>-<e>/<total>`.
    #[error("cannot parse Content-Range {0:?}")]
    CannotParseContentRange(String),

    /// A `Content-Type` header was missing or malformed on a 206 response.
    #[error("cannot parse Content-Type {0:?}")]
    CannotParseContentType(String),

    /// A multipart body was truncated or framed incorrectly.
    #[error("malformed multipart body: {0}")]
    MalformedMultipart(String),

    /// The remote answered with a status the fetch state machine does not
    /// handle (or retries for it were already spent).
    #[error("unexpected status code {status} on {operation}")]
    UnexpectedStatusCode {
        /// The HTTP status received.
        status: u16,
        /// The operation that observed it (`fetch`, `check`, `redirect`).
        operation: &'static str,
    },

    /// Refreshing the post-redirect blob URL failed.
    #[error("failed to refresh blob URL (status {status}): {reason}")]
    FailedToRefreshUrl {
        /// The status that triggered the refresh.
        status: u16,
        /// Redacted description of the refresh failure.
        reason: String,
    },

    /// The transport gave up after exhausting its retry budget.
    #[error("{method} {url:?}: giving up request after {attempts} attempt(s){cause}")]
    GivingUp {
        /// HTTP method of the abandoned request.
        method: String,
        /// Redacted request URL.
        url: String,
        /// Number of attempts made.
        attempts: u32,
        /// `": <cause>"` when a transport error was the last failure, empty
        /// when the final attempt produced a retryable status.
        cause: String,
    },

    /// A request could not be attempted at all (builder failure, non-cloneable
    /// request, invalid header value).
    #[error("request failed: {0}")]
    RequestFailed(String),

    /// The authorization step rejected the outgoing request.
    #[error("failed to authorize request: {0}")]
    FailedToAuthorizeRequest(String),

    /// The challenge handler could not answer a challenge.
    #[error("failed to handle challenge: {0}")]
    FailedToHandleChallenge(String),

    /// No usable challenge was present on an auth-required response.
    #[error("no supported challenge in WWW-Authenticate {header:?}")]
    UnsupportedChallenge {
        /// The raw header value, for diagnostics.
        header: String,
    },

    /// The token endpoint refused the exchange.
    #[error("token exchange failed (status {status}): {reason}")]
    TokenExchangeFailed {
        /// Status returned by the realm.
        status: u16,
        /// Response body or transport failure, redacted.
        reason: String,
    },

    /// The token endpoint answered 200 with an undecodable body.
    #[error("cannot decode token response: {0}")]
    TokenDecode(String),

    /// A credential provider in the chain failed.
    #[error("credential provider failed for {host:?}: {reason}")]
    CredentialProvider {
        /// The host credentials were requested for.
        host: String,
        /// The provider's failure.
        reason: String,
    },

    /// The supplied image reference did not match the reference grammar.
    #[error("invalid image reference {0:?}")]
    InvalidReference(String),

    /// No handler accepted the descriptor and the default fetcher also
    /// failed; carries the joined handler errors.
    #[error("no handler could provide the blob: {0}")]
    NoHandler(String),

    /// The parts of a ranged response did not cover a requested region.
    #[error("fetched parts did not cover region {region}")]
    UncoveredRegion {
        /// The region that went unserved, as `begin-end`.
        region: String,
    },
}
