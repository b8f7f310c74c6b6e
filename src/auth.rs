//! The authenticating transport.
//!
//! [`AuthClient`] composes over [`RetryClient`]: it attaches global headers,
//! lets an [`AuthHandler`] authorize each outgoing request, and evaluates an
//! [`AuthPolicy`] against each response. When the policy calls for
//! authentication the handler answers the challenge and the request is
//! re-sent exactly once; the second response is returned regardless of
//! status.

use std::sync::Arc;

use async_trait::async_trait;
use lazy_static::lazy_static;
use reqwest::header::{HeaderMap, CONTENT_TYPE};
use reqwest::{Request, Response, StatusCode, Url};
use serde::Deserialize;
use tracing::{debug, info};

use crate::errors::{FetchError, Result};
use crate::regexp::{must_compile, S3_ERROR_CODE_REGEXP};
use crate::retry::{drain, RetryClient};
use crate::scope::ScopeSet;

/// The message ECR puts in a 403 body when the authorization token has
/// expired.
pub const ECR_TOKEN_EXPIRED_MESSAGE: &str =
    "Your authorization token has expired. Reauthenticate and try again.";

/// The `<Code>` S3 puts in a 400 body when a pre-signed URL's token has
/// expired.
pub const S3_TOKEN_EXPIRED_CODE: &str = "ExpiredToken";

lazy_static! {
    static ref S3_ERROR_CODE_RE: regex::Regex = must_compile(S3_ERROR_CODE_REGEXP);
}

/// Challenge-response authentication seam.
///
/// Implementations own credential caching. The [`AuthClient`] calls
/// `authorize` before every send and `handle_challenge` when the policy says
/// a response warrants authentication.
#[async_trait]
pub trait AuthHandler: Send + Sync {
    /// Attaches authorization to `req` if a credential is cached for its
    /// host and `scope`. Endpoints the handler has never seen go out
    /// anonymous.
    async fn authorize(&self, req: &mut Request, scope: &ScopeSet) -> Result<()>;

    /// Answers the challenge carried by a response from `host`, refreshing
    /// whatever credential the handler caches for `{host, scope}`.
    async fn handle_challenge(
        &self,
        host: &str,
        headers: &HeaderMap,
        scope: &ScopeSet,
    ) -> Result<()>;
}

/// What a response warrants, as judged by an [`AuthPolicy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthDecision {
    /// Return the response to the caller unchanged.
    Ignore,
    /// Answer the challenge and re-send once.
    Authenticate,
    /// The backend URL's signature expired; surface a normalized 401 so the
    /// blob fetcher refreshes its URL.
    RefreshUrl,
}

/// Policy deciding which responses warrant authentication.
#[derive(Debug, Clone, Copy, Default)]
pub enum AuthPolicy {
    /// Only a 401 warrants authentication.
    StatusOnly,
    /// Additionally recognises token expiry disguised as other statuses:
    /// ECR's 403 with an expiry message (re-authenticate) and S3's 400 with
    /// an `ExpiredToken` XML body (refresh the signed URL).
    #[default]
    RegistryAware,
}

impl AuthPolicy {
    /// Whether the policy must inspect the body for `status`.
    pub(crate) fn wants_body(&self, status: StatusCode) -> bool {
        matches!(self, AuthPolicy::RegistryAware)
            && matches!(
                status,
                StatusCode::FORBIDDEN | StatusCode::BAD_REQUEST
            )
    }

    /// Judges a response. `body` is empty unless [`wants_body`](Self::wants_body)
    /// asked for it.
    pub(crate) fn decide(
        &self,
        status: StatusCode,
        content_type: Option<&str>,
        body: &[u8],
    ) -> AuthDecision {
        if status == StatusCode::UNAUTHORIZED {
            return AuthDecision::Authenticate;
        }
        if matches!(self, AuthPolicy::StatusOnly) {
            return AuthDecision::Ignore;
        }
        match status {
            // ECR returns 403 on credential expiration with a Docker v2
            // error body whose message names the expiry.
            StatusCode::FORBIDDEN => {
                if registry_error_messages(body)
                    .iter()
                    .any(|m| m == ECR_TOKEN_EXPIRED_MESSAGE)
                {
                    AuthDecision::Authenticate
                } else {
                    AuthDecision::Ignore
                }
            }
            // S3 returns 400 on token expiry with an XML error document;
            // the pre-signed URL has to be re-resolved, not the token.
            StatusCode::BAD_REQUEST => {
                let is_xml = content_type
                    .map(|ct| ct.split(';').next().unwrap_or("").trim() == "application/xml")
                    .unwrap_or(false);
                if is_xml && s3_error_code(body).as_deref() == Some(S3_TOKEN_EXPIRED_CODE) {
                    AuthDecision::RefreshUrl
                } else {
                    AuthDecision::Ignore
                }
            }
            _ => AuthDecision::Ignore,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RegistryErrorDetail {
    #[serde(default)]
    #[allow(dead_code)]
    code: String,
    #[serde(default)]
    message: String,
}

/// Registries emit the Docker v2 error format either as a bare list or
/// wrapped in an `errors` object; accept both.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RegistryErrorBody {
    Wrapped { errors: Vec<RegistryErrorDetail> },
    Bare(Vec<RegistryErrorDetail>),
}

fn registry_error_messages(body: &[u8]) -> Vec<String> {
    match serde_json::from_slice::<RegistryErrorBody>(body) {
        Ok(RegistryErrorBody::Wrapped { errors }) | Ok(RegistryErrorBody::Bare(errors)) => {
            errors.into_iter().map(|e| e.message).collect()
        }
        Err(_) => Vec::new(),
    }
}

fn s3_error_code(body: &[u8]) -> Option<String> {
    let text = std::str::from_utf8(body).ok()?;
    S3_ERROR_CODE_RE
        .captures(text)
        .map(|c| c[1].to_string())
}

/// A response returned by the auth transport.
///
/// Carries the status after policy normalization: an S3 expired-signature
/// 400 is reported as 401 so callers take their URL-refresh path. The inner
/// body is live for statuses the policy did not have to inspect.
pub struct RegistryResponse {
    status: StatusCode,
    inner: ResponseBody,
}

enum ResponseBody {
    Live(Response),
    Consumed { headers: HeaderMap, url: Url },
}

impl RegistryResponse {
    fn live(resp: Response) -> Self {
        RegistryResponse {
            status: resp.status(),
            inner: ResponseBody::Live(resp),
        }
    }

    fn consumed(status: StatusCode, headers: HeaderMap, url: Url) -> Self {
        RegistryResponse {
            status,
            inner: ResponseBody::Consumed { headers, url },
        }
    }

    /// The (possibly normalized) status.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Response headers.
    pub fn headers(&self) -> &HeaderMap {
        match &self.inner {
            ResponseBody::Live(resp) => resp.headers(),
            ResponseBody::Consumed { headers, .. } => headers,
        }
    }

    /// The final request URL, after any redirects.
    pub fn url(&self) -> &Url {
        match &self.inner {
            ResponseBody::Live(resp) => resp.url(),
            ResponseBody::Consumed { url, .. } => url,
        }
    }

    /// The underlying response, when its body has not been consumed by
    /// policy evaluation. Success responses are always live.
    pub fn into_response(self) -> Option<Response> {
        match self.inner {
            ResponseBody::Live(resp) => Some(resp),
            ResponseBody::Consumed { .. } => None,
        }
    }

    /// Drains whatever is left of the body so the connection is reusable.
    pub async fn drain(self) {
        if let ResponseBody::Live(resp) = self.inner {
            drain(resp).await;
        }
    }
}

/// An HTTP client that answers registry authentication challenges.
///
/// The token exchange performed by the handler must go through the plain
/// retrying transport, never through an `AuthClient`, or challenge handling
/// would recurse on the token endpoint.
pub struct AuthClient {
    client: Arc<RetryClient>,
    handler: Arc<dyn AuthHandler>,
    policy: AuthPolicy,
    headers: HeaderMap,
}

impl AuthClient {
    /// Creates an auth client over `client` with the default
    /// (registry-aware) policy and no global headers.
    pub fn new(client: Arc<RetryClient>, handler: Arc<dyn AuthHandler>) -> Self {
        AuthClient {
            client,
            handler,
            policy: AuthPolicy::default(),
            headers: HeaderMap::new(),
        }
    }

    /// Replaces the authentication policy.
    pub fn with_policy(mut self, policy: AuthPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Sets headers attached to every request (notably the product
    /// User-Agent).
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    /// The inner retrying client.
    pub fn retry_client(&self) -> &Arc<RetryClient> {
        &self.client
    }

    /// A clone of this auth client over a different retrying client, sharing
    /// handler, policy and headers. Used for per-mirror timeout overrides.
    pub fn clone_with_client(&self, client: Arc<RetryClient>) -> Self {
        AuthClient {
            client,
            handler: Arc::clone(&self.handler),
            policy: self.policy,
            headers: self.headers.clone(),
        }
    }

    /// Sends `req`, authenticating at most once.
    ///
    /// `scope` is the token scope set the request is made under; it is
    /// preserved verbatim for the re-sent request after a challenge.
    pub async fn execute(&self, req: Request, scope: &ScopeSet) -> Result<RegistryResponse> {
        let resend = req
            .try_clone()
            .ok_or_else(|| FetchError::RequestFailed("request is not cloneable".into()))?;

        let resp = self.round_trip(req, scope).await?;
        let status = resp.status();

        if self.policy.wants_body(status) {
            let headers = resp.headers().clone();
            let url = resp.url().clone();
            let content_type = headers
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned);
            let body = resp.bytes().await.unwrap_or_default();
            match self.policy.decide(status, content_type.as_deref(), &body) {
                AuthDecision::Authenticate => {
                    info!(status = status.as_u16(), "received auth-gated status, authenticating");
                    self.handler
                        .handle_challenge(&authority(&url), &headers, scope)
                        .await?;
                    let second = self.round_trip(resend, scope).await?;
                    Ok(RegistryResponse::live(second))
                }
                AuthDecision::RefreshUrl => {
                    debug!(url = %crate::redact::safe_url(&url), "signed URL expired, reporting as unauthorized");
                    Ok(RegistryResponse::consumed(
                        StatusCode::UNAUTHORIZED,
                        headers,
                        url,
                    ))
                }
                AuthDecision::Ignore => Ok(RegistryResponse::consumed(status, headers, url)),
            }
        } else {
            match self.policy.decide(status, None, &[]) {
                AuthDecision::Authenticate => {
                    info!(status = status.as_u16(), "received auth challenge, authenticating");
                    let headers = resp.headers().clone();
                    let host = authority(resp.url());
                    drain(resp).await;
                    self.handler.handle_challenge(&host, &headers, scope).await?;
                    let second = self.round_trip(resend, scope).await?;
                    Ok(RegistryResponse::live(second))
                }
                _ => Ok(RegistryResponse::live(resp)),
            }
        }
    }

    async fn round_trip(&self, mut req: Request, scope: &ScopeSet) -> Result<Response> {
        for (name, value) in &self.headers {
            req.headers_mut().insert(name, value.clone());
        }
        self.handler
            .authorize(&mut req, scope)
            .await
            .map_err(|e| FetchError::FailedToAuthorizeRequest(e.to_string()))?;
        self.client.execute(req).await
    }
}

/// `host[:port]` of a URL, the key credential and token caches use.
pub(crate) fn authority(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_policy_only_authenticates_401() {
        let p = AuthPolicy::StatusOnly;
        assert_eq!(
            p.decide(StatusCode::UNAUTHORIZED, None, &[]),
            AuthDecision::Authenticate
        );
        assert_eq!(p.decide(StatusCode::FORBIDDEN, None, &[]), AuthDecision::Ignore);
        assert_eq!(
            p.decide(StatusCode::BAD_REQUEST, Some("application/xml"), b"<Error><Code>ExpiredToken</Code></Error>"),
            AuthDecision::Ignore
        );
    }

    #[test]
    fn ecr_expiry_message_authenticates() {
        let body = format!(r#"[{{"code":"DENIED","message":"{ECR_TOKEN_EXPIRED_MESSAGE}"}}]"#);
        assert_eq!(
            AuthPolicy::RegistryAware.decide(StatusCode::FORBIDDEN, None, body.as_bytes()),
            AuthDecision::Authenticate
        );
    }

    #[test]
    fn ecr_expiry_message_wrapped_in_errors_object() {
        let body = format!(
            r#"{{"errors":[{{"code":"DENIED","message":"{ECR_TOKEN_EXPIRED_MESSAGE}"}}]}}"#
        );
        assert_eq!(
            AuthPolicy::RegistryAware.decide(StatusCode::FORBIDDEN, None, body.as_bytes()),
            AuthDecision::Authenticate
        );
    }

    #[test]
    fn plain_403_is_ignored() {
        assert_eq!(
            AuthPolicy::RegistryAware.decide(
                StatusCode::FORBIDDEN,
                None,
                br#"[{"code":"DENIED","message":"no such repository"}]"#
            ),
            AuthDecision::Ignore
        );
        assert_eq!(
            AuthPolicy::RegistryAware.decide(StatusCode::FORBIDDEN, None, b"not json"),
            AuthDecision::Ignore
        );
    }

    #[test]
    fn s3_expired_token_asks_for_url_refresh() {
        let body = b"<Error><Code>ExpiredToken</Code><Message>expired</Message></Error>";
        assert_eq!(
            AuthPolicy::RegistryAware.decide(StatusCode::BAD_REQUEST, Some("application/xml"), body),
            AuthDecision::RefreshUrl
        );
    }

    #[test]
    fn s3_400_requires_xml_content_type() {
        let body = b"<Error><Code>ExpiredToken</Code></Error>";
        assert_eq!(
            AuthPolicy::RegistryAware.decide(StatusCode::BAD_REQUEST, Some("text/plain"), body),
            AuthDecision::Ignore
        );
        assert_eq!(
            AuthPolicy::RegistryAware.decide(StatusCode::BAD_REQUEST, None, body),
            AuthDecision::Ignore
        );
    }

    #[test]
    fn s3_other_codes_are_ignored() {
        let body = b"<Error><Code>AccessDenied</Code></Error>";
        assert_eq!(
            AuthPolicy::RegistryAware.decide(StatusCode::BAD_REQUEST, Some("application/xml"), body),
            AuthDecision::Ignore
        );
    }

    #[test]
    fn authority_includes_non_default_ports() {
        let url = Url::parse("http://localhost:5000/v2/").unwrap();
        assert_eq!(authority(&url), "localhost:5000");
        let url = Url::parse("https://registry-1.docker.io/v2/").unwrap();
        assert_eq!(authority(&url), "registry-1.docker.io");
    }
}
