//! Bearer-token (and Basic) challenge handling.
//!
//! [`BearerAuthHandler`] implements [`AuthHandler`] for the Docker v2
//! distribution auth flow: it parses `WWW-Authenticate`, exchanges
//! credentials for a bearer token at the challenge realm, and caches the
//! result per `{host, scope}`. The exchange goes through the plain retrying
//! transport only; routing it through an [`crate::auth::AuthClient`] would
//! recurse on the token endpoint.

use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use http_auth::parser::ChallengeParser;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, WWW_AUTHENTICATE};
use reqwest::{Method, Request, Url};
use serde::Deserialize;
use tracing::debug;

use crate::auth::{authority, AuthHandler};
use crate::credentials::{CredentialChain, Credentials};
use crate::errors::{FetchError, Result};
use crate::retry::RetryClient;
use crate::scope::ScopeSet;
use crate::token_cache::{CachedCredential, TokenCache};

/// A challenge parsed out of `WWW-Authenticate`.
#[derive(Debug, PartialEq, Eq)]
enum ParsedChallenge {
    Bearer {
        realm: String,
        service: Option<String>,
        scope: Option<String>,
    },
    Basic,
}

/// Bearer-token challenge handler with an in-process token cache.
pub struct BearerAuthHandler {
    /// Token-endpoint client. Deliberately the retrying transport, not the
    /// auth transport.
    client: Arc<RetryClient>,
    credentials: CredentialChain,
    cache: TokenCache,
}

impl BearerAuthHandler {
    /// Creates a handler exchanging tokens through `client` with credentials
    /// from `credentials`.
    pub fn new(client: Arc<RetryClient>, credentials: CredentialChain) -> Self {
        BearerAuthHandler {
            client,
            credentials,
            cache: TokenCache::default(),
        }
    }

    async fn exchange_token(
        &self,
        realm: &str,
        service: Option<&str>,
        scopes: &[&str],
        host: &str,
    ) -> Result<(String, Option<u64>)> {
        let mut url = Url::parse(realm)
            .map_err(|e| FetchError::FailedToHandleChallenge(format!("bad realm {realm:?}: {e}")))?;
        {
            let mut pairs = url.query_pairs_mut();
            if let Some(service) = service {
                pairs.append_pair("service", service);
            }
            for scope in scopes {
                pairs.append_pair("scope", scope);
            }
        }
        debug!(realm, ?service, ?scopes, "exchanging credentials for token");

        let mut req = Request::new(Method::GET, url);
        if let Some(creds) = self.credentials.get(host)? {
            req.headers_mut()
                .insert(AUTHORIZATION, basic_auth_value(&creds)?);
        }
        let resp = self.client.execute(req).await?;
        let status = resp.status();
        if status != reqwest::StatusCode::OK {
            let reason = resp.text().await.unwrap_or_default();
            return Err(FetchError::TokenExchangeFailed {
                status: status.as_u16(),
                reason,
            });
        }
        let body = resp
            .bytes()
            .await
            .map_err(|e| FetchError::TokenDecode(e.to_string()))?;
        let token: TokenResponse =
            serde_json::from_slice(&body).map_err(|e| FetchError::TokenDecode(e.to_string()))?;
        let expires_in = token.expires_in;
        let token = token
            .token
            .or(token.access_token)
            .ok_or_else(|| FetchError::TokenDecode("response carries no token".into()))?;
        Ok((token, expires_in))
    }
}

#[async_trait]
impl AuthHandler for BearerAuthHandler {
    async fn authorize(&self, req: &mut Request, scope: &ScopeSet) -> Result<()> {
        let host = authority(req.url());
        if let Some(credential) = self.cache.get(&host, &scope.to_string()).await {
            let value = HeaderValue::from_str(&credential.header_value())
                .map_err(|e| FetchError::FailedToAuthorizeRequest(e.to_string()))?;
            req.headers_mut().insert(AUTHORIZATION, value);
        }
        Ok(())
    }

    async fn handle_challenge(
        &self,
        host: &str,
        headers: &HeaderMap,
        scope: &ScopeSet,
    ) -> Result<()> {
        let raw = headers
            .get(WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| FetchError::UnsupportedChallenge {
                header: String::new(),
            })?;
        let challenge = parse_challenge(raw)?;
        let scope_key = scope.to_string();

        // Upstream docker authorizers only refresh a token after two
        // consecutive 401s for the same URL; because this handler owns its
        // cache, a challenge simply drops the stale entry and fetches anew.
        self.cache.invalidate(host, &scope_key).await;

        match challenge {
            ParsedChallenge::Bearer {
                realm,
                service,
                scope: challenge_scope,
            } => {
                // The challenge's own scope wins when present; it is what
                // the registry says the token must cover.
                let scopes: Vec<&str> = match &challenge_scope {
                    Some(s) => s.split(' ').filter(|s| !s.is_empty()).collect(),
                    None => scope.iter().collect(),
                };
                let (token, expires_in) = self
                    .exchange_token(&realm, service.as_deref(), &scopes, host)
                    .await?;
                self.cache
                    .insert(host, &scope_key, CachedCredential::Bearer(token), expires_in)
                    .await;
                Ok(())
            }
            ParsedChallenge::Basic => {
                let creds = self.credentials.get(host)?.ok_or_else(|| {
                    FetchError::FailedToHandleChallenge(format!(
                        "no credentials available for Basic challenge from {host:?}"
                    ))
                })?;
                let encoded = BASE64.encode(format!("{}:{}", creds.username, creds.secret));
                self.cache
                    .insert(host, &scope_key, CachedCredential::Basic(encoded), None)
                    .await;
                Ok(())
            }
        }
    }
}

/// Picks the challenge to answer from a `WWW-Authenticate` value: the first
/// Bearer challenge when one is present, otherwise the first Basic.
fn parse_challenge(value: &str) -> Result<ParsedChallenge> {
    let mut basic_seen = false;
    for challenge in ChallengeParser::new(value).flatten() {
        if challenge.scheme.eq_ignore_ascii_case("Bearer") {
            let mut realm = None;
            let mut service = None;
            let mut scope = None;
            for (key, param) in &challenge.params {
                if key.eq_ignore_ascii_case("realm") {
                    realm = Some(param.to_unescaped());
                } else if key.eq_ignore_ascii_case("service") {
                    service = Some(param.to_unescaped());
                } else if key.eq_ignore_ascii_case("scope") {
                    scope = Some(param.to_unescaped());
                }
            }
            let realm = realm.ok_or_else(|| FetchError::UnsupportedChallenge {
                header: value.to_string(),
            })?;
            return Ok(ParsedChallenge::Bearer {
                realm,
                service,
                scope,
            });
        }
        if challenge.scheme.eq_ignore_ascii_case("Basic") {
            basic_seen = true;
        }
    }
    if basic_seen {
        return Ok(ParsedChallenge::Basic);
    }
    Err(FetchError::UnsupportedChallenge {
        header: value.to_string(),
    })
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
    expires_in: Option<u64>,
}

fn basic_auth_value(creds: &Credentials) -> Result<HeaderValue> {
    let encoded = BASE64.encode(format!("{}:{}", creds.username, creds.secret));
    let mut value = HeaderValue::from_str(&format!("Basic {encoded}"))
        .map_err(|e| FetchError::FailedToAuthorizeRequest(e.to_string()))?;
    value.set_sensitive(true);
    Ok(value)
}
