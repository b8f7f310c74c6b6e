use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::RwLock;
use tracing::debug;

/// A credential obtained by answering a challenge, in cached form.
#[derive(Clone)]
pub(crate) enum CachedCredential {
    /// A bearer token from the registry's token endpoint.
    Bearer(String),
    /// `base64(username:secret)` for registries using Basic auth.
    Basic(String),
}

impl CachedCredential {
    /// Renders the `Authorization` header value.
    pub(crate) fn header_value(&self) -> String {
        match self {
            CachedCredential::Bearer(token) => format!("Bearer {token}"),
            CachedCredential::Basic(encoded) => format!("Basic {encoded}"),
        }
    }
}

impl std::fmt::Debug for CachedCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never expose credential material through Debug.
        match self {
            CachedCredential::Bearer(_) => f.debug_tuple("Bearer").field(&"<redacted>").finish(),
            CachedCredential::Basic(_) => f.debug_tuple("Basic").field(&"<redacted>").finish(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct TokenCacheKey {
    registry: String,
    scope: String,
}

struct TokenCacheValue {
    credential: CachedCredential,
    expiration: u64,
}

/// In-process cache of credentials keyed by `{registry, scope}`.
///
/// Tokens live only as long as the process. Concurrent refreshes for the
/// same key are tolerated; the last write wins.
#[derive(Clone)]
pub(crate) struct TokenCache {
    tokens: Arc<RwLock<BTreeMap<TokenCacheKey, TokenCacheValue>>>,
    /// Expiration in seconds to assume when the token endpoint doesn't say.
    pub default_expiration_secs: u64,
}

impl Default for TokenCache {
    fn default() -> Self {
        // The Docker token spec says a token without an expiry should be
        // treated as valid for 60 seconds.
        TokenCache::new(60)
    }
}

impl TokenCache {
    pub(crate) fn new(default_expiration_secs: u64) -> Self {
        TokenCache {
            tokens: Arc::new(RwLock::new(BTreeMap::new())),
            default_expiration_secs,
        }
    }

    pub(crate) async fn insert(
        &self,
        registry: &str,
        scope: &str,
        credential: CachedCredential,
        expires_in: Option<u64>,
    ) {
        let expiration = match credential {
            CachedCredential::Basic(_) => u64::MAX,
            CachedCredential::Bearer(_) => {
                now_epoch() + expires_in.unwrap_or(self.default_expiration_secs)
            }
        };
        debug!(%registry, %scope, %expiration, "inserting credential");
        self.tokens.write().await.insert(
            TokenCacheKey {
                registry: registry.to_string(),
                scope: scope.to_string(),
            },
            TokenCacheValue {
                credential,
                expiration,
            },
        );
    }

    pub(crate) async fn get(&self, registry: &str, scope: &str) -> Option<CachedCredential> {
        let key = TokenCacheKey {
            registry: registry.to_string(),
            scope: scope.to_string(),
        };
        match self.tokens.read().await.get(&key) {
            Some(TokenCacheValue {
                credential,
                expiration,
            }) => {
                if now_epoch() > *expiration {
                    debug!(registry = %key.registry, scope = %key.scope, expired = true, "credential lookup");
                    None
                } else {
                    debug!(registry = %key.registry, scope = %key.scope, expired = false, "credential lookup");
                    Some(credential.clone())
                }
            }
            None => {
                debug!(registry = %key.registry, scope = %key.scope, miss = true, "credential lookup");
                None
            }
        }
    }

    /// Drops the cached credential for `{registry, scope}`, forcing the next
    /// challenge to fetch a fresh one.
    pub(crate) async fn invalidate(&self, registry: &str, scope: &str) {
        let key = TokenCacheKey {
            registry: registry.to_string(),
            scope: scope.to_string(),
        };
        self.tokens.write().await.remove(&key);
    }
}

fn now_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("Time went backwards")
        .as_secs()
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn bearer_round_trip() {
        let cache = TokenCache::default();
        cache
            .insert(
                "registry-1.docker.io",
                "repository:library/ubuntu:pull",
                CachedCredential::Bearer("T".into()),
                Some(3600),
            )
            .await;
        let cred = cache
            .get("registry-1.docker.io", "repository:library/ubuntu:pull")
            .await
            .expect("credential is cached");
        assert_eq!(cred.header_value(), "Bearer T");
    }

    #[tokio::test]
    async fn scope_is_part_of_the_key() {
        let cache = TokenCache::default();
        cache
            .insert(
                "reg",
                "repository:a/b:pull",
                CachedCredential::Bearer("T".into()),
                None,
            )
            .await;
        assert!(cache.get("reg", "repository:c/d:pull").await.is_none());
        assert!(cache.get("other", "repository:a/b:pull").await.is_none());
    }

    #[tokio::test]
    async fn invalidate_removes_entry() {
        let cache = TokenCache::default();
        cache
            .insert("reg", "s", CachedCredential::Bearer("T".into()), None)
            .await;
        cache.invalidate("reg", "s").await;
        assert!(cache.get("reg", "s").await.is_none());
    }

    #[tokio::test]
    async fn expired_token_is_a_miss() {
        let cache = TokenCache::new(0);
        cache
            .insert("reg", "s", CachedCredential::Bearer("T".into()), Some(0))
            .await;
        // Entries expire strictly after their expiration second; step past it.
        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
        assert!(cache.get("reg", "s").await.is_none());
    }

    #[tokio::test]
    async fn basic_credentials_do_not_expire() {
        let cache = TokenCache::new(0);
        cache
            .insert(
                "reg",
                "s",
                CachedCredential::Basic("dXNlcjpwdw==".into()),
                None,
            )
            .await;
        let cred = cache.get("reg", "s").await.expect("basic is cached");
        assert_eq!(cred.header_value(), "Basic dXNlcjpwdw==");
    }

    #[test]
    fn debug_never_prints_material() {
        let s = format!("{:?}", CachedCredential::Bearer("super-secret".into()));
        assert!(!s.contains("super-secret"));
    }
}
