//! Registry host resolution: mirrors first, canonical host last.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bitflags::bitflags;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use tokio::sync::RwLock;
use tracing::debug;

use crate::auth::{AuthClient, AuthPolicy};
use crate::bearer::BearerAuthHandler;
use crate::config::{RegistryConfig, RetryConfig};
use crate::credentials::CredentialChain;
use crate::errors::Result;
use crate::reference::ImageReference;
use crate::retry::RetryClient;

/// Product User-Agent sent with every request.
pub const PRODUCT_USER_AGENT: &str = concat!("oci-rangefetch/", env!("CARGO_PKG_VERSION"));

/// The path prefix of the distribution v2 API.
pub const V2_PATH: &str = "/v2";

bitflags! {
    /// What a host can be used for.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HostCapabilities: u8 {
        /// Blob and manifest pulls.
        const PULL = 0b001;
        /// Tag-to-digest resolution.
        const RESOLVE = 0b010;
        /// Pushes.
        const PUSH = 0b100;
    }
}

/// Scheme a host is reached over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    /// Plaintext, for localhost and explicitly insecure mirrors.
    Http,
    /// TLS.
    Https,
}

impl Scheme {
    /// The URL scheme string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

/// One candidate host for serving a reference.
#[derive(Clone)]
pub struct RegistryHost {
    /// Client to reach the host with (carries per-mirror deadlines).
    pub client: Arc<AuthClient>,
    /// Hostname (and optional port).
    pub host: String,
    /// Scheme to dial.
    pub scheme: Scheme,
    /// API path prefix, `/v2`.
    pub path: String,
    /// What the host may be used for.
    pub capabilities: HostCapabilities,
}

impl std::fmt::Debug for RegistryHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryHost")
            .field("host", &self.host)
            .field("scheme", &self.scheme.as_str())
            .field("path", &self.path)
            .field("capabilities", &self.capabilities)
            .finish()
    }
}

/// Headers attached to every outgoing request.
pub fn global_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(USER_AGENT, HeaderValue::from_static(PRODUCT_USER_AGENT));
    headers
}

/// Produces ordered host candidate lists for image references and memoizes
/// them.
///
/// For each canonical registry the configured mirrors come first, then the
/// canonical host itself with the shared global client. The memo map is
/// never purged; concurrent resolutions of the same host may both compute
/// the list and the last writer wins.
pub struct HostResolver {
    client: Arc<AuthClient>,
    http_config: RetryConfig,
    registry_config: RegistryConfig,
    host_map: RwLock<HashMap<String, Arc<Vec<RegistryHost>>>>,
}

impl HostResolver {
    /// Wires up the whole client stack: a shared retrying transport, a
    /// bearer challenge handler over `credentials`, and the registry-aware
    /// auth policy.
    pub fn new(
        http_config: RetryConfig,
        registry_config: RegistryConfig,
        credentials: CredentialChain,
    ) -> Result<Self> {
        let retry = Arc::new(RetryClient::new(&http_config)?);
        let handler = Arc::new(BearerAuthHandler::new(Arc::clone(&retry), credentials));
        let client = Arc::new(
            AuthClient::new(retry, handler)
                .with_policy(AuthPolicy::RegistryAware)
                .with_headers(global_headers()),
        );
        Ok(Self::with_client(client, http_config, registry_config))
    }

    /// Uses an existing auth client as the shared global client.
    pub fn with_client(
        client: Arc<AuthClient>,
        http_config: RetryConfig,
        registry_config: RegistryConfig,
    ) -> Self {
        HostResolver {
            client,
            http_config,
            registry_config,
            host_map: RwLock::new(HashMap::new()),
        }
    }

    /// The shared global auth client.
    pub fn client(&self) -> &Arc<AuthClient> {
        &self.client
    }

    /// The ordered candidate hosts for `reference`: configured mirrors, then
    /// the canonical registry (with `docker.io` rewritten to its real API
    /// host).
    pub async fn resolve(&self, reference: &ImageReference) -> Arc<Vec<RegistryHost>> {
        let canonical = reference.resolve_registry();
        if let Some(hosts) = self.host_map.read().await.get(canonical) {
            return Arc::clone(hosts);
        }

        let mut hosts = Vec::new();
        for mirror in self.registry_config.mirrors(canonical) {
            let scheme = if match_localhost(&mirror.host) || mirror.insecure {
                Scheme::Http
            } else {
                Scheme::Https
            };
            // A positive timeout derives a client sharing the connection
            // pool; negative means unlimited; zero inherits the global
            // client unchanged.
            let client = match mirror.request_timeout_sec {
                t if t > 0 => {
                    let retry = self
                        .client
                        .retry_client()
                        .with_request_timeout(Some(Duration::from_secs(t as u64)));
                    Arc::new(self.client.clone_with_client(Arc::new(retry)))
                }
                t if t < 0 => {
                    let retry = self.client.retry_client().with_request_timeout(None);
                    Arc::new(self.client.clone_with_client(Arc::new(retry)))
                }
                _ => Arc::clone(&self.client),
            };
            hosts.push(RegistryHost {
                client,
                host: mirror.host.clone(),
                scheme,
                path: V2_PATH.to_string(),
                capabilities: HostCapabilities::PULL | HostCapabilities::RESOLVE,
            });
        }

        let canonical_scheme = if match_localhost(canonical) {
            Scheme::Http
        } else {
            Scheme::Https
        };
        hosts.push(RegistryHost {
            client: Arc::clone(&self.client),
            host: canonical.to_string(),
            scheme: canonical_scheme,
            path: V2_PATH.to_string(),
            capabilities: HostCapabilities::PULL | HostCapabilities::RESOLVE,
        });

        debug!(registry = canonical, hosts = hosts.len(), "resolved host candidates");
        let hosts = Arc::new(hosts);
        self.host_map
            .write()
            .await
            .insert(canonical.to_string(), Arc::clone(&hosts));
        hosts
    }

    /// The retry configuration the resolver was built with.
    pub fn http_config(&self) -> &RetryConfig {
        &self.http_config
    }
}

/// True when `host` (with optional port) is a localhost address.
pub fn match_localhost(host: &str) -> bool {
    let bare = strip_port(host);
    if bare == "localhost" {
        return true;
    }
    let bare = bare.trim_start_matches('[').trim_end_matches(']');
    bare.parse::<std::net::IpAddr>()
        .map(|ip| ip.is_loopback())
        .unwrap_or(false)
}

fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        // Bracketed IPv6, possibly with a port after the bracket.
        return match rest.split_once(']') {
            Some((addr, _)) => addr,
            None => host,
        };
    }
    // More than one colon means a bare IPv6 address without a port.
    if host.matches(':').count() > 1 {
        return host;
    }
    match host.split_once(':') {
        Some((bare, _)) => bare,
        None => host,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn resolver(registry_config: RegistryConfig) -> HostResolver {
        HostResolver::new(RetryConfig::default(), registry_config, CredentialChain::new())
            .expect("resolver builds")
    }

    fn config_with_mirrors(host: &str, mirrors: &str) -> RegistryConfig {
        serde_json::from_str(&format!(r#"{{"hosts": {{"{host}": {{"mirrors": {mirrors}}}}}}}"#))
            .unwrap()
    }

    #[test]
    fn localhost_patterns() {
        assert!(match_localhost("localhost"));
        assert!(match_localhost("localhost:5000"));
        assert!(match_localhost("127.0.0.1"));
        assert!(match_localhost("127.0.0.1:5000"));
        assert!(match_localhost("::1"));
        assert!(match_localhost("[::1]:5000"));
        assert!(!match_localhost("registry-1.docker.io"));
        assert!(!match_localhost("mirror.internal:5000"));
        assert!(!match_localhost("10.0.0.1"));
    }

    #[tokio::test]
    async fn mirrors_come_before_canonical() {
        let resolver = resolver(config_with_mirrors(
            "ghcr.io",
            r#"[{"host": "mirror-a.internal"}, {"host": "mirror-b.internal"}]"#,
        ));
        let reference: ImageReference = "ghcr.io/org/app:v1".parse().unwrap();
        let hosts = resolver.resolve(&reference).await;
        let names: Vec<&str> = hosts.iter().map(|h| h.host.as_str()).collect();
        assert_eq!(names, ["mirror-a.internal", "mirror-b.internal", "ghcr.io"]);
        for host in hosts.iter() {
            assert_eq!(host.path, "/v2");
            assert!(host.capabilities.contains(HostCapabilities::PULL));
            assert!(host.capabilities.contains(HostCapabilities::RESOLVE));
            assert!(!host.capabilities.contains(HostCapabilities::PUSH));
        }
    }

    #[tokio::test]
    async fn docker_io_is_rewritten() {
        let resolver = resolver(RegistryConfig::default());
        let reference: ImageReference = "docker.io/library/ubuntu:22.04".parse().unwrap();
        let hosts = resolver.resolve(&reference).await;
        assert_eq!(hosts.len(), 1);
        assert_eq!(hosts[0].host, "registry-1.docker.io");
        assert_eq!(hosts[0].scheme, Scheme::Https);
    }

    #[tokio::test]
    async fn insecure_and_localhost_mirrors_use_http() {
        let resolver = resolver(config_with_mirrors(
            "ghcr.io",
            r#"[{"host": "mirror.internal", "insecure": true}, {"host": "localhost:5000"}, {"host": "mirror2.internal"}]"#,
        ));
        let reference: ImageReference = "ghcr.io/org/app:v1".parse().unwrap();
        let hosts = resolver.resolve(&reference).await;
        assert_eq!(hosts[0].scheme, Scheme::Http);
        assert_eq!(hosts[1].scheme, Scheme::Http);
        assert_eq!(hosts[2].scheme, Scheme::Https);
        assert_eq!(hosts[3].scheme, Scheme::Https);
    }

    #[tokio::test]
    async fn resolution_is_memoized_and_stable() {
        let resolver = resolver(config_with_mirrors("ghcr.io", r#"[{"host": "m.internal"}]"#));
        let reference: ImageReference = "ghcr.io/org/app:v1".parse().unwrap();
        let first = resolver.resolve(&reference).await;
        let second = resolver.resolve(&reference).await;
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn per_mirror_timeout_derives_a_client() {
        let resolver = resolver(config_with_mirrors(
            "ghcr.io",
            r#"[{"host": "slow.internal", "request_timeout_sec": 120}, {"host": "plain.internal"}]"#,
        ));
        let reference: ImageReference = "ghcr.io/org/app:v1".parse().unwrap();
        let hosts = resolver.resolve(&reference).await;
        // The timeout mirror gets its own derived client; the plain mirror
        // and the canonical host share the global one.
        assert!(!Arc::ptr_eq(&hosts[0].client, resolver.client()));
        assert!(Arc::ptr_eq(&hosts[1].client, resolver.client()));
        assert!(Arc::ptr_eq(&hosts[2].client, resolver.client()));
    }
}
